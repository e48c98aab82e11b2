//! In-process coordination store.
//!
//! Keys expire lazily: an expired entry is treated as absent by every
//! primitive and removed the next time it is touched. Time is read from the
//! tokio clock so paused-clock tests observe expiry.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{AppendOutcome, CoordinationStore, CreateOutcome, DeleteOutcome, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn scalar(value: &str, expires_at: Instant) -> Self {
        Self {
            value: Value::Scalar(value.to_string()),
            expires_at: Some(expires_at),
        }
    }

    fn list(value: &str, expires_at: Instant) -> Self {
        Self {
            value: Value::List(vec![value.to_string()]),
            expires_at: Some(expires_at),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A [`CoordinationStore`] kept in process memory.
///
/// Sharing one instance between several limiters (via `Arc`) models several
/// processes pointed at the same backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of `key`, or `None` if it is absent or has no TTL.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.read(key, |slot| slot.expires_at.map(|at| at.saturating_duration_since(now)))
            .flatten()
    }

    /// Whether `key` currently holds a live value.
    pub fn contains(&self, key: &str) -> bool {
        self.read(key, |_| ()).is_some()
    }

    /// The scalar value stored at `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        self.read(key, |slot| match &slot.value {
            Value::Scalar(value) => Some(value.clone()),
            Value::List(_) => None,
        })
        .flatten()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, key: &str, f: impl FnOnce(&Slot) -> T) -> Option<T> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(slot) if !slot.is_expired(now) => return Some(f(slot.value())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, slot| slot.is_expired(now));
        }
        None
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<CreateOutcome> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::scalar(value, now + ttl));
                    Ok(CreateOutcome::Created)
                } else {
                    Ok(CreateOutcome::AlreadyExists)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::scalar(value, now + ttl));
                Ok(CreateOutcome::Created)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<DeleteOutcome> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return Ok(DeleteOutcome::Absent);
                }

                let owned = matches!(&occupied.get().value, Value::Scalar(v) if v == expected);
                if owned {
                    occupied.remove();
                    Ok(DeleteOutcome::Deleted)
                } else {
                    Ok(DeleteOutcome::Mismatch)
                }
            }
            Entry::Vacant(_) => Ok(DeleteOutcome::Absent),
        }
    }

    async fn length(&self, key: &str) -> StoreResult<usize> {
        let len = self.read(key, |slot| match &slot.value {
            Value::List(items) => Ok(items.len()),
            Value::Scalar(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        });
        len.unwrap_or(Ok(0))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.contains(key))
    }

    async fn append_if_exists(&self, key: &str, value: &str) -> StoreResult<AppendOutcome> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return Ok(AppendOutcome::Absent);
                }

                match &mut occupied.get_mut().value {
                    Value::List(items) => {
                        items.push(value.to_string());
                        Ok(AppendOutcome::Appended)
                    }
                    Value::Scalar(_) => Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                }
            }
            Entry::Vacant(_) => Ok(AppendOutcome::Absent),
        }
    }

    async fn append_and_expire(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::list(value, now + ttl));
                    return Ok(());
                }

                let slot = occupied.get_mut();
                match &mut slot.value {
                    Value::List(items) => items.push(value.to_string()),
                    Value::Scalar(_) => {
                        return Err(StoreError::WrongType {
                            key: key.to_string(),
                        })
                    }
                }
                slot.expires_at = Some(now + ttl);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::list(value, now + ttl));
                Ok(())
            }
        }
    }
}
