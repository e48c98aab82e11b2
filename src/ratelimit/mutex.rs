//! Lease-based distributed mutex over the coordination store.
//!
//! A lock is a scalar key holding the owner's ID, written with
//! create-if-absent and a TTL. The TTL is the lease: a holder that dies
//! without releasing blocks others for at most one lease. Release is a
//! compare-and-delete so a holder whose lease already lapsed can never
//! remove a lock that has since passed to another owner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use crate::error::{FunnelError, Result};
use crate::store::{CoordinationStore, CreateOutcome, DeleteOutcome, StoreResult};

/// A distributed mutex bound to one store key.
pub(crate) struct DistributedMutex {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lease: Duration,
    max_attempts: u32,
    backoff: Backoff,
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl DistributedMutex {
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        lease: Duration,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            lease,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Acquire the lock, retrying with jitter while it is held elsewhere.
    ///
    /// Store errors count as contention. Once the attempt budget is spent
    /// the result is [`FunnelError::LockUnavailable`].
    pub(crate) async fn acquire(&self) -> Result<LockGuard> {
        let owner = Uuid::new_v4().to_string();

        for attempt in 1..=self.max_attempts {
            // The store starts the TTL somewhere inside the call, so the
            // lease is counted from before the request.
            let requested = Instant::now();
            match self.store.create_if_absent(&self.key, &owner, self.lease).await {
                Ok(CreateOutcome::Created) => {
                    debug!(key = %self.key, owner = %owner, attempt, "Acquired distributed lock");
                    return Ok(LockGuard {
                        store: self.store.clone(),
                        key: self.key.clone(),
                        owner,
                        acquired_at: requested,
                        lease: self.lease,
                        gate: None,
                        released: false,
                    });
                }
                Ok(CreateOutcome::AlreadyExists) => {
                    trace!(key = %self.key, attempt, "Distributed lock held elsewhere");
                }
                Err(e) => {
                    warn!(key = %self.key, attempt, error = %e, "Store error while acquiring lock");
                }
            }

            if attempt < self.max_attempts {
                self.backoff.sleep().await;
            }
        }

        debug!(key = %self.key, attempts = self.max_attempts, "Gave up on distributed lock");
        Err(FunnelError::LockUnavailable {
            key: self.key.clone(),
            attempts: self.max_attempts,
        })
    }
}

/// Proof of holding a [`DistributedMutex`].
///
/// Released exactly once: explicitly through [`release`](Self::release), or
/// on drop by a task spawned on the current runtime. A local gate handed to
/// the guard with [`hold_gate`](Self::hold_gate) stays locked until that
/// release has finished, on either path.
pub(crate) struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    owner: String,
    acquired_at: Instant,
    lease: Duration,
    gate: Option<OwnedMutexGuard<()>>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    /// Lease left according to the local clock.
    pub(crate) fn remaining(&self) -> Duration {
        self.lease.saturating_sub(self.acquired_at.elapsed())
    }

    pub(crate) fn lease_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Keep `gate` locked until this lock has been released.
    pub(crate) fn hold_gate(&mut self, gate: OwnedMutexGuard<()>) {
        self.gate = Some(gate);
    }

    /// Release the lock if this guard still owns it.
    pub(crate) async fn release(self) -> StoreResult<DeleteOutcome> {
        self.release_keeping_gate().await.0
    }

    /// Release the lock and hand back the held gate, if any, still locked.
    pub(crate) async fn release_keeping_gate(
        mut self,
    ) -> (StoreResult<DeleteOutcome>, Option<OwnedMutexGuard<()>>) {
        let outcome = release_lock(self.store.as_ref(), &self.key, &self.owner).await;
        self.released = true;
        (outcome, self.gate.take())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        let gate = self.gate.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "Lock guard dropped without release, releasing in background");
                handle.spawn(async move {
                    let _ = release_lock(store.as_ref(), &key, &owner).await;
                    drop(gate);
                });
            }
            Err(_) => {
                warn!(key = %key, "No runtime to release lock, leaving it to lease expiry");
            }
        }
    }
}

async fn release_lock(
    store: &dyn CoordinationStore,
    key: &str,
    owner: &str,
) -> StoreResult<DeleteOutcome> {
    let outcome = store.compare_and_delete(key, owner).await;
    match &outcome {
        Ok(DeleteOutcome::Deleted) => {
            debug!(key = %key, owner = %owner, "Released distributed lock");
        }
        Ok(DeleteOutcome::Mismatch) => {
            warn!(key = %key, owner = %owner, "Lock lease lapsed and passed to another owner");
        }
        Ok(DeleteOutcome::Absent) => {
            warn!(key = %key, owner = %owner, "Lock lease lapsed before release");
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to release lock, it will expire with its lease");
        }
    }
    outcome
}
