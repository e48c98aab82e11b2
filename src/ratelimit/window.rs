//! Fixed admission window kept as a list in the coordination store.
//!
//! The list length is the number of admissions granted in the current
//! window. The first admission creates the list with a TTL of one window;
//! later admissions append without touching the TTL, so the window is
//! anchored at its first admission and resets lazily once the key expires.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::mutex::LockGuard;
use crate::store::{AppendOutcome, CoordinationStore, StoreResult};

/// Result of one probe of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// An admission was recorded; `count` includes it.
    Admitted { count: u64 },
    /// The window already holds the maximum number of admissions.
    Full { count: u64 },
    /// The window expired between the existence check and the append.
    /// Nothing was recorded and the caller should probe again.
    Expired,
    /// The guard does not hold this window's lock, or its lease ran out
    /// before the write. Nothing was recorded.
    NotHeld,
}

/// Admission counter for one token.
pub(crate) struct WindowCounter {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lock_key: String,
    max_admissions: u64,
    window: Duration,
}

impl std::fmt::Debug for WindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCounter")
            .field("key", &self.key)
            .field("lock_key", &self.lock_key)
            .field("max_admissions", &self.max_admissions)
            .field("window", &self.window)
            .finish()
    }
}

impl WindowCounter {
    /// A counter over the list at `key`, guarded by the lock at `lock_key`.
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        lock_key: impl Into<String>,
        max_admissions: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            lock_key: lock_key.into(),
            max_admissions,
            window,
        }
    }

    /// Admissions recorded in the current window.
    pub(crate) async fn count(&self) -> StoreResult<u64> {
        Ok(self.store.length(&self.key).await? as u64)
    }

    /// Check the window and record an admission if there is room.
    ///
    /// The read and the write are separate store calls, so this is only
    /// sound while `lock` holds this window's lock. A guard for another key,
    /// or one whose lease lapsed during the read, gets [`Probe::NotHeld`].
    pub(crate) async fn probe_and_admit(&self, lock: &LockGuard) -> StoreResult<Probe> {
        if lock.key() != self.lock_key {
            warn!(key = %self.key, lock = %lock.key(), "Refusing probe under a foreign lock");
            return Ok(Probe::NotHeld);
        }

        let count = self.count().await?;
        if count >= self.max_admissions {
            trace!(key = %self.key, count, limit = self.max_admissions, "Window full");
            return Ok(Probe::Full { count });
        }

        let exists = self.store.exists(&self.key).await?;
        if lock.lease_expired() {
            debug!(key = %self.key, "Lock lease lapsed before the write");
            return Ok(Probe::NotHeld);
        }

        if !exists {
            self.store
                .append_and_expire(&self.key, lock.owner(), self.window)
                .await?;
            debug!(
                key = %self.key,
                window_ms = self.window.as_millis() as u64,
                "Opened admission window"
            );
            return Ok(Probe::Admitted { count: 1 });
        }

        match self.store.append_if_exists(&self.key, lock.owner()).await? {
            AppendOutcome::Appended => Ok(Probe::Admitted { count: count + 1 }),
            AppendOutcome::Absent => {
                trace!(key = %self.key, "Window expired mid-probe");
                Ok(Probe::Expired)
            }
        }
    }
}
