//! Shared coordination store abstraction.
//!
//! The limiter never talks to a concrete backend directly. Every process
//! participating in admission control holds a handle to something that
//! implements [`CoordinationStore`], and all cross-process coordination
//! goes through these primitives.

mod flaky;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use flaky::{FlakyStore, StoreOp};
pub use memory::MemoryStore;

/// Errors reported by a coordination store.
///
/// Every variant is treated as transient by the limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("key '{key}' holds a value of the wrong type")]
    WrongType { key: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of a compare-and-delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The key holds a different value; nothing was removed.
    Mismatch,
    Absent,
}

/// Result of an append that only succeeds on an existing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Absent,
}

/// Primitives the limiter consumes from the shared store.
///
/// Each call must be atomic on its own. Composite sequences are made safe
/// by the distributed mutex, not by the store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `value` under `key` with a TTL, only if the key does not exist.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<CreateOutcome>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<DeleteOutcome>;

    /// Length of the list at `key`, 0 if absent.
    async fn length(&self, key: &str) -> StoreResult<usize>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Append to the list at `key` only if it exists. Never touches the TTL.
    async fn append_if_exists(&self, key: &str, value: &str) -> StoreResult<AppendOutcome>;

    /// Append to the list at `key` (creating it) and set its TTL, atomically.
    async fn append_and_expire(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
}
