//! Error types for the Funnel admission limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Funnel operations.
#[derive(Error, Debug)]
pub enum FunnelError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The window stayed full for the whole retry budget
    #[error("Capacity exhausted for token '{token}' after {attempts} attempts")]
    CapacityExhausted { token: String, attempts: u32 },

    /// The distributed mutex could not be acquired within its attempt budget
    #[error("Lock '{key}' unavailable after {attempts} attempts")]
    LockUnavailable { key: String, attempts: u32 },

    /// The retry budget ran out while the coordination store was failing
    #[error("Coordination store failed after {attempts} attempts: {source}")]
    StoreFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The caller's deadline passed before admission
    #[error("Deadline exceeded before admission")]
    DeadlineExceeded,

    /// The caller's shutdown signal fired before admission
    #[error("Admission cancelled")]
    Cancelled,
}

impl FunnelError {
    /// Whether the error means "healthy but saturated, try later".
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, FunnelError::CapacityExhausted { .. })
    }
}

/// Result type alias for Funnel operations.
pub type Result<T> = std::result::Result<T, FunnelError>;
