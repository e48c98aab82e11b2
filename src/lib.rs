//! Funnel - Distributed Admission Control
//!
//! This crate bounds how many callers, across any number of processes, may
//! enter a shared resource per fixed window. Processes never talk to each
//! other; a shared coordination store is the only channel. A lease-based
//! distributed mutex makes each check-then-append on the window atomic, and
//! jittered backoff turns a full window into bounded waiting.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::{FunnelConfig, LimiterConfig, LimiterSettings};
pub use error::{FunnelError, Result};
pub use ratelimit::RateLimiter;
pub use store::{CoordinationStore, MemoryStore};
