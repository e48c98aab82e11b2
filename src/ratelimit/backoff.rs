//! Jittered retry delays.
//!
//! Both the lock-contention path and the full-window path sleep through the
//! same policy, so callers blocked on one token across processes spread
//! their retries instead of probing the store in lockstep.

use std::time::Duration;

/// Returns `base` plus a uniformly random extra in `[0, jitter_factor * base)`.
pub fn jittered_delay(base: Duration, jitter_factor: f64) -> Duration {
    let extra = rand::random::<f64>() * jitter_factor;
    base + base.mul_f64(extra)
}

/// A retry delay policy: a base delay and a jitter factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    jitter_factor: f64,
}

impl Backoff {
    pub fn new(base: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            jitter_factor: jitter_factor.max(0.0),
        }
    }

    /// Longest delay this policy can produce.
    pub fn max_delay(&self) -> Duration {
        self.base + self.base.mul_f64(self.jitter_factor)
    }

    pub fn next_delay(&self) -> Duration {
        jittered_delay(self.base, self.jitter_factor)
    }

    pub async fn sleep(&self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
