//! Admission control: token keys, backoff, distributed mutex, window
//! counter, and the limiter that ties them together.

mod backoff;
mod keys;
mod limiter;
mod mutex;
mod window;

pub use backoff::{jittered_delay, Backoff};
pub use keys::TokenKeys;
pub use limiter::RateLimiter;
