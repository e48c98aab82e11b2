//! Configuration management for Funnel.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FunnelError, Result};
use crate::ratelimit::Backoff;

/// Default admissions per window.
pub const DEFAULT_MAX_ADMISSIONS: u64 = 10;
/// Default window length in milliseconds.
pub const DEFAULT_WINDOW_MILLIS: u64 = 1000;
/// Default probe attempts before giving up on a full window.
pub const DEFAULT_MAX_RETRIES: u32 = 1000;
/// Default jitter added on top of the base delay, as a fraction of it.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;
/// Floor for the distributed lock lease. The default lease is also at least
/// ten windows and twice the longest expected hold.
pub const DEFAULT_LOCK_LEASE_MILLIS: u64 = 15_000;
/// Default attempts at the distributed lock.
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 10_000;
/// Default key namespace in the coordination store.
pub const DEFAULT_NAMESPACE: &str = "funnel";

/// Main configuration for the Funnel binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `funnel=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FunnelConfig {
    /// Load configuration from a file, with `FUNNEL__`-prefixed environment
    /// overrides (e.g. `FUNNEL__LIMITER__MAX_ADMISSIONS=20`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("FUNNEL").separator("__"))
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(|e| FunnelError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FunnelError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

/// Parameters of one limiter, as supplied by the caller.
///
/// Unset fields fall back to defaults when resolved into [`LimiterSettings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Identity of the rate-limited resource
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub max_admissions: Option<u64>,
    #[serde(default)]
    pub window_millis: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_millis: Option<u64>,
    #[serde(default)]
    pub jitter_factor: Option<f64>,
    #[serde(default)]
    pub lock_lease_millis: Option<u64>,
    #[serde(default)]
    pub lock_attempts: Option<u32>,
    /// Upper bound on a single `enter()` call
    #[serde(default)]
    pub timeout_millis: Option<u64>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl LimiterConfig {
    pub fn new(token: impl Into<String>, max_admissions: u64, window_millis: u64) -> Self {
        Self {
            token: token.into(),
            max_admissions: Some(max_admissions),
            window_millis: Some(window_millis),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_base_delay_millis(mut self, millis: u64) -> Self {
        self.base_delay_millis = Some(millis);
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = Some(factor);
        self
    }

    pub fn with_lock_lease_millis(mut self, millis: u64) -> Self {
        self.lock_lease_millis = Some(millis);
        self
    }

    pub fn with_lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_attempts = Some(attempts);
        self
    }

    pub fn with_timeout_millis(mut self, millis: u64) -> Self {
        self.timeout_millis = Some(millis);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Apply defaults and validate.
    pub fn resolve(&self) -> Result<LimiterSettings> {
        if self.token.is_empty() {
            return Err(FunnelError::Config("token must not be empty".to_string()));
        }

        let max_admissions = positive("max_admissions", self.max_admissions, DEFAULT_MAX_ADMISSIONS)?;
        let window_millis = positive("window_millis", self.window_millis, DEFAULT_WINDOW_MILLIS)?;
        let max_retries = positive("max_retries", self.max_retries, DEFAULT_MAX_RETRIES)?;
        let lock_attempts = positive("lock_attempts", self.lock_attempts, DEFAULT_LOCK_ATTEMPTS)?;
        let base_delay_millis =
            positive("base_delay_millis", self.base_delay_millis, (window_millis / 4).max(1))?;

        let jitter_factor = self.jitter_factor.unwrap_or(DEFAULT_JITTER_FACTOR);
        if !(0.0..1.0).contains(&jitter_factor) {
            return Err(FunnelError::Config(format!(
                "jitter_factor must be in [0, 1), got {}",
                jitter_factor
            )));
        }

        // A holder waits out at most one window plus one backoff delay.
        let max_hold = Duration::from_millis(window_millis)
            + Backoff::new(Duration::from_millis(base_delay_millis), jitter_factor).max_delay();
        let max_hold_millis = max_hold.as_millis().min(u64::MAX as u128) as u64;

        let lock_lease_millis = positive(
            "lock_lease_millis",
            self.lock_lease_millis,
            DEFAULT_LOCK_LEASE_MILLIS
                .max(window_millis.saturating_mul(10))
                .max(max_hold_millis.saturating_mul(2)),
        )?;
        if lock_lease_millis <= max_hold_millis {
            return Err(FunnelError::Config(format!(
                "lock_lease_millis ({}) must exceed one window plus the longest backoff ({})",
                lock_lease_millis, max_hold_millis
            )));
        }

        let timeout = match self.timeout_millis {
            Some(millis) => Some(Duration::from_millis(positive("timeout_millis", Some(millis), millis)?)),
            None => None,
        };

        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if namespace.is_empty() {
            return Err(FunnelError::Config("namespace must not be empty".to_string()));
        }

        Ok(LimiterSettings {
            token: self.token.clone(),
            max_admissions,
            window: Duration::from_millis(window_millis),
            max_retries,
            base_delay: Duration::from_millis(base_delay_millis),
            jitter_factor,
            lock_lease: Duration::from_millis(lock_lease_millis),
            lock_attempts,
            timeout,
            namespace,
        })
    }
}

fn positive<T>(field: &str, value: Option<T>, default: T) -> Result<T>
where
    T: Copy + PartialOrd + Default + std::fmt::Display,
{
    let value = value.unwrap_or(default);
    if value <= T::default() {
        return Err(FunnelError::Config(format!(
            "{} must be positive, got {}",
            field, value
        )));
    }
    Ok(value)
}

/// Effective, validated limiter parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterSettings {
    pub token: String,
    pub max_admissions: u64,
    pub window: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub jitter_factor: f64,
    pub lock_lease: Duration,
    pub lock_attempts: u32,
    pub timeout: Option<Duration>,
    pub namespace: String,
}
