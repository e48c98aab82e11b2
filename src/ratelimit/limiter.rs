//! Distributed admission limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::backoff::Backoff;
use super::keys::TokenKeys;
use super::mutex::{DistributedMutex, LockGuard};
use super::window::{Probe, WindowCounter};
use crate::config::{LimiterConfig, LimiterSettings};
use crate::error::{FunnelError, Result};
use crate::store::{CoordinationStore, StoreError};

/// Bounds how many callers, across every process sharing the store, enter a
/// token's resource per window.
///
/// One instance is meant to live for the life of the process and be shared
/// between its tasks. Calls from the same instance queue on a local gate
/// first, so a process only ever has one negotiation with the store in
/// flight per token.
pub struct RateLimiter {
    settings: LimiterSettings,
    keys: TokenKeys,
    /// Serializes this process's callers ahead of the distributed mutex
    local_gate: Arc<Mutex<()>>,
    mutex: DistributedMutex,
    window: WindowCounter,
    backoff: Backoff,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Probe attempts and the last store error, carried across lock
/// re-acquisitions within one admission.
#[derive(Debug, Default)]
struct Attempts {
    used: u32,
    last_error: Option<StoreError>,
}

impl RateLimiter {
    /// Create a limiter for `config.token` on top of `store`.
    ///
    /// Configuration is validated here; an invalid config never reaches the
    /// store.
    pub fn new(store: Arc<dyn CoordinationStore>, config: LimiterConfig) -> Result<Self> {
        let settings = config.resolve()?;
        let keys = TokenKeys::derive(&settings.namespace, &settings.token);
        let backoff = Backoff::new(settings.base_delay, settings.jitter_factor);

        let mutex = DistributedMutex::new(
            store.clone(),
            keys.lock.clone(),
            settings.lock_lease,
            settings.lock_attempts,
            backoff,
        );
        let window = WindowCounter::new(
            store,
            keys.window.clone(),
            keys.lock.clone(),
            settings.max_admissions,
            settings.window,
        );

        debug!(
            token = %keys,
            max_admissions = settings.max_admissions,
            window_ms = settings.window.as_millis() as u64,
            max_retries = settings.max_retries,
            lease_ms = settings.lock_lease.as_millis() as u64,
            "Created rate limiter"
        );

        Ok(Self {
            settings,
            keys,
            local_gate: Arc::new(Mutex::new(())),
            mutex,
            window,
            backoff,
        })
    }

    pub fn token(&self) -> &str {
        &self.settings.token
    }

    pub fn keys(&self) -> &TokenKeys {
        &self.keys
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Admissions recorded in the current window, as seen by the store.
    pub async fn current_count(&self) -> Result<u64> {
        self.window
            .count()
            .await
            .map_err(|source| FunnelError::StoreFailure {
                attempts: 1,
                source,
            })
    }

    /// Wait for admission into the current window.
    ///
    /// Bounded by the configured timeout, if any.
    pub async fn enter(&self) -> Result<()> {
        match self.settings.timeout {
            Some(timeout) => self.enter_until(Instant::now() + timeout).await,
            None => self.admit().await,
        }
    }

    /// Like [`enter`](Self::enter), giving up at `deadline`.
    pub async fn enter_until(&self, deadline: Instant) -> Result<()> {
        match tokio::time::timeout_at(deadline, self.admit()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(token = %self.keys, "Deadline passed before admission");
                Err(FunnelError::DeadlineExceeded)
            }
        }
    }

    /// Like [`enter`](Self::enter), giving up when `signal` resolves.
    pub async fn enter_with_shutdown<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.enter() => result,
            _ = signal => {
                debug!(token = %self.keys, "Admission cancelled");
                Err(FunnelError::Cancelled)
            }
        }
    }

    async fn admit(&self) -> Result<()> {
        let mut gate = self.local_gate.clone().lock_owned().await;
        trace!(token = %self.keys, "Acquired local gate");

        let mut attempts = Attempts::default();
        loop {
            let mut lock = self.mutex.acquire().await?;
            // The guard owns the gate from here, so a cancelled caller keeps
            // it locked until the background release is done.
            lock.hold_gate(gate);

            if let Some(result) = self.probe(&lock, &mut attempts).await {
                // A failed release is logged by the guard; the lease cleans up.
                let _ = lock.release().await;
                return result;
            }

            warn!(
                token = %self.keys,
                attempts = attempts.used,
                lease_ms = self.settings.lock_lease.as_millis() as u64,
                "Distributed lock lease ran short, re-acquiring"
            );
            let (_, kept) = lock.release_keeping_gate().await;
            gate = match kept {
                Some(gate) => gate,
                None => self.local_gate.clone().lock_owned().await,
            };
        }
    }

    /// Probe the window under `lock` until admitted or out of attempts.
    ///
    /// Returns `None` when the lease no longer leaves room for another probe
    /// and the lock has to be taken again.
    async fn probe(&self, lock: &LockGuard, attempts: &mut Attempts) -> Option<Result<()>> {
        let max_retries = self.settings.max_retries;
        let drift = self.settings.lock_lease / 100 + Duration::from_millis(2);
        let mut slowest = Duration::ZERO;

        while attempts.used < max_retries {
            if lock.remaining() <= drift + slowest {
                // Spend an attempt so a store slower than the lease still
                // runs out of budget.
                attempts.used += 1;
                return None;
            }
            attempts.used += 1;
            let attempt = attempts.used;

            let started = Instant::now();
            let probe = self.window.probe_and_admit(lock).await;
            slowest = slowest.max(started.elapsed());

            match probe {
                Ok(Probe::Admitted { count }) => {
                    debug!(token = %self.keys, count, attempt, "Admitted");
                    return Some(Ok(()));
                }
                Ok(Probe::Full { count }) => {
                    trace!(token = %self.keys, count, attempt, "Window full, backing off");
                    attempts.last_error = None;
                }
                Ok(Probe::Expired) => {
                    attempts.last_error = None;
                    continue;
                }
                Ok(Probe::NotHeld) => {
                    attempts.last_error = None;
                    return None;
                }
                Err(e) => {
                    warn!(token = %self.keys, attempt, error = %e, "Store error while probing window");
                    attempts.last_error = Some(e);
                }
            }

            if attempt < max_retries {
                self.backoff.sleep().await;
            }
        }

        Some(match attempts.last_error.take() {
            Some(source) => Err(FunnelError::StoreFailure {
                attempts: max_retries,
                source,
            }),
            None => {
                debug!(token = %self.keys, attempts = max_retries, "Capacity exhausted");
                Err(FunnelError::CapacityExhausted {
                    token: self.settings.token.clone(),
                    attempts: max_retries,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    use crate::store::{FlakyStore, MemoryStore, StoreOp};

    fn limiter(store: Arc<dyn CoordinationStore>, config: LimiterConfig) -> RateLimiter {
        RateLimiter::new(store, config).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limiter_creation() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), LimiterConfig::new("uniqueToken", 20, 1000));

        assert_eq!(limiter.token(), "uniqueToken");
        assert_eq!(limiter.settings().max_admissions, 20);
        assert_eq!(limiter.keys().window, "funnel:11:uniqueToken:window");
        assert_eq!(limiter.current_count().await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_never_touches_store() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let result = RateLimiter::new(store.clone(), LimiterConfig::new("api", 0, 1000));

        assert!(matches!(result, Err(FunnelError::Config(_))));
        for op in [StoreOp::CreateIfAbsent, StoreOp::Length, StoreOp::Exists] {
            assert_eq!(store.calls(op), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_entries_fill_window_then_block() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), LimiterConfig::new("seq", 10, 1000));
        let start = Instant::now();

        for _ in 0..10 {
            assert_ok!(limiter.enter().await);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.current_count().await.unwrap(), 10);

        assert_ok!(limiter.enter().await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1400), "elapsed {:?}", elapsed);
        assert_eq!(limiter.current_count().await.unwrap(), 1);

        assert!(!store.contains(&limiter.keys().lock));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_entries_need_two_rollovers() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, LimiterConfig::new("uniqueToken", 20, 1000));
        let start = Instant::now();

        let results = join_all((0..41).map(|_| limiter.enter())).await;
        let elapsed = start.elapsed();

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(elapsed > Duration::from_millis(2000), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3000), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_exceed_limit_within_window() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(limiter(store, LimiterConfig::new("uniqueToken", 10, 1000)));
        let completed = Arc::new(AtomicU64::new(0));

        for _ in 0..20 {
            let limiter = limiter.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                if limiter.enter().await.is_ok() {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        // Observe just before the first window rolls over.
        tokio::time::sleep(Duration::from_millis(990)).await;
        let done = completed.load(Ordering::SeqCst);
        assert!(done < 20, "{} completed within one window", done);
        assert!(done >= 10, "only {} completed", done);
    }

    fn slow_store(latency_ms: u64) -> Arc<FlakyStore<MemoryStore>> {
        Arc::new(FlakyStore::new(MemoryStore::new()).with_latency(Duration::from_millis(latency_ms)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_processes_admit_at_most_limit() {
        // Every store call yields, so callers interleave between the
        // length read and the append.
        let store = slow_store(5);
        let config = LimiterConfig::new("shared", 5, 60_000)
            .with_max_retries(3)
            .with_base_delay_millis(10);

        // Two instances sharing a store stand in for two processes.
        let first = limiter(store.clone(), config.clone());
        let second = limiter(store.clone(), config);

        let calls = (0..5)
            .map(|_| first.enter())
            .chain((0..5).map(|_| second.enter()));
        let results = join_all(calls).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 5);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(FunnelError::is_capacity_exhausted));
        assert_eq!(first.current_count().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_never_overfills_window() {
        let store = slow_store(40);
        let config = LimiterConfig::new("slow", 1, 1000);
        let limiters: Vec<_> = (0..4)
            .map(|_| Arc::new(limiter(store.clone(), config.clone())))
            .collect();
        let window_key = limiters[0].keys().window.clone();

        let widest = Arc::new(AtomicU64::new(0));
        let sampler = {
            let store = store.clone();
            let widest = widest.clone();
            tokio::spawn(async move {
                loop {
                    let len = store.inner().length(&window_key).await.unwrap() as u64;
                    widest.fetch_max(len, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let start = Instant::now();
        let results = join_all(limiters.iter().map(|l| l.enter())).await;
        sampler.abort();

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(widest.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lost_to_slow_store_is_reacquired() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let config = LimiterConfig::new("lapse", 1, 1000)
            .with_base_delay_millis(100)
            .with_jitter_factor(0.0)
            .with_lock_lease_millis(1200)
            .with_max_retries(10);
        let limiter = limiter(store.clone(), config);

        store.time_out_next(StoreOp::Length, 1, Duration::from_millis(1500));
        let start = Instant::now();
        assert_ok!(limiter.enter().await);

        assert!(start.elapsed() >= Duration::from_millis(1600));
        assert_eq!(store.calls(StoreOp::CreateIfAbsent), 2);
        assert_eq!(store.calls(StoreOp::CompareAndDelete), 2);
        assert_eq!(limiter.current_count().await.unwrap(), 1);
        assert!(!store.inner().contains(&limiter.keys().lock));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_holder_does_not_write_over_new_holder() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let config = LimiterConfig::new("overlap", 1, 1000)
            .with_base_delay_millis(100)
            .with_jitter_factor(0.0)
            .with_lock_lease_millis(1200)
            .with_max_retries(50);
        let stalled = limiter(store.clone(), config.clone());
        let other = limiter(store.clone(), config);

        // The first holder's existence check outlives its lease; the other
        // process takes the lock and admits in the meantime.
        store.stall_next(StoreOp::Exists, 1, Duration::from_millis(1500));
        let start = Instant::now();
        let (stalled_result, other_result) = tokio::join!(stalled.enter(), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let result = other.enter().await;
            (result, start.elapsed())
        });

        assert_ok!(stalled_result);
        let (other_result, other_done) = other_result;
        assert_ok!(other_result);
        assert!(other_done >= Duration::from_millis(1200));
        assert!(start.elapsed() >= Duration::from_millis(2200));

        // Both admissions opened their own window; nothing was appended
        // into a window opened under someone else's lock.
        assert_eq!(store.calls(StoreOp::AppendIfExists), 0);
        assert_eq!(store.calls(StoreOp::AppendAndExpire), 2);
        assert_eq!(stalled.current_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_probe_errors_are_absorbed() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let limiter = limiter(
            store.clone(),
            LimiterConfig::new("flaky", 3, 1000).with_base_delay_millis(10),
        );

        store.fail_next(StoreOp::Length, 2);
        store.fail_next(StoreOp::AppendAndExpire, 1);
        assert_ok!(limiter.enter().await);

        assert_eq!(store.calls(StoreOp::Length), 4);
        assert_eq!(store.calls(StoreOp::AppendAndExpire), 2);
        assert_eq!(limiter.current_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_append_is_reprobed_not_double_counted() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let config = LimiterConfig::new("inject", 3, 60_000)
            .with_max_retries(4)
            .with_base_delay_millis(10);
        let limiter = limiter(store.clone(), config);

        assert_ok!(limiter.enter().await);
        store.fail_next(StoreOp::AppendIfExists, 3);

        let results = join_all((0..6).map(|_| limiter.enter())).await;
        let admitted = results.iter().filter(|r| r.is_ok()).count();

        assert_eq!(admitted, 2);
        assert_eq!(limiter.current_count().await.unwrap(), 3);
        assert_eq!(store.injected_failures(StoreOp::AppendIfExists), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_store_errors_surface_as_store_failure() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let limiter = limiter(
            store.clone(),
            LimiterConfig::new("down", 3, 1000).with_max_retries(4),
        );
        store.fail_next(StoreOp::Length, 100);

        let err = assert_err!(limiter.enter().await);
        match err {
            FunnelError::StoreFailure { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!store.inner().contains(&limiter.keys().lock));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_surfaces_capacity_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(
            store,
            LimiterConfig::new("busy", 1, 60_000).with_max_retries(3),
        );

        assert_ok!(limiter.enter().await);
        let err = assert_err!(limiter.enter().await);
        assert!(err.is_capacity_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_surfaces_lock_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(
            store.clone(),
            LimiterConfig::new("locked", 3, 1000).with_lock_attempts(3),
        );
        store
            .create_if_absent(&limiter.keys().lock, "other-process", Duration::from_secs(60))
            .await
            .unwrap();

        let err = assert_err!(limiter.enter().await);
        assert!(matches!(err, FunnelError::LockUnavailable { attempts: 3, .. }));
        assert!(!err.is_capacity_exhausted());
        assert_eq!(store.get(&limiter.keys().lock).as_deref(), Some("other-process"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_lock_holder_is_recovered() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), LimiterConfig::new("recover", 3, 1000));
        store
            .create_if_absent(&limiter.keys().lock, "crashed", Duration::from_millis(2000))
            .await
            .unwrap();

        let start = Instant::now();
        assert_ok!(limiter.enter().await);
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_released_once_per_acquisition() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let limiter = limiter(
            store.clone(),
            LimiterConfig::new("once", 2, 60_000).with_max_retries(2),
        );

        let results = join_all((0..4).map(|_| limiter.enter())).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);

        assert_eq!(store.calls(StoreOp::CreateIfAbsent), 4);
        assert_eq!(store.calls(StoreOp::CompareAndDelete), 4);
        assert!(!store.inner().contains(&limiter.keys().lock));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_releases_lock() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), LimiterConfig::new("deadline", 1, 10_000));
        assert_ok!(limiter.enter().await);

        let deadline = Instant::now() + Duration::from_millis(500);
        let err = assert_err!(limiter.enter_until(deadline).await);
        assert!(matches!(err, FunnelError::DeadlineExceeded));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!store.contains(&limiter.keys().lock));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_gate_held_until_cancelled_release_completes() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let limiter = limiter(store.clone(), LimiterConfig::new("gate", 1, 10_000));
        assert_ok!(limiter.enter().await);

        store.stall_next(StoreOp::CompareAndDelete, 1, Duration::from_millis(50));
        let deadline = Instant::now() + Duration::from_millis(500);
        assert_err!(limiter.enter_until(deadline).await);

        // The release still runs in the background and owns the gate.
        assert!(limiter.local_gate.try_lock().is_err());
        assert!(store.inner().contains(&limiter.keys().lock));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.local_gate.try_lock().is_ok());
        assert!(!store.inner().contains(&limiter.keys().lock));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeout_bounds_enter() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(
            store,
            LimiterConfig::new("timeout", 1, 10_000).with_timeout_millis(300),
        );
        assert_ok!(limiter.enter().await);

        let start = Instant::now();
        let err = assert_err!(limiter.enter().await);
        assert!(matches!(err, FunnelError::DeadlineExceeded));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(310), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_cancels() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), LimiterConfig::new("cancel", 1, 10_000));
        assert_ok!(limiter.enter().await);

        let signal = tokio::time::sleep(Duration::from_millis(200));
        let err = assert_err!(limiter.enter_with_shutdown(signal).await);
        assert!(matches!(err, FunnelError::Cancelled));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!store.contains(&limiter.keys().lock));

        // A signal that never fires leaves admission untouched.
        let other = limiter_for_token(store, "other");
        assert_ok!(other.enter_with_shutdown(std::future::pending()).await);
    }

    fn limiter_for_token(store: Arc<MemoryStore>, token: &str) -> RateLimiter {
        limiter(store, LimiterConfig::new(token, 1, 10_000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let a = limiter_for_token(store.clone(), "a");
        let b = limiter_for_token(store.clone(), "b");
        let namespaced = limiter(
            store,
            LimiterConfig::new("a", 1, 10_000).with_namespace("tenant-2"),
        );

        assert_ok!(a.enter().await);
        assert_ok!(b.enter().await);
        assert_ok!(namespaced.enter().await);
        assert_eq!(a.current_count().await.unwrap(), 1);
        assert_eq!(b.current_count().await.unwrap(), 1);
        assert_eq!(namespaced.current_count().await.unwrap(), 1);
        assert_eq!(namespaced.keys().window, "tenant-2:1:a:window");
    }
}
