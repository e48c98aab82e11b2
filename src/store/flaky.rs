//! Fault-injecting store decorator.
//!
//! Wraps any [`CoordinationStore`] and fails selected primitives before they
//! reach the inner store, so an injected failure never has a side effect.
//! It can also slow calls down, either all of them by a fixed latency or a
//! scripted few by a longer stall, which lets tasks interleave between the
//! steps of a multi-call sequence.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{AppendOutcome, CoordinationStore, CreateOutcome, DeleteOutcome, StoreError, StoreResult};

/// The store primitives, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateIfAbsent,
    CompareAndDelete,
    Length,
    Exists,
    AppendIfExists,
    AppendAndExpire,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::CreateIfAbsent => "create_if_absent",
            StoreOp::CompareAndDelete => "compare_and_delete",
            StoreOp::Length => "length",
            StoreOp::Exists => "exists",
            StoreOp::AppendIfExists => "append_if_exists",
            StoreOp::AppendAndExpire => "append_and_expire",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Unavailable,
    /// Wait, then fail as a client-side timeout would.
    Timeout(Duration),
    /// Wait, then go through.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct OpState {
    calls: u64,
    injected: u64,
    pending: VecDeque<Fault>,
}

/// A store that fails on demand.
#[derive(Debug)]
pub struct FlakyStore<S> {
    inner: S,
    failure_rate: f64,
    latency: Duration,
    ops: Mutex<HashMap<StoreOp, OpState>>,
}

impl<S: CoordinationStore> FlakyStore<S> {
    /// Wrap `inner` without random failures; use [`fail_next`](Self::fail_next)
    /// to script them.
    pub fn new(inner: S) -> Self {
        Self::with_failure_rate(inner, 0.0)
    }

    /// Wrap `inner`, failing each call with probability `failure_rate`.
    pub fn with_failure_rate(inner: S, failure_rate: f64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency: Duration::ZERO,
            ops: Mutex::new(HashMap::new()),
        }
    }

    /// Delay every call by `latency` before it reaches the inner store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.script(op, times, Fault::Unavailable);
    }

    /// Make the next `times` calls of `op` hang for `after`, then fail with
    /// [`StoreError::Timeout`].
    pub fn time_out_next(&self, op: StoreOp, times: u32, after: Duration) {
        self.script(op, times, Fault::Timeout(after));
    }

    /// Make the next `times` calls of `op` hang for `by`, then succeed.
    pub fn stall_next(&self, op: StoreOp, times: u32, by: Duration) {
        self.script(op, times, Fault::Stall(by));
    }

    fn script(&self, op: StoreOp, times: u32, fault: Fault) {
        let mut ops = self.ops.lock();
        let pending = &mut ops.entry(op).or_default().pending;
        pending.extend(std::iter::repeat(fault).take(times as usize));
    }

    /// Calls of `op` seen so far, failed ones included.
    pub fn calls(&self, op: StoreOp) -> u64 {
        self.ops.lock().get(&op).map_or(0, |state| state.calls)
    }

    pub fn injected_failures(&self, op: StoreOp) -> u64 {
        self.ops.lock().get(&op).map_or(0, |state| state.injected)
    }

    fn draw(&self, op: StoreOp) -> Option<Fault> {
        let mut ops = self.ops.lock();
        let state = ops.entry(op).or_default();
        state.calls += 1;

        let fault = state.pending.pop_front().or_else(|| {
            (self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate)
                .then_some(Fault::Unavailable)
        });
        if !matches!(fault, None | Some(Fault::Stall(_))) {
            state.injected += 1;
        }
        fault
    }

    async fn check(&self, op: StoreOp) -> StoreResult<()> {
        let fault = self.draw(op);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match fault {
            None => Ok(()),
            Some(Fault::Stall(by)) => {
                trace!(op = %op, stall_ms = by.as_millis() as u64, "Stalling store call");
                tokio::time::sleep(by).await;
                Ok(())
            }
            Some(Fault::Timeout(after)) => {
                trace!(op = %op, "Injecting store timeout");
                tokio::time::sleep(after).await;
                Err(StoreError::Timeout(after))
            }
            Some(Fault::Unavailable) => {
                trace!(op = %op, "Injecting store failure");
                Err(StoreError::Unavailable(format!("injected failure on {}", op)))
            }
        }
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for FlakyStore<S> {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<CreateOutcome> {
        self.check(StoreOp::CreateIfAbsent).await?;
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<DeleteOutcome> {
        self.check(StoreOp::CompareAndDelete).await?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn length(&self, key: &str) -> StoreResult<usize> {
        self.check(StoreOp::Length).await?;
        self.inner.length(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check(StoreOp::Exists).await?;
        self.inner.exists(key).await
    }

    async fn append_if_exists(&self, key: &str, value: &str) -> StoreResult<AppendOutcome> {
        self.check(StoreOp::AppendIfExists).await?;
        self.inner.append_if_exists(key, value).await
    }

    async fn append_and_expire(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check(StoreOp::AppendAndExpire).await?;
        self.inner.append_and_expire(key, value, ttl).await
    }
}
