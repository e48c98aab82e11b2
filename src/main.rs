use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use funnel::config::{FunnelConfig, LoggingConfig};
use funnel::store::{CoordinationStore, FlakyStore, MemoryStore};
use funnel::{FunnelError, RateLimiter};

/// Drive concurrent callers through a distributed admission limiter.
#[derive(Parser, Debug)]
#[command(name = "funnel", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Token identifying the limited resource
    #[arg(long)]
    token: Option<String>,

    /// Admissions allowed per window
    #[arg(long)]
    max_admissions: Option<u64>,

    /// Window length in milliseconds
    #[arg(long)]
    window_millis: Option<u64>,

    /// Concurrent callers to run
    #[arg(long, default_value_t = 1)]
    callers: usize,

    /// Limiter instances sharing the store, each standing in for a process
    #[arg(long, default_value_t = 1)]
    processes: usize,

    /// Probability of injecting a transient failure into each store call
    #[arg(long, default_value_t = 0.0)]
    failure_rate: f64,

    /// Log filter directive, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

/// Outcome counts for one run.
#[derive(Debug, Default, Serialize)]
struct RunSummary {
    token: String,
    processes: usize,
    callers: usize,
    admitted: usize,
    capacity_exhausted: usize,
    lock_unavailable: usize,
    store_failures: usize,
    deadline_exceeded: usize,
    cancelled: usize,
    elapsed_ms: u64,
}

impl RunSummary {
    fn record(&mut self, result: &funnel::Result<()>) {
        match result {
            Ok(()) => self.admitted += 1,
            Err(FunnelError::CapacityExhausted { .. }) => self.capacity_exhausted += 1,
            Err(FunnelError::LockUnavailable { .. }) => self.lock_unavailable += 1,
            Err(FunnelError::StoreFailure { .. }) => self.store_failures += 1,
            Err(FunnelError::DeadlineExceeded) => self.deadline_exceeded += 1,
            Err(FunnelError::Cancelled) => self.cancelled += 1,
            Err(FunnelError::Config(_)) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FunnelConfig::from_file(path)?,
        None => FunnelConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    init_tracing(&config.logging);

    info!("Starting Funnel");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn CoordinationStore> = if cli.failure_rate > 0.0 {
        info!(failure_rate = cli.failure_rate, "Injecting transient store failures");
        Arc::new(FlakyStore::with_failure_rate(MemoryStore::new(), cli.failure_rate))
    } else {
        Arc::new(MemoryStore::new())
    };

    let processes = cli.processes.max(1);
    let limiters = (0..processes)
        .map(|_| RateLimiter::new(store.clone(), config.limiter.clone()).map(Arc::new))
        .collect::<funnel::Result<Vec<_>>>()?;
    let settings = limiters[0].settings().clone();
    info!(
        token = %settings.token,
        max_admissions = settings.max_admissions,
        window_ms = settings.window.as_millis() as u64,
        processes,
        callers = cli.callers,
        "Rate limiters initialized"
    );

    let shutdown_rx = watch_for_shutdown();

    let start = Instant::now();
    let handles = (0..cli.callers).map(|caller| {
        let limiter = limiters[caller % processes].clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let signal = async move {
                if shutdown.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let started = Instant::now();
            let result = limiter.enter_with_shutdown(signal).await;
            (caller, started.elapsed(), result)
        })
    });

    let mut summary = RunSummary {
        token: settings.token.clone(),
        processes,
        callers: cli.callers,
        ..RunSummary::default()
    };
    for joined in join_all(handles).await {
        let (caller, waited, result) = joined?;
        match &result {
            Ok(()) => debug!(caller, waited_ms = waited.as_millis() as u64, "Caller admitted"),
            Err(e) => warn!(caller, error = %e, "Caller not admitted"),
        }
        summary.record(&result);
    }
    summary.elapsed_ms = start.elapsed().as_millis() as u64;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            admitted = summary.admitted,
            capacity_exhausted = summary.capacity_exhausted,
            lock_unavailable = summary.lock_unavailable,
            store_failures = summary.store_failures,
            deadline_exceeded = summary.deadline_exceeded,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "Run complete"
        );
    }

    Ok(())
}

fn apply_overrides(config: &mut FunnelConfig, cli: &Cli) {
    if let Some(token) = &cli.token {
        config.limiter.token = token.clone();
    }
    if config.limiter.token.is_empty() {
        config.limiter.token = "funnel-demo".to_string();
    }
    if cli.max_admissions.is_some() {
        config.limiter.max_admissions = cli.max_admissions;
    }
    if cli.window_millis.is_some() {
        config.limiter.window_millis = cli.window_millis;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.log_json {
        config.logging.json = true;
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Flip the returned channel to `true` on the first Ctrl+C or SIGTERM.
fn watch_for_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let received = next_signal().await;
        info!(signal = received, "Cancelling waiting callers");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn next_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            return ctrl_c().await;
        }
    };
    tokio::select! {
        received = ctrl_c() => received,
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn next_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
