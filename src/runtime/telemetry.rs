use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Run-wide counters shared by the locator, the scanner and the reporter.
#[derive(Default, Debug)]
pub struct Telemetry {
    windows: AtomicU64,
    messages: AtomicU64,
    checkpoints: AtomicU64,
    date_probes: AtomicU64,
    fallback_dates: AtomicU64,
    remote_errors: AtomicU64,
    remote_timeouts: AtomicU64,
    reconnects: AtomicU64,
}

impl Telemetry {
    pub fn record_window(&self, messages: u64) {
        self.windows.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_date_probe(&self) {
        self.date_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_date(&self) {
        self.fallback_dates.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds the remote counters of a closed connection pair into the run totals.
    pub fn record_remote(&self, errors: u64, timeouts: u64, reconnects: u64) {
        self.remote_errors.fetch_add(errors, Ordering::Relaxed);
        self.remote_timeouts.fetch_add(timeouts, Ordering::Relaxed);
        self.reconnects.fetch_add(reconnects, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            windows: self.windows.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            date_probes: self.date_probes.load(Ordering::Relaxed),
            fallback_dates: self.fallback_dates.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            remote_timeouts: self.remote_timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    pub fn windows(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }

    pub fn date_probes(&self) -> u64 {
        self.date_probes.load(Ordering::Relaxed)
    }

    pub fn fallback_dates(&self) -> u64 {
        self.fallback_dates.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub windows: u64,
    pub messages: u64,
    pub checkpoints: u64,
    pub date_probes: u64,
    pub fallback_dates: u64,
    pub remote_errors: u64,
    pub remote_timeouts: u64,
    pub reconnects: u64,
}

/// Spawns a background task that periodically logs scan throughput and probe counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "backfill::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let scanned = current.messages.saturating_sub(last_snapshot.messages);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        scanned as f64 / elapsed
                    };

                    tracing::info!(
                        target: "backfill::metrics",
                        throughput = format!("{throughput:.2}"),
                        windows = current.windows,
                        messages = current.messages,
                        checkpoints = current.checkpoints,
                        date_probes = current.date_probes,
                        fallback_dates = current.fallback_dates,
                        "backfill metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
