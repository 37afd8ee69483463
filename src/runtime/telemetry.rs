use crate::grid::Bucket;
use crate::runtime::progress::ProgressTracker;
use crate::runtime::unit::{StarvationError, UnitStage};
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
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// How a single tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Next bucket is still inside the lookback window; nothing was done.
    CaughtUp,
    /// Sinks accepted the unit and the checkpoint advanced.
    Committed,
    /// Recoverable failure; the same bucket is retried next tick.
    Failed {
        stage: UnitStage,
        consecutive_failures: u32,
        starved: bool,
    },
    /// Checkpoint could not be written after a successful sink write.
    Fatal { stage: UnitStage },
}

/// Per-tick measurements handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub pipeline_id: String,
    pub bucket: Option<Bucket>,
    pub duration: Duration,
    pub rows_scanned: u64,
    pub rows_excluded: u64,
    pub rows_written: u64,
    pub rows_failed: u64,
    pub heartbeats: u64,
    pub outcome: TickOutcome,
}

/// Observability collaborator. Implementations must be cheap; they run on the
/// scheduler task between ticks.
pub trait TickObserver: Send + Sync {
    fn on_tick(&self, report: &TickReport);

    fn on_starvation(&self, _alert: &StarvationError) {}
}

/// Rolling counters for one pipeline.
#[derive(Default, Debug)]
pub struct Telemetry {
    ticks: AtomicU64,
    caught_up: AtomicU64,
    units_committed: AtomicU64,
    heartbeats: AtomicU64,
    rows_scanned: AtomicU64,
    rows_excluded: AtomicU64,
    rows_written: AtomicU64,
    rows_failed: AtomicU64,
    scan_errors: AtomicU64,
    sink_errors: AtomicU64,
    cursor_errors: AtomicU64,
    starvation_alerts: AtomicU64,
}

impl Telemetry {
    pub fn record_tick(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.rows_scanned
            .fetch_add(report.rows_scanned, Ordering::Relaxed);
        self.rows_excluded
            .fetch_add(report.rows_excluded, Ordering::Relaxed);
        self.rows_failed.fetch_add(report.rows_failed, Ordering::Relaxed);

        match report.outcome {
            TickOutcome::CaughtUp => {
                self.caught_up.fetch_add(1, Ordering::Relaxed);
            }
            TickOutcome::Committed => {
                self.units_committed.fetch_add(1, Ordering::Relaxed);
                self.rows_written
                    .fetch_add(report.rows_written, Ordering::Relaxed);
                self.heartbeats
                    .fetch_add(report.heartbeats, Ordering::Relaxed);
            }
            TickOutcome::Failed { stage, .. } | TickOutcome::Fatal { stage } => {
                let counter = match stage {
                    UnitStage::Scan => &self.scan_errors,
                    UnitStage::SinkWrite => &self.sink_errors,
                    UnitStage::CursorRead | UnitStage::CheckpointWrite => &self.cursor_errors,
                    // Transform failures are per record and land in `rows_failed`.
                    UnitStage::Transform => return,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_starvation(&self) {
        self.starvation_alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            caught_up: self.caught_up.load(Ordering::Relaxed),
            units_committed: self.units_committed.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            rows_excluded: self.rows_excluded.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            scan_errors: self.scan_errors.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            cursor_errors: self.cursor_errors.load(Ordering::Relaxed),
            starvation_alerts: self.starvation_alerts.load(Ordering::Relaxed),
        }
    }

    pub fn units_committed(&self) -> u64 {
        self.units_committed.load(Ordering::Relaxed)
    }

    pub fn starvation_alerts(&self) -> u64 {
        self.starvation_alerts.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub ticks: u64,
    pub caught_up: u64,
    pub units_committed: u64,
    pub heartbeats: u64,
    pub rows_scanned: u64,
    pub rows_excluded: u64,
    pub rows_written: u64,
    pub rows_failed: u64,
    pub scan_errors: u64,
    pub sink_errors: u64,
    pub cursor_errors: u64,
    pub starvation_alerts: u64,
}

/// Spawns a background task that periodically logs unit throughput, cursor
/// position and error counters for one pipeline.
pub fn spawn_metrics_reporter(
    pipeline_id: String,
    telemetry: Arc<Telemetry>,
    progress: Arc<ProgressTracker>,
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
                    tracing::info!(target: "bucketline::metrics", pipeline = %pipeline_id, "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let units_delta = current
                        .units_committed
                        .saturating_sub(last_snapshot.units_committed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        units_delta as f64 / elapsed
                    };
                    let cursor = progress
                        .last_checkpoint()
                        .map(|cp| cp.bucket().to_string())
                        .unwrap_or_else(|| "<none>".to_owned());

                    tracing::info!(
                        target: "bucketline::metrics",
                        pipeline = %pipeline_id,
                        units_per_sec = format!("{throughput:.2}"),
                        cursor = %cursor,
                        stalled_for = progress.consecutive_failures(),
                        committed = current.units_committed,
                        caught_up = current.caught_up,
                        rows_written = current.rows_written,
                        rows_failed = current.rows_failed,
                        scan_errors = current.scan_errors,
                        sink_errors = current.sink_errors,
                        starvation_alerts = current.starvation_alerts,
                        "pipeline metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
