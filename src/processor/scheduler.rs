//! Fixed-cadence driver for one pipeline.
//!
//! Each tick reads the checkpoint, asks the sequencer for the next bucket and
//! pushes that bucket through scan, transform and sink write. The checkpoint
//! only moves after every sink accepted its batch. Any recoverable failure
//! leaves the cursor where it was, so the next tick retries the same bucket.

use super::scan::ScanStage;
use super::sequencer::{CursorPosition, Next, Sequencer};
use super::sink_writer::SinkWriter;
use super::transform::TransformStage;
use crate::cursor::{Checkpoint, CursorStore};
use crate::grid::{self, Bucket};
use crate::runtime::clock::{Clock, SystemClock};
use crate::runtime::config::PipelineConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::options::SchedulerOptions;
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::{Telemetry, TickObserver, TickOutcome, TickReport};
use crate::runtime::unit::{StarvationError, UnitError};
use crate::sink::{Provenance, Sink};
use crate::source::{ExclusionLookup, NoExclusions, SourceReader};
use crate::transform::{Passthrough, Transform};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Processing,
}

/// Counters accumulated while a unit runs, kept even if the unit fails.
#[derive(Debug, Default)]
struct UnitTally {
    bucket: Option<Bucket>,
    rows_scanned: u64,
    rows_excluded: u64,
    rows_written: u64,
    rows_failed: u64,
    heartbeats: u64,
}

enum UnitProgress {
    CaughtUp,
    Committed(Checkpoint),
}

pub struct PipelineScheduler {
    pipeline_id: String,
    config: PipelineConfig,
    options: SchedulerOptions,
    origin: DateTime<Utc>,
    sequencer: Sequencer,
    scan: ScanStage,
    transform: TransformStage,
    writer: SinkWriter,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn TickObserver>>,
    telemetry: Arc<Telemetry>,
    progress: Arc<ProgressTracker>,
    processing: Arc<AtomicBool>,
}

impl PipelineScheduler {
    pub fn builder(
        pipeline_id: impl Into<String>,
        config: PipelineConfig,
    ) -> PipelineSchedulerBuilder {
        PipelineSchedulerBuilder::new(pipeline_id.into(), config)
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    pub fn state(&self) -> SchedulerState {
        state_of(&self.processing)
    }

    /// Shared view of [`Self::state`] that stays valid once the scheduler
    /// has been moved into its task.
    pub fn state_probe(&self) -> StateProbe {
        StateProbe(self.processing.clone())
    }

    /// Processes at most one bucket.
    ///
    /// Recoverable failures come back as `Err` with the cursor untouched and
    /// are already accounted for in telemetry, progress and observers. Only
    /// [`UnitError::CheckpointWrite`] requires the caller to stop.
    pub async fn tick(&mut self) -> Result<TickReport, UnitError> {
        let started = Instant::now();
        let mut tally = UnitTally::default();

        self.processing.store(true, Ordering::SeqCst);
        let result = self.process_unit(&mut tally).await;
        self.processing.store(false, Ordering::SeqCst);

        let (outcome, starvation) = match &result {
            Ok(UnitProgress::CaughtUp) => (TickOutcome::CaughtUp, None),
            Ok(UnitProgress::Committed(checkpoint)) => {
                self.progress.mark_checkpointed(checkpoint.clone());
                (TickOutcome::Committed, None)
            }
            Err(err) if err.is_fatal() => (TickOutcome::Fatal { stage: err.stage() }, None),
            Err(err) => self.record_failure(&tally, err),
        };

        let report = TickReport {
            pipeline_id: self.pipeline_id.clone(),
            bucket: tally.bucket,
            duration: started.elapsed(),
            rows_scanned: tally.rows_scanned,
            rows_excluded: tally.rows_excluded,
            rows_written: tally.rows_written,
            rows_failed: tally.rows_failed,
            heartbeats: tally.heartbeats,
            outcome,
        };

        self.telemetry.record_tick(&report);
        for observer in &self.observers {
            observer.on_tick(&report);
            if let Some(alert) = &starvation {
                observer.on_starvation(alert);
            }
        }

        result.map(|_| report)
    }

    /// Tick loop. Cancellation is only observed between ticks: a unit that
    /// has started always runs to completion, including its checkpoint.
    pub async fn run(
        &mut self,
        shutdown: CancellationToken,
        fatal: FatalErrorHandler,
    ) -> Result<()> {
        let period = self.config.tick_period();
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        match self.cursor().get_latest(&self.pipeline_id).await {
            Ok(checkpoint) => self.progress.reset(checkpoint),
            Err(err) => {
                tracing::warn!(pipeline = %self.pipeline_id, error = %err, "failed to read initial checkpoint; will retry on first tick");
                self.progress.reset(None);
            }
        }

        tracing::info!(
            pipeline = %self.pipeline_id,
            granularity = ?self.config.granularity(),
            partitions = self.config.partition_count(),
            lookback = ?self.config.lookback(),
            tick_period = ?period,
            resume_from = ?self.progress.last_bucket().map(|b| b.to_string()),
            "pipeline scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!(pipeline = %self.pipeline_id, "pipeline scheduler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            match self.tick().await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(fatal.trigger(err)),
                Err(_) => {}
            }

            let elapsed = started.elapsed();
            if elapsed > period {
                tracing::warn!(
                    pipeline = %self.pipeline_id,
                    elapsed = ?elapsed,
                    tick_period = ?period,
                    "tick overran its period; next tick delayed"
                );
            }
        }
    }

    fn cursor(&self) -> &Arc<dyn CursorStore> {
        self.writer.cursor()
    }

    async fn process_unit(&self, tally: &mut UnitTally) -> Result<UnitProgress, UnitError> {
        let latest = self
            .cursor()
            .get_latest(&self.pipeline_id)
            .await
            .map_err(UnitError::CursorRead)?;

        let position = latest
            .as_ref()
            .map(|cp| CursorPosition::At(cp.bucket()))
            .unwrap_or(CursorPosition::Before(self.origin));

        let bucket = match self.sequencer.next(position, self.clock.now()) {
            Next::Bucket(bucket) => bucket,
            Next::CaughtUp { candidate, horizon } => {
                tracing::trace!(
                    pipeline = %self.pipeline_id,
                    candidate = ?candidate.map(|b| b.to_string()),
                    horizon = %horizon,
                    "caught up; waiting for lookback window"
                );
                return Ok(UnitProgress::CaughtUp);
            }
        };
        tally.bucket = Some(bucket);

        let scanned = self
            .scan
            .scan(bucket)
            .await
            .map_err(UnitError::TransientScan)?;
        tally.rows_scanned = scanned.rows_matched;
        tally.rows_excluded = scanned.rows_excluded;

        let provenance = Provenance::new(self.pipeline_id.clone(), bucket);
        let sink_names = self.writer.sink_names();
        let transformed = self
            .transform
            .run(&provenance, &scanned.records, &sink_names);
        tally.rows_failed = transformed.rows_failed;

        let receipt = self
            .writer
            .write(&provenance, transformed.per_sink, latest.as_ref())
            .await?;
        tally.rows_written = receipt.rows_written;
        tally.heartbeats = receipt.heartbeats;

        tracing::debug!(
            pipeline = %self.pipeline_id,
            bucket = %bucket,
            sequence_no = receipt.checkpoint.sequence_no,
            rows_written = receipt.rows_written,
            heartbeats = receipt.heartbeats,
            "bucket committed"
        );

        Ok(UnitProgress::Committed(receipt.checkpoint))
    }

    fn record_failure(
        &self,
        tally: &UnitTally,
        err: &UnitError,
    ) -> (TickOutcome, Option<StarvationError>) {
        let stage = err.stage();
        // A cursor read failure happens before a bucket is known; count it
        // against the last bucket the tracker saw.
        let bucket = tally
            .bucket
            .or_else(|| self.progress.stalled_bucket())
            .unwrap_or_else(|| self.fallback_bucket());
        let consecutive_failures = self.progress.mark_failed(bucket);
        let threshold = self.options.starvation_threshold;
        let starved = consecutive_failures >= threshold;

        tracing::warn!(
            pipeline = %self.pipeline_id,
            bucket = %bucket,
            stage = %stage,
            consecutive_failures,
            error = %err,
            "unit failed; bucket will be retried next tick"
        );

        let alert = (starved && consecutive_failures % threshold == 0).then(|| {
            let alert = StarvationError {
                pipeline_id: self.pipeline_id.clone(),
                bucket,
                consecutive_failures,
                stage,
            };
            tracing::error!(
                pipeline = %self.pipeline_id,
                bucket = %bucket,
                consecutive_failures,
                stage = %stage,
                error = %alert,
                "pipeline starving on bucket; operator attention required"
            );
            self.telemetry.record_starvation();
            alert
        });

        (
            TickOutcome::Failed {
                stage,
                consecutive_failures,
                starved,
            },
            alert,
        )
    }

    fn fallback_bucket(&self) -> Bucket {
        match self.progress.last_bucket() {
            Some(bucket) => bucket,
            None => Bucket::new(
                grid::truncate(self.origin, self.config.granularity_delta()),
                0,
            ),
        }
    }
}

/// Cloneable read-only handle on a scheduler's state.
#[derive(Debug, Clone)]
pub struct StateProbe(Arc<AtomicBool>);

impl StateProbe {
    pub fn get(&self) -> SchedulerState {
        state_of(&self.0)
    }
}

fn state_of(flag: &AtomicBool) -> SchedulerState {
    if flag.load(Ordering::SeqCst) {
        SchedulerState::Processing
    } else {
        SchedulerState::Idle
    }
}

pub struct PipelineSchedulerBuilder {
    pipeline_id: String,
    config: PipelineConfig,
    options: SchedulerOptions,
    origin: Option<DateTime<Utc>>,
    source: Option<Arc<dyn SourceReader>>,
    exclusions: Arc<dyn ExclusionLookup>,
    transform: Arc<dyn Transform>,
    sinks: Vec<Arc<dyn Sink>>,
    cursor: Option<Arc<dyn CursorStore>>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn TickObserver>>,
}

impl PipelineSchedulerBuilder {
    fn new(pipeline_id: String, config: PipelineConfig) -> Self {
        Self {
            pipeline_id,
            config,
            options: SchedulerOptions::default(),
            origin: None,
            source: None,
            exclusions: Arc::new(NoExclusions),
            transform: Arc::new(Passthrough),
            sinks: Vec::new(),
            cursor: None,
            clock: Arc::new(SystemClock),
            observers: Vec::new(),
        }
    }

    /// First interval processed when the pipeline has no checkpoint yet.
    pub fn origin(mut self, origin: DateTime<Utc>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn source(mut self, source: Arc<dyn SourceReader>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn exclusions(mut self, exclusions: Arc<dyn ExclusionLookup>) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn cursor(mut self, cursor: Arc<dyn CursorStore>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TickObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<PipelineScheduler> {
        if self.pipeline_id.trim().is_empty() {
            bail!("pipeline id must not be empty");
        }
        self.config
            .validate()
            .with_context(|| format!("invalid config for pipeline {}", self.pipeline_id))?;
        self.options
            .validate()
            .with_context(|| format!("invalid scheduler options for pipeline {}", self.pipeline_id))?;

        let origin = self
            .origin
            .ok_or_else(|| anyhow!("origin is required for pipeline {}", self.pipeline_id))?;
        let source = self
            .source
            .ok_or_else(|| anyhow!("source is required for pipeline {}", self.pipeline_id))?;
        let cursor = self
            .cursor
            .ok_or_else(|| anyhow!("cursor store is required for pipeline {}", self.pipeline_id))?;
        if self.sinks.is_empty() {
            bail!("pipeline {} needs at least one sink", self.pipeline_id);
        }
        let mut names: Vec<&str> = self.sinks.iter().map(|sink| sink.name()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            bail!("pipeline {} has duplicate sink names", self.pipeline_id);
        }

        Ok(PipelineScheduler {
            sequencer: Sequencer::new(&self.config),
            scan: ScanStage::new(&self.config, &self.options, source, self.exclusions),
            transform: TransformStage::new(self.transform),
            writer: SinkWriter::new(self.sinks, cursor),
            pipeline_id: self.pipeline_id,
            config: self.config,
            options: self.options,
            origin,
            clock: self.clock,
            observers: self.observers,
            telemetry: Arc::new(Telemetry::default()),
            progress: Arc::new(ProgressTracker::default()),
            processing: Arc::new(AtomicBool::new(false)),
        })
    }
}
