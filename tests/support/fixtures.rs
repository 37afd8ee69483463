use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bucketline::{
    Clock, CursorStore, ManualClock, MemoryCursorStore, MemorySink, MemorySource,
    PipelineConfig, PipelineScheduler, SchedulerOptions, StaticExclusions, Transform,
};
use chrono::{DateTime, Utc};

use super::helpers::RecordingObserver;

pub fn hourly_config(partition_count: u32) -> PipelineConfig {
    PipelineConfig::builder()
        .granularity(Duration::from_secs(3600))
        .partition_count(partition_count)
        .lookback(Duration::from_secs(300))
        .tick_period(Duration::from_millis(10))
        .build()
        .expect("valid test config")
}

/// One pipeline's worth of in-memory collaborators sharing a manual clock.
pub struct Fixture {
    pub config: PipelineConfig,
    pub clock: Arc<ManualClock>,
    pub source: Arc<MemorySource>,
    pub exclusions: Arc<StaticExclusions>,
    pub sink: MemorySink,
    pub cursor: Arc<dyn CursorStore>,
    pub observer: Arc<RecordingObserver>,
    pub options: SchedulerOptions,
    pub transform: Option<Arc<dyn Transform>>,
}

impl Fixture {
    pub fn new(config: PipelineConfig, now: DateTime<Utc>) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let source = Arc::new(MemorySource::with_clock(&config, clock.clone()));
        let cursor: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new(clock.clone()));
        Self {
            config,
            clock,
            source,
            exclusions: Arc::new(StaticExclusions::default()),
            sink: MemorySink::new("warehouse"),
            cursor,
            observer: Arc::new(RecordingObserver::default()),
            options: SchedulerOptions {
                metrics_interval: Duration::from_millis(50),
                ..SchedulerOptions::default()
            },
            transform: None,
        }
    }

    pub fn with_cursor(mut self, cursor: Arc<dyn CursorStore>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn scheduler(&self, pipeline_id: &str, origin: DateTime<Utc>) -> Result<PipelineScheduler> {
        let mut builder = PipelineScheduler::builder(pipeline_id, self.config.clone())
            .origin(origin)
            .options(self.options.clone())
            .source(self.source.clone())
            .exclusions(self.exclusions.clone())
            .sink(Arc::new(self.sink.clone()))
            .cursor(self.cursor.clone())
            .clock(self.clock.clone())
            .observer(self.observer.clone());
        if let Some(transform) = &self.transform {
            builder = builder.transform(transform.clone());
        }
        builder.build()
    }
}
