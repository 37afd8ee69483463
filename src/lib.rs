pub mod cursor;
pub mod grid;
pub mod processor;
pub mod runtime;
pub mod sink;
pub mod source;
pub mod transform;

pub use cursor::{Checkpoint, CursorError, CursorStore, FileCursorStore, MemoryCursorStore};
pub use grid::{bucket_of, partition_of, truncate, Bucket};
pub use processor::scan::{ScanOutcome, ScanStage};
pub use processor::scheduler::{
    PipelineScheduler, PipelineSchedulerBuilder, SchedulerState, StateProbe,
};
pub use processor::sequencer::{CursorPosition, Next, Sequencer};
pub use sink::{
    BatchKind, DerivedRecord, JsonLinesSink, MemorySink, Provenance, Sink, SinkBatch, SinkError,
};
pub use source::{
    BucketQuery, ExclusionLookup, MemorySource, NoExclusions, ScanBatch, ScanError,
    SourceCircuitBreaker, SourceLayout, SourceReader, SourceRecord, StaticExclusions,
};
pub use transform::{FnTransform, Passthrough, Transform, TransformError};
pub use runtime::clock::{Clock, ManualClock, SystemClock};
pub use runtime::config::{PipelineConfig, PipelineConfigBuilder, PipelineConfigParams};
pub use runtime::options::SchedulerOptions;
pub use runtime::runner::Runner;
pub use runtime::telemetry::{
    init_tracing, Telemetry, TelemetrySnapshot, TickObserver, TickOutcome, TickReport,
};
pub use runtime::unit::{StarvationError, UnitError, UnitStage};
