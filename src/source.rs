//! Source collaborators: the append-only dataset the pipeline drains and the
//! exclusion lookup consulted while filtering it.
//!
//! Scans are expected to be cheap only if the source is physically clustered
//! by `(partition, interval)`. A source that has to filter a whole partition
//! to answer a bucket query still returns correct results, but the scheduler
//! will report the read amplification.

pub mod circuit_breaker;
pub mod exclusion;
pub mod memory;
pub mod record;

use crate::grid::Bucket;
use chrono::TimeDelta;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

pub use circuit_breaker::{CircuitState, SourceCircuitBreaker};
pub use exclusion::{ExclusionLookup, NoExclusions, StaticExclusions};
pub use memory::{MemorySource, SourceLayout};
pub use record::SourceRecord;

/// Everything a source needs to answer "give me the rows of this bucket".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketQuery {
    pub bucket: Bucket,
    pub granularity: TimeDelta,
    pub partition_count: u32,
}

/// Rows returned by a scan plus how many rows the source had to touch.
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    pub records: Vec<SourceRecord>,
    pub rows_examined: u64,
}

/// Scan failures. All of them are transient: the bucket is retried next tick.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("scan timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("source circuit breaker is open")]
    CircuitOpen,
    #[error("exclusion lookup failed: {0}")]
    Lookup(String),
}

/// Read side of the source dataset.
///
/// `scan` must be restartable and free of side effects: issuing the same
/// query twice against unchanged data yields the same rows in the same order.
pub trait SourceReader: Send + Sync {
    fn scan<'a>(&'a self, query: &'a BucketQuery) -> BoxFuture<'a, Result<ScanBatch, ScanError>>;
}
