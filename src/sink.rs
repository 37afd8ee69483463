//! Append-only destinations for derived rows.
//!
//! Sinks receive exactly one batch per bucket per attempt. Because the cursor
//! is only advanced after every sink accepted its batch, a crash between the
//! two can replay a bucket: sinks must tolerate duplicate batches for the same
//! `(pipeline, interval, partition)` provenance.

pub mod jsonl;
pub mod memory;

use crate::grid::Bucket;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use jsonl::JsonLinesSink;
pub use memory::MemorySink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("destination rejected batch: {0}")]
    Rejected(String),
}

/// Where a derived row or heartbeat came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub pipeline_id: String,
    pub interval: DateTime<Utc>,
    pub partition: u32,
}

impl Provenance {
    pub fn new(pipeline_id: impl Into<String>, bucket: Bucket) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            interval: bucket.interval,
            partition: bucket.partition,
        }
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::new(self.interval, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub provenance: Provenance,
    pub partition_key: String,
    pub event_timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Rows(Vec<DerivedRecord>),
    /// Zero-row marker proving the bucket was processed.
    Heartbeat,
}

/// Everything one sink receives for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkBatch {
    pub sink: String,
    pub provenance: Provenance,
    pub kind: BatchKind,
}

impl SinkBatch {
    /// Builds a row batch, or a heartbeat when `rows` is empty.
    pub fn new(sink: impl Into<String>, provenance: Provenance, rows: Vec<DerivedRecord>) -> Self {
        let kind = if rows.is_empty() {
            BatchKind::Heartbeat
        } else {
            BatchKind::Rows(rows)
        };
        Self {
            sink: sink.into(),
            provenance,
            kind,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.kind, BatchKind::Heartbeat)
    }

    pub fn rows(&self) -> &[DerivedRecord] {
        match &self.kind {
            BatchKind::Rows(rows) => rows,
            BatchKind::Heartbeat => &[],
        }
    }
}

pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Appends `batch` as one unit visible to readers all at once.
    fn write<'a>(&'a self, batch: &'a SinkBatch) -> BoxFuture<'a, Result<(), SinkError>>;
}
