//! Durable, append-only record of how far each pipeline has advanced.
//!
//! Checkpoints are never mutated, only superseded. The current checkpoint is
//! the record with the greatest `(recorded_at, sequence_no)`; insertion order
//! is never consulted. Writers go through [`CursorStore::compare_and_append`]
//! so a second scheduler racing on the same pipeline fails loudly instead of
//! silently interleaving progress.

pub mod file;
pub mod memory;

use crate::grid::Bucket;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileCursorStore;
pub use memory::MemoryCursorStore;

/// One persisted progress marker: `(interval, partition)` was fully processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline_id: String,
    pub interval: DateTime<Utc>,
    pub partition: u32,
    pub recorded_at: DateTime<Utc>,
    pub sequence_no: u64,
}

impl Checkpoint {
    pub fn bucket(&self) -> Bucket {
        Bucket::new(self.interval, self.partition)
    }

    fn selection_key(&self) -> (DateTime<Utc>, u64) {
        (self.recorded_at, self.sequence_no)
    }
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error(
        "checkpoint conflict for pipeline {pipeline_id}: expected sequence {expected:?}, found {found:?}"
    )]
    Conflict {
        pipeline_id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    #[error("checkpoint for pipeline {pipeline_id} does not advance: {attempted} is not after {current}")]
    NotAdvancing {
        pipeline_id: String,
        current: Bucket,
        attempted: Bucket,
    },
    #[error("checkpoint store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt checkpoint record at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
}

pub type CursorFuture<'a, T> = BoxFuture<'a, Result<T, CursorError>>;

/// Storage for checkpoints. One store instance per pipeline by convention;
/// pipelines never share progress.
pub trait CursorStore: Send + Sync {
    /// Most recent checkpoint, or `None` if the pipeline never committed.
    fn get_latest<'a>(&'a self, pipeline_id: &'a str) -> CursorFuture<'a, Option<Checkpoint>>;

    /// Appends a checkpoint unconditionally (ordering is still enforced).
    fn append<'a>(&'a self, pipeline_id: &'a str, bucket: Bucket) -> CursorFuture<'a, Checkpoint>;

    /// Appends only if the current checkpoint is still `expected`.
    fn compare_and_append<'a>(
        &'a self,
        pipeline_id: &'a str,
        expected: Option<&'a Checkpoint>,
        bucket: Bucket,
    ) -> CursorFuture<'a, Checkpoint>;

    /// Every checkpoint recorded for the pipeline, ordered by sequence number.
    fn history<'a>(&'a self, pipeline_id: &'a str) -> CursorFuture<'a, Vec<Checkpoint>>;
}

#[derive(Clone, Copy)]
pub(crate) enum Expectation<'a> {
    Any,
    Exactly(Option<&'a Checkpoint>),
}

/// In-memory checkpoint history for a single pipeline, shared by the store
/// implementations.
#[derive(Debug, Default, Clone)]
pub(crate) struct CheckpointLog {
    records: Vec<Checkpoint>,
}

impl CheckpointLog {
    pub(crate) fn push(&mut self, checkpoint: Checkpoint) {
        self.records.push(checkpoint);
    }

    pub(crate) fn latest(&self) -> Option<&Checkpoint> {
        self.records.iter().max_by_key(|cp| cp.selection_key())
    }

    pub(crate) fn history(&self) -> Vec<Checkpoint> {
        let mut records = self.records.clone();
        records.sort_by_key(|cp| cp.sequence_no);
        records
    }

    /// Builds the next record without persisting it.
    pub(crate) fn prepare(
        &self,
        pipeline_id: &str,
        expectation: Expectation<'_>,
        bucket: Bucket,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint, CursorError> {
        let latest = self.latest();

        if let Expectation::Exactly(expected) = expectation {
            let matches = match (expected, latest) {
                (None, None) => true,
                (Some(expected), Some(current)) => {
                    expected.sequence_no == current.sequence_no
                        && expected.bucket() == current.bucket()
                }
                _ => false,
            };
            if !matches {
                return Err(CursorError::Conflict {
                    pipeline_id: pipeline_id.to_owned(),
                    expected: expected.map(|cp| cp.sequence_no),
                    found: latest.map(|cp| cp.sequence_no),
                });
            }
        }

        if let Some(current) = latest {
            if bucket <= current.bucket() {
                return Err(CursorError::NotAdvancing {
                    pipeline_id: pipeline_id.to_owned(),
                    current: current.bucket(),
                    attempted: bucket,
                });
            }
        }

        let recorded_at = latest
            .map(|cp| cp.recorded_at.max(now))
            .unwrap_or(now);
        let sequence_no = self
            .records
            .iter()
            .map(|cp| cp.sequence_no)
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Checkpoint {
            pipeline_id: pipeline_id.to_owned(),
            interval: bucket.interval,
            partition: bucket.partition,
            recorded_at,
            sequence_no,
        })
    }
}
