use crate::cursor::CursorError;
use crate::grid::Bucket;
use crate::sink::SinkError;
use crate::source::ScanError;
use std::fmt;
use thiserror::Error;

/// Stages of one processing unit, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStage {
    CursorRead,
    Scan,
    Transform,
    SinkWrite,
    CheckpointWrite,
}

impl fmt::Display for UnitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitStage::CursorRead => "cursor_read",
            UnitStage::Scan => "scan",
            UnitStage::Transform => "transform",
            UnitStage::SinkWrite => "sink_write",
            UnitStage::CheckpointWrite => "checkpoint_write",
        };
        f.write_str(label)
    }
}

/// Failure of a processing unit. Only [`UnitError::CheckpointWrite`] is fatal;
/// every other variant leaves the cursor in place so the same bucket is
/// retried on the next tick.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("failed to read checkpoint: {0}")]
    CursorRead(#[source] CursorError),
    #[error("transient scan failure: {0}")]
    TransientScan(#[source] ScanError),
    #[error("sink `{sink}` rejected batch: {source}")]
    SinkWrite {
        sink: String,
        #[source]
        source: SinkError,
    },
    #[error("failed to append checkpoint after sink write: {0}")]
    CheckpointWrite(#[source] CursorError),
}

impl UnitError {
    pub fn stage(&self) -> UnitStage {
        match self {
            UnitError::CursorRead(_) => UnitStage::CursorRead,
            UnitError::TransientScan(_) => UnitStage::Scan,
            UnitError::SinkWrite { .. } => UnitStage::SinkWrite,
            UnitError::CheckpointWrite(_) => UnitStage::CheckpointWrite,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, UnitError::CheckpointWrite(_))
    }
}

/// Raised when the same bucket keeps failing. Never causes the bucket to be
/// skipped; it only escalates.
#[derive(Debug, Clone, Error)]
#[error(
    "pipeline {pipeline_id} stuck on bucket {bucket} after {consecutive_failures} consecutive failures (last stage: {stage})"
)]
pub struct StarvationError {
    pub pipeline_id: String,
    pub bucket: Bucket,
    pub consecutive_failures: u32,
    pub stage: UnitStage,
}
