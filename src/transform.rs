//! Business rules applied to scanned rows.
//!
//! A [`Transform`] is invoked once per `(record, sink)` pair and must be pure
//! apart from read-only lookups: the same input always yields the same
//! output, which is what makes re-processing a bucket after a crash safe.

use crate::source::SourceRecord;
use serde_json::Value;
use thiserror::Error;

/// Per-record failure. The record is skipped for that sink and counted; the
/// rest of the bucket proceeds.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("missing field `{0}`")]
    MissingField(String),
}

pub trait Transform: Send + Sync {
    /// Returns the derived payload for `sink`, or `None` to drop the record
    /// for that destination.
    fn apply(&self, record: &SourceRecord, sink: &str) -> Result<Option<Value>, TransformError>;
}

/// Forwards the source payload unchanged to every sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn apply(&self, record: &SourceRecord, _sink: &str) -> Result<Option<Value>, TransformError> {
        Ok(Some(record.payload.clone()))
    }
}

/// Adapts a closure into a [`Transform`].
pub struct FnTransform<F>(pub F);

impl<F> Transform for FnTransform<F>
where
    F: Fn(&SourceRecord, &str) -> Result<Option<Value>, TransformError> + Send + Sync,
{
    fn apply(&self, record: &SourceRecord, sink: &str) -> Result<Option<Value>, TransformError> {
        (self.0)(record, sink)
    }
}
