use crate::runtime::unit::UnitStage;
use crate::sink::{DerivedRecord, Provenance};
use crate::source::SourceRecord;
use crate::transform::Transform;
use std::sync::Arc;

/// Derived rows for every sink of one unit.
#[derive(Debug, Clone, Default)]
pub struct TransformOutcome {
    /// Indexed like the sink list handed to [`TransformStage::run`].
    pub per_sink: Vec<Vec<DerivedRecord>>,
    /// `(record, sink)` pairs the transform refused.
    pub rows_failed: u64,
}

impl TransformOutcome {
    pub fn rows(&self) -> u64 {
        self.per_sink.iter().map(|rows| rows.len() as u64).sum()
    }
}

pub struct TransformStage {
    transform: Arc<dyn Transform>,
}

impl TransformStage {
    pub fn new(transform: Arc<dyn Transform>) -> Self {
        Self { transform }
    }

    /// Applies the transform to every record for every sink. A record the
    /// transform rejects is logged and left out; the unit still commits.
    pub fn run(
        &self,
        provenance: &Provenance,
        records: &[SourceRecord],
        sinks: &[&str],
    ) -> TransformOutcome {
        let mut outcome = TransformOutcome {
            per_sink: vec![Vec::new(); sinks.len()],
            rows_failed: 0,
        };

        for record in records {
            for (idx, sink) in sinks.iter().enumerate() {
                match self.transform.apply(record, sink) {
                    Ok(Some(payload)) => outcome.per_sink[idx].push(DerivedRecord {
                        provenance: provenance.clone(),
                        partition_key: record.partition_key.clone(),
                        event_timestamp: record.event_timestamp,
                        payload,
                    }),
                    Ok(None) => {}
                    Err(err) => {
                        outcome.rows_failed += 1;
                        tracing::warn!(
                            pipeline = %provenance.pipeline_id,
                            bucket = %provenance.bucket(),
                            stage = %UnitStage::Transform,
                            sink = %sink,
                            partition_key = %record.partition_key,
                            error = %err,
                            "transform rejected record; skipping it"
                        );
                    }
                }
            }
        }

        outcome
    }
}
