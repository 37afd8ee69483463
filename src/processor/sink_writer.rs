//! Sink write and checkpoint commit, in that order.

use crate::cursor::{Checkpoint, CursorStore};
use crate::runtime::unit::UnitError;
use crate::sink::{DerivedRecord, Provenance, Sink, SinkBatch};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SinkReceipt {
    pub checkpoint: Checkpoint,
    pub rows_written: u64,
    pub heartbeats: u64,
}

pub struct SinkWriter {
    sinks: Vec<Arc<dyn Sink>>,
    cursor: Arc<dyn CursorStore>,
}

impl SinkWriter {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, cursor: Arc<dyn CursorStore>) -> Self {
        Self { sinks, cursor }
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    pub fn cursor(&self) -> &Arc<dyn CursorStore> {
        &self.cursor
    }

    /// Hands every sink its batch (a heartbeat when it has no rows), then
    /// appends the checkpoint for the unit's bucket.
    ///
    /// A sink failure returns before the cursor is touched, so the bucket is
    /// replayed on the next tick. Sinks that already accepted the batch will
    /// see it again.
    pub async fn write(
        &self,
        provenance: &Provenance,
        per_sink: Vec<Vec<DerivedRecord>>,
        expected: Option<&Checkpoint>,
    ) -> Result<SinkReceipt, UnitError> {
        debug_assert_eq!(per_sink.len(), self.sinks.len());

        let mut rows_written = 0u64;
        let mut heartbeats = 0u64;

        for (sink, rows) in self.sinks.iter().zip(per_sink) {
            let batch = SinkBatch::new(sink.name(), provenance.clone(), rows);
            sink.write(&batch)
                .await
                .map_err(|source| UnitError::SinkWrite {
                    sink: sink.name().to_owned(),
                    source,
                })?;
            if batch.is_heartbeat() {
                heartbeats += 1;
            } else {
                rows_written += batch.rows().len() as u64;
            }
        }

        let checkpoint = self
            .cursor
            .compare_and_append(&provenance.pipeline_id, expected, provenance.bucket())
            .await
            .map_err(UnitError::CheckpointWrite)?;

        Ok(SinkReceipt {
            checkpoint,
            rows_written,
            heartbeats,
        })
    }
}
