use super::{Sink, SinkBatch, SinkError};
use crate::grid::Bucket;
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Sink that keeps every accepted batch in memory. Clones share storage, so a
/// test can hand one clone to a pipeline and inspect another.
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    batches: Arc<Mutex<Vec<SinkBatch>>>,
    pending_failures: Arc<AtomicU32>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Arc::new(Mutex::new(Vec::new())),
            pending_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Rejects the next `count` writes.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<SinkBatch> {
        self.batches.lock().expect("memory sink mutex poisoned").clone()
    }

    pub fn row_count(&self) -> usize {
        self.batches
            .lock()
            .expect("memory sink mutex poisoned")
            .iter()
            .map(|batch| batch.rows().len())
            .sum()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.batches
            .lock()
            .expect("memory sink mutex poisoned")
            .iter()
            .filter(|batch| batch.is_heartbeat())
            .count()
    }

    /// Buckets with at least one accepted batch, collapsing replays.
    pub fn distinct_buckets(&self) -> BTreeSet<Bucket> {
        self.batches
            .lock()
            .expect("memory sink mutex poisoned")
            .iter()
            .map(|batch| batch.provenance.bucket())
            .collect()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write<'a>(&'a self, batch: &'a SinkBatch) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let injected = self
                .pending_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(SinkError::Rejected("injected sink failure".into()));
            }

            self.batches
                .lock()
                .expect("memory sink mutex poisoned")
                .push(batch.clone());
            Ok(())
        })
    }
}
