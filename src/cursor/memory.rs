use super::{Checkpoint, CheckpointLog, CursorError, CursorFuture, CursorStore, Expectation};
use crate::grid::Bucket;
use crate::runtime::clock::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-local cursor store. Progress is lost on restart, so it suits tests
/// and pipelines whose sinks are themselves the source of truth.
#[derive(Clone)]
pub struct MemoryCursorStore {
    logs: Arc<Mutex<HashMap<String, CheckpointLog>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCursorStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryCursorStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn append_with(
        &self,
        pipeline_id: &str,
        expectation: Expectation<'_>,
        bucket: Bucket,
    ) -> Result<Checkpoint, CursorError> {
        let mut logs = self.logs.lock().expect("cursor store mutex poisoned");
        let log = logs.entry(pipeline_id.to_owned()).or_default();
        let checkpoint = log.prepare(pipeline_id, expectation, bucket, self.clock.now())?;
        log.push(checkpoint.clone());
        Ok(checkpoint)
    }
}

impl CursorStore for MemoryCursorStore {
    fn get_latest<'a>(&'a self, pipeline_id: &'a str) -> CursorFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            let logs = self.logs.lock().expect("cursor store mutex poisoned");
            Ok(logs.get(pipeline_id).and_then(|log| log.latest().cloned()))
        })
    }

    fn append<'a>(&'a self, pipeline_id: &'a str, bucket: Bucket) -> CursorFuture<'a, Checkpoint> {
        Box::pin(async move { self.append_with(pipeline_id, Expectation::Any, bucket) })
    }

    fn compare_and_append<'a>(
        &'a self,
        pipeline_id: &'a str,
        expected: Option<&'a Checkpoint>,
        bucket: Bucket,
    ) -> CursorFuture<'a, Checkpoint> {
        Box::pin(async move { self.append_with(pipeline_id, Expectation::Exactly(expected), bucket) })
    }

    fn history<'a>(&'a self, pipeline_id: &'a str) -> CursorFuture<'a, Vec<Checkpoint>> {
        Box::pin(async move {
            let logs = self.logs.lock().expect("cursor store mutex poisoned");
            Ok(logs
                .get(pipeline_id)
                .map(CheckpointLog::history)
                .unwrap_or_default())
        })
    }
}
