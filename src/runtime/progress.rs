use crate::cursor::Checkpoint;
use crate::grid::Bucket;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory mirror of a pipeline's cursor and retry state, readable from
/// outside the scheduler task. The cursor store stays the source of truth.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_checkpoint: Mutex<Option<Checkpoint>>,
    stalled_bucket: Mutex<Option<Bucket>>,
    consecutive_failures: AtomicU32,
}

impl ProgressTracker {
    pub fn reset(&self, checkpoint: Option<Checkpoint>) {
        *self.last_checkpoint.lock().expect("progress mutex poisoned") = checkpoint;
        self.clear_failures();
    }

    pub fn mark_checkpointed(&self, checkpoint: Checkpoint) {
        *self.last_checkpoint.lock().expect("progress mutex poisoned") = Some(checkpoint);
        self.clear_failures();
    }

    /// Records a failure on `bucket` and returns how many consecutive failures
    /// that bucket has accumulated.
    pub fn mark_failed(&self, bucket: Bucket) -> u32 {
        let mut stalled = self.stalled_bucket.lock().expect("progress mutex poisoned");
        if *stalled == Some(bucket) {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            *stalled = Some(bucket);
            self.consecutive_failures.store(1, Ordering::SeqCst);
            1
        }
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.last_checkpoint
            .lock()
            .expect("progress mutex poisoned")
            .clone()
    }

    pub fn last_bucket(&self) -> Option<Bucket> {
        self.last_checkpoint().map(|cp| cp.bucket())
    }

    pub fn stalled_bucket(&self) -> Option<Bucket> {
        *self.stalled_bucket.lock().expect("progress mutex poisoned")
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn clear_failures(&self) {
        *self.stalled_bucket.lock().expect("progress mutex poisoned") = None;
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }
}
