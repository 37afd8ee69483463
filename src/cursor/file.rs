use super::{Checkpoint, CheckpointLog, CursorError, CursorFuture, CursorStore, Expectation};
use crate::grid::Bucket;
use crate::runtime::clock::Clock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Cursor store backed by a JSON-lines file. Each append writes one line and
/// is fsynced before the call returns, so a checkpoint that was reported as
/// written survives a crash. An unterminated trailing line was never
/// acknowledged and is cut off when the store is reopened.
pub struct FileCursorStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    logs: HashMap<String, CheckpointLog>,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

impl FileCursorStore {
    /// Opens (or creates) the store at `path`, replaying every existing record.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, CursorError> {
        let path = path.as_ref().to_path_buf();
        let logs = load_logs(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::debug!(
            path = %path.display(),
            pipelines = logs.len(),
            "opened file cursor store"
        );

        Ok(Self {
            path,
            clock,
            state: Mutex::new(FileState {
                file,
                logs,
                poisoned: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_with(
        &self,
        pipeline_id: &str,
        expectation: Expectation<'_>,
        bucket: Bucket,
    ) -> Result<Checkpoint, CursorError> {
        let mut state = self.state.lock().await;
        if state.poisoned {
            return Err(CursorError::Io(std::io::Error::other(format!(
                "cursor store {} holds a partial record; reopen it to recover",
                self.path.display()
            ))));
        }
        let now = self.clock.now();
        let checkpoint = match state.logs.get(pipeline_id) {
            Some(log) => log.prepare(pipeline_id, expectation, bucket, now)?,
            None => CheckpointLog::default().prepare(pipeline_id, expectation, bucket, now)?,
        };

        let mut line = serde_json::to_vec(&checkpoint).map_err(CursorError::Encode)?;
        line.push(b'\n');
        let offset = state.file.metadata().await?.len();
        if let Err(err) = write_record(&mut state.file, &line).await {
            if let Err(rollback) = state.file.set_len(offset).await {
                state.poisoned = true;
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial checkpoint record; store poisoned"
                );
            }
            return Err(err.into());
        }

        state
            .logs
            .entry(pipeline_id.to_owned())
            .or_default()
            .push(checkpoint.clone());
        Ok(checkpoint)
    }
}

impl CursorStore for FileCursorStore {
    fn get_latest<'a>(&'a self, pipeline_id: &'a str) -> CursorFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .logs
                .get(pipeline_id)
                .and_then(|log| log.latest().cloned()))
        })
    }

    fn append<'a>(&'a self, pipeline_id: &'a str, bucket: Bucket) -> CursorFuture<'a, Checkpoint> {
        Box::pin(self.append_with(pipeline_id, Expectation::Any, bucket))
    }

    fn compare_and_append<'a>(
        &'a self,
        pipeline_id: &'a str,
        expected: Option<&'a Checkpoint>,
        bucket: Bucket,
    ) -> CursorFuture<'a, Checkpoint> {
        Box::pin(self.append_with(pipeline_id, Expectation::Exactly(expected), bucket))
    }

    fn history<'a>(&'a self, pipeline_id: &'a str) -> CursorFuture<'a, Vec<Checkpoint>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .logs
                .get(pipeline_id)
                .map(CheckpointLog::history)
                .unwrap_or_default())
        })
    }
}

async fn write_record(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

async fn load_logs(path: &Path) -> Result<HashMap<String, CheckpointLog>, CursorError> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err.into()),
    };

    let complete = contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |pos| pos + 1);
    if complete < contents.len() {
        tracing::warn!(
            path = %path.display(),
            discarded_bytes = contents.len() - complete,
            "discarding torn trailing checkpoint record"
        );
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(complete as u64).await?;
        file.sync_data().await?;
    }

    let mut logs: HashMap<String, CheckpointLog> = HashMap::new();
    for (idx, line) in contents[..complete].split(|byte| *byte == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let checkpoint: Checkpoint =
            serde_json::from_slice(line).map_err(|source| CursorError::Corrupt {
                line: idx + 1,
                source,
            })?;
        logs.entry(checkpoint.pipeline_id.clone())
            .or_default()
            .push(checkpoint);
    }
    Ok(logs)
}
