use super::{Sink, SinkBatch, SinkError};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Appends each batch as a single JSON line. One `write_all` per batch keeps
/// a batch contiguous for readers tailing the file.
pub struct JsonLinesSink {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub async fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            name: name.into(),
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write<'a>(&'a self, batch: &'a SinkBatch) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(batch)?;
            line.push(b'\n');

            let mut file = self.file.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await?;
            Ok(())
        })
    }
}
