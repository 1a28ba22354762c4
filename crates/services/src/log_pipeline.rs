use std::{path::PathBuf, sync::Arc};

use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use utils::{LogMsg, MsgStore};

use crate::error::LogPipelineError;

/// Durable capture + live fan-out of one execution's output (SPEC_FULL.md
/// §4.3). The durable writer and the `MsgStore` hub are two consumers of the
/// same `ingest_*` call, not two independent read loops: storage append and
/// subscriber broadcast happen from the same chunk, in the same order,
/// before the next chunk is read off the container's pipe. Back-pressure
/// from a slow disk therefore propagates all the way back to the container's
/// output pipe — intentional, so the log is never silently truncated.
pub struct LogPipeline {
    store: Arc<MsgStore>,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl LogPipeline {
    pub async fn create(path: PathBuf) -> Result<Self, LogPipelineError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| LogPipelineError::Open {
                path: path.display().to_string(),
                source,
            })?;
        }
        let file = File::create(&path).await.map_err(|source| LogPipelineError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            store: Arc::new(MsgStore::new()),
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn store(&self) -> Arc<MsgStore> {
        self.store.clone()
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn ingest_stdout(&self, chunk: String) {
        self.ingest(LogMsg::Stdout(chunk)).await;
    }

    pub async fn ingest_stderr(&self, chunk: String) {
        self.ingest(LogMsg::Stderr(chunk)).await;
    }

    async fn ingest(&self, msg: LogMsg) {
        if let Some(text) = msg.as_log_bytes() {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(text.as_bytes()).await {
                tracing::error!(error = %e, path = %self.path.display(), "failed to append to execution log");
            }
        }
        self.store.push(msg);
    }

    /// Emits a terminal marker to all subscribers and flushes+closes the
    /// storage writer, which is then immutable.
    pub async fn close(&self) -> Result<(), LogPipelineError> {
        self.store.push_finished();
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(LogPipelineError::Write)
    }

    /// Reads the full durable log back from disk, for `ResultParser::parse`.
    pub async fn read_full_text(&self) -> Result<String, LogPipelineError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| LogPipelineError::Open { path: self.path.display().to_string(), source })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn ingest_appends_to_file_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = LogPipeline::create(dir.path().join("exec-1.log")).await.unwrap();

        let store = pipeline.store();
        let mut stream = store.history_plus_stream();

        pipeline.ingest_stdout("hello\n".to_string()).await;
        pipeline.close().await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, LogMsg::Stdout(s) if s == "hello\n"));
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_finished());

        let text = pipeline.read_full_text().await.unwrap();
        assert_eq!(text, "hello\n");
    }
}
