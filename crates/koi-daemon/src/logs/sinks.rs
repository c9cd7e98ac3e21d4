use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::logs::{LogLevel, LogRecord, LogSink};

/// Re-emits every record as a tracing event.
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait::async_trait]
impl LogSink for TracingSink {
    async fn accept(&self, record: &LogRecord) {
        let label = self.label.as_str();
        let channel = record.channel;
        let text = record.text.as_str();
        match record.level {
            LogLevel::Debug => debug!(event = "daemon.instance.output", label, channel, text),
            LogLevel::Info => info!(event = "daemon.instance.output", label, channel, text),
            LogLevel::Warn => warn!(event = "daemon.instance.output", label, channel, text),
            LogLevel::Error => error!(event = "daemon.instance.output", label, channel, text),
        }
    }
}

/// Forwards records into a bounded channel, waiting for capacity.
pub struct ChannelSink {
    tx: mpsc::Sender<LogRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<LogRecord>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl LogSink for ChannelSink {
    async fn accept(&self, record: &LogRecord) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(record.clone()).await;
    }
}

/// Appends timestamped records to a log file.
///
/// The file is opened lazily on the first record so that an instance that
/// never prints does not leave an empty file behind.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }
}

#[async_trait::async_trait]
impl LogSink for FileSink {
    async fn accept(&self, record: &LogRecord) {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            match self.open().await {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!(
                        event = "daemon.logs.file_open_failed",
                        path = %self.path.display(),
                        error = %e,
                    );
                    return;
                }
            }
        }
        let Some(file) = guard.as_mut() else {
            return;
        };

        let line = format!(
            "{} [{}] {}\n",
            chrono::Utc::now().to_rfc3339(),
            record.level,
            record.text
        );
        // tokio's File buffers in the background; flush so the line is on
        // disk before the record counts as accepted.
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(
                event = "daemon.logs.file_write_failed",
                path = %self.path.display(),
                error = %e,
            );
            // Reopen on the next record.
            *guard = None;
        }
    }
}
