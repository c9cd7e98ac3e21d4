//! Structured child-process output and its fan-out to sinks.
//!
//! Every line a managed process writes becomes a [`LogRecord`] tagged with the
//! producing channel and a severity. A [`LogRouter`] forwards each record to
//! every registered [`LogSink`].

pub mod router;
pub mod sinks;

use serde::{Deserialize, Serialize};

pub use router::LogRouter;
pub use sinks::{ChannelSink, FileSink, TracingSink};

/// Small integer tag identifying which instance a line came from.
pub type ChannelId = u16;

/// Channel reserved for helper processes.
pub const HELPER_CHANNEL: ChannelId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// One line of child output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub channel: ChannelId,
    pub level: LogLevel,
    pub text: String,
}

impl LogRecord {
    pub fn new(channel: ChannelId, level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            channel,
            level,
            text: text.into(),
        }
    }
}

/// A destination for log records.
///
/// Sinks are registered on a process before it starts and live as long as
/// that process. Delivery to one sink never blocks delivery to another, but
/// a sink that awaits for a long time delays its own later records.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn accept(&self, record: &LogRecord);
}
