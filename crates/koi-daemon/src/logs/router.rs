use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::logs::{LogRecord, LogSink};

/// Callback invoked with every stdout line before it is fanned out.
pub type OutputHook = Arc<dyn Fn(&str) + Send + Sync>;

struct SinkWorker {
    tx: mpsc::UnboundedSender<Arc<LogRecord>>,
    task: JoinHandle<()>,
}

/// Fan-out of log records to a fixed set of sinks.
///
/// Each sink gets its own worker task fed by an unbounded FIFO, so a slow
/// sink only delays itself and every sink sees records in production order.
/// [`LogRouter::close`] is the join point: it returns once every sink has
/// accepted every record dispatched before the call.
pub struct LogRouter {
    workers: Vec<SinkWorker>,
}

impl LogRouter {
    /// Start one worker per sink. Must be called inside a tokio runtime.
    pub fn spawn(sinks: &[Arc<dyn LogSink>]) -> Self {
        let workers = sinks
            .iter()
            .map(|sink| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Arc<LogRecord>>();
                let sink = Arc::clone(sink);
                let task = tokio::spawn(async move {
                    while let Some(record) = rx.recv().await {
                        sink.accept(&record).await;
                    }
                });
                SinkWorker { tx, task }
            })
            .collect();
        Self { workers }
    }

    pub fn sink_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a record for every sink. Never waits on a sink.
    pub fn dispatch(&self, record: LogRecord) {
        let record = Arc::new(record);
        for worker in &self.workers {
            // A worker only goes away if its sink panicked; drop the line for it.
            let _ = worker.tx.send(Arc::clone(&record));
        }
    }

    /// Close every sink queue and wait for the workers to drain.
    pub async fn close(self) {
        let mut tasks = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            drop(worker.tx);
            tasks.push(worker.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                debug!(event = "daemon.logs.sink_worker_failed", error = %e);
            }
        }
    }
}

/// A line read from one of the child's pipes.
pub(crate) struct RawLine {
    pub record: LogRecord,
    pub from_stdout: bool,
}

/// Relay lines from the process readers into the router.
///
/// Runs until every reader has dropped its sender (both pipes reached EOF),
/// then closes the router. The relay is the single owner of the receiving
/// end; readers own the sending ends and drop them when their stream ends.
pub(crate) async fn relay(
    mut rx: mpsc::Receiver<RawLine>,
    router: LogRouter,
    hook: Option<OutputHook>,
) {
    while let Some(line) = rx.recv().await {
        if line.from_stdout
            && let Some(hook) = &hook
        {
            hook(&line.record.text);
        }
        router.dispatch(line.record);
    }
    router.close().await;
}
