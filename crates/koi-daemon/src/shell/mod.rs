//! Request/response calls into the UI helper executable.
//!
//! The helper receives one positional argument, `base64(json(request))`, and
//! answers (if at all) with `base64(json(response))` as its last non-empty
//! stdout line. Earlier stdout lines are treated as diagnostics.

pub mod codec;
pub mod registry;
pub mod requests;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::errors::DaemonError;
use crate::logs::{HELPER_CHANNEL, TracingSink};
use crate::proc::ProcessHandle;

pub use registry::{HELPER_SLOT_CAPACITY, SlotRegistry};
pub use requests::{DialogRequest, DialogStyle, HelperRequest, WebviewRequest};

/// Decoded helper answer.
pub type HelperResponse = Map<String, Value>;

const KILL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Client for the UI helper.
///
/// Every call, synchronous or fire-and-forget, occupies one registry slot for
/// as long as its helper process lives, so [`KoiShell::shutdown`] can reach
/// all of them.
pub struct KoiShell {
    program: PathBuf,
    leading_args: Vec<String>,
    cwd: PathBuf,
    registry: SlotRegistry<Arc<ProcessHandle>>,
    tracker: TaskTracker,
    shutting_down: AtomicBool,
}

impl KoiShell {
    /// Helper at `program`, run with `cwd` as its working directory.
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            cwd: cwd.into(),
            registry: SlotRegistry::new(HELPER_SLOT_CAPACITY),
            tracker: TaskTracker::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Arguments placed before the encoded request.
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.registry = SlotRegistry::new(capacity);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether the helper executable is present.
    pub fn is_available(&self) -> bool {
        self.program.is_file()
    }

    /// Helper processes currently in flight.
    pub fn in_flight(&self) -> usize {
        self.registry.in_use()
    }

    /// Run the helper to completion and decode its answer.
    ///
    /// `Ok(None)` when the helper printed nothing. A non-zero exit is
    /// `HelperExited`; an undecodable last line is `HelperProtocol`.
    pub async fn exec<T: Serialize>(
        &self,
        request: &T,
    ) -> Result<Option<HelperResponse>, DaemonError> {
        let _token = self.tracker.token();
        let last_line = Arc::new(Mutex::new(None::<String>));

        let mut handle = self.prepare(request)?;
        let capture = Arc::clone(&last_line);
        handle.set_output_hook(Arc::new(move |line: &str| {
            if line.trim().is_empty() {
                return;
            }
            if let Ok(mut slot) = capture.lock() {
                *slot = Some(line.to_string());
            }
        }));
        let handle = Arc::new(handle);
        let slot = self.registry.claim(Arc::clone(&handle))?;

        debug!(event = "daemon.shell.exec_started", slot = slot.index());
        let status = handle.run().await?;
        if !status.success() {
            warn!(event = "daemon.shell.exec_failed", code = ?status.code());
            return Err(DaemonError::HelperExited {
                code: status.code(),
            });
        }

        let line = match last_line.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(line) = line else {
            debug!(event = "daemon.shell.exec_completed", response = false);
            return Ok(None);
        };
        let response = codec::decode_payload::<HelperResponse>(&line)?;
        debug!(event = "daemon.shell.exec_completed", response = true);
        Ok(Some(response))
    }

    /// Launch the helper and return as soon as it is running.
    ///
    /// The helper keeps its registry slot until it exits; its output is still
    /// drained and logged.
    pub fn start<T: Serialize>(&self, request: &T) -> Result<u32, DaemonError> {
        let handle = Arc::new(self.prepare(request)?);
        let slot = self.registry.claim(Arc::clone(&handle))?;
        let task = handle.start()?;
        let pid = handle.pid().unwrap_or_default();

        self.tracker.spawn(async move {
            let _slot = slot;
            match task.await {
                Ok(Ok(status)) => {
                    debug!(event = "daemon.shell.start_exited", code = ?status.code())
                }
                Ok(Err(e)) => warn!(event = "daemon.shell.start_failed", error = %e),
                Err(e) => warn!(event = "daemon.shell.start_failed", error = %e),
            }
        });
        info!(event = "daemon.shell.start_completed", pid = pid);
        Ok(pid)
    }

    /// Open a window on `url`. Fire-and-forget.
    pub fn webview(&self, name: &str, url: &str) -> Result<u32, DaemonError> {
        self.start(&HelperRequest::webview(name, url))
    }

    /// Show the about dialog and wait until it is dismissed.
    pub async fn about(&self, version: &str) -> Result<(), DaemonError> {
        self.exec(&HelperRequest::about(version))
            .await
            .map(|_| ())
            .inspect_err(|e| error!(event = "daemon.shell.about_failed", error = %e))
    }

    /// Tell the user another supervisor holds the lock.
    pub async fn already_running(&self) -> Result<(), DaemonError> {
        self.exec(&HelperRequest::already_running())
            .await
            .map(|_| ())
            .inspect_err(|e| error!(event = "daemon.shell.already_running_failed", error = %e))
    }

    /// Stop every helper in flight and wait for all of them to exit.
    ///
    /// Helpers get `grace` to honor the interrupt before they are killed.
    /// Calls made after this starts fail with `ShuttingDown`.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let in_flight = self.registry.close();
        self.tracker.close();
        info!(
            event = "daemon.shell.shutdown_started",
            in_flight = in_flight.len()
        );

        for handle in &in_flight {
            if let Err(e) = handle.stop() {
                warn!(event = "daemon.shell.stop_failed", error = %e);
            }
        }

        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            // A claimed helper may launch after the first pass; keep killing
            // whatever the registry still holds until everything is gone.
            loop {
                for handle in self.registry.snapshot() {
                    if let Err(e) = handle.kill() {
                        warn!(event = "daemon.shell.kill_failed", error = %e);
                    }
                }
                if tokio::time::timeout(KILL_RETRY_INTERVAL, self.tracker.wait())
                    .await
                    .is_ok()
                {
                    break;
                }
            }
        }
        info!(event = "daemon.shell.shutdown_completed");
    }

    fn prepare<T: Serialize>(&self, request: &T) -> Result<ProcessHandle, DaemonError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DaemonError::ShuttingDown);
        }
        let payload = codec::encode_request(request)?;
        let mut args = self.leading_args.clone();
        args.push(payload);

        let mut handle =
            ProcessHandle::spawn(HELPER_CHANNEL, &self.program, args, &self.cwd, Vec::new())?;
        handle.register(Arc::new(TracingSink::new("koishell")));
        Ok(handle)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    /// Helper stand-in: `sh -c <script> helper <payload>`.
    fn shell_with(script: &str) -> KoiShell {
        KoiShell::new("/bin/sh", std::env::temp_dir()).with_leading_args(vec![
            "-c".to_string(),
            script.to_string(),
            "koishell".to_string(),
        ])
    }

    #[tokio::test]
    async fn test_exec_echoes_request() {
        let shell = shell_with(r#"echo "$1""#);
        let request = json!({"mode": "dialog", "title": "Echo"});
        let response = shell.exec(&request).await.unwrap().unwrap();
        assert_eq!(Value::Object(response), request);
        assert_eq!(shell.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_exec_uses_last_non_empty_line() {
        let shell = shell_with(r#"echo loading; echo "$1"; echo; echo "   ""#);
        let response = shell
            .exec(&json!({"answer": 42}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["answer"], 42);
    }

    #[tokio::test]
    async fn test_exec_without_output_is_none() {
        let shell = shell_with("exit 0");
        let response = shell.exec(&HelperRequest::about("1.0.0")).await.unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_exec_malformed_output() {
        let shell = shell_with("echo '%%% not base64 %%%'");
        let err = shell.exec(&json!({})).await.unwrap_err();
        assert_eq!(err.error_code(), "helper_protocol_error");
        assert_eq!(shell.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit() {
        let shell = shell_with("exit 3");
        let err = shell.exec(&json!({})).await.unwrap_err();
        assert!(matches!(err, DaemonError::HelperExited { code: Some(3) }));
        assert_eq!(shell.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_missing_helper_is_spawn_error() {
        let shell = KoiShell::new("/nonexistent/koishell", std::env::temp_dir());
        assert!(!shell.is_available());
        let err = shell.exec(&json!({})).await.unwrap_err();
        assert_eq!(err.error_code(), "spawn_failed");
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let shell = Arc::new(shell_with(r#"sleep 0.2; echo "$1""#));
        let calls: Vec<_> = (0..8)
            .map(|i| {
                let shell = Arc::clone(&shell);
                tokio::spawn(async move { shell.exec(&json!({"n": i})).await })
            })
            .collect();
        for (i, call) in calls.into_iter().enumerate() {
            let response = call.await.unwrap().unwrap().unwrap();
            assert_eq!(response["n"], i);
        }
        assert_eq!(shell.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_fails_fast() {
        let shell = Arc::new(shell_with("sleep 30").with_capacity(2));
        shell.start(&json!({})).unwrap();
        shell.start(&json!({})).unwrap();
        assert_eq!(shell.in_flight(), 2);

        let started = Instant::now();
        let err = shell.exec(&json!({})).await.unwrap_err();
        assert!(matches!(err, DaemonError::HelperCapacity { capacity: 2 }));
        assert!(started.elapsed() < Duration::from_secs(5));

        shell.shutdown(Duration::from_secs(2)).await;
        assert_eq!(shell.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_start_returns_while_helper_runs() {
        let shell = shell_with("sleep 30");
        let pid = shell.webview("main", "http://127.0.0.1:5140").unwrap();
        assert!(pid > 0);
        assert!(crate::proc::is_process_alive(pid));
        assert_eq!(shell.in_flight(), 1);

        shell.shutdown(Duration::from_secs(2)).await;
        assert_eq!(shell.in_flight(), 0);
        assert!(!crate::proc::is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let shell = Arc::new(shell_with("trap '' INT; sleep 30"));
        let runner = Arc::clone(&shell);
        let call = tokio::spawn(async move { runner.exec(&json!({})).await });

        // Wait until the helper is registered.
        while shell.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = Instant::now();
        shell.shutdown(Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(shell.in_flight(), 0);

        // Killed by signal: no exit code.
        let result = call.await.unwrap();
        assert!(matches!(result, Err(DaemonError::HelperExited { code: None })));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_helper_descendants() {
        // The leader honors SIGINT; its child ignores it and keeps the pipes.
        let shell = shell_with("(trap '' INT; sleep 30) & sleep 30");
        shell.start(&json!({"mode": "webview"})).unwrap();
        assert_eq!(shell.in_flight(), 1);

        let started = Instant::now();
        shell.shutdown(Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(shell.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_refused() {
        let shell = shell_with(r#"echo "$1""#);
        shell.shutdown(Duration::from_millis(100)).await;
        let err = shell.exec(&json!({})).await.unwrap_err();
        assert!(matches!(err, DaemonError::ShuttingDown));
        assert!(matches!(
            shell.start(&json!({})),
            Err(DaemonError::ShuttingDown)
        ));
    }
}
