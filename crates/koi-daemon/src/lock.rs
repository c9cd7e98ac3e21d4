use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::proc::is_supervisor_process;

/// Persisted proof that a supervisor is running: `{pid, host, port}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorLock {
    pub pid: u32,
    pub host: String,
    pub port: String,
}

impl SupervisorLock {
    /// Record for the current process listening on `host:port`.
    pub fn for_current_process(host: impl Into<String>, port: u16) -> Self {
        Self {
            pid: std::process::id(),
            host: host.into(),
            port: port.to_string(),
        }
    }

    /// Base URL of the control endpoint.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}/api", self.host, self.port)
    }
}

/// What [`SingletonLock::inspect`] found in the lock slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unclaimed,
    /// A live supervisor holds the lock.
    Claimed(SupervisorLock),
    /// A record exists but nothing live backs it. `None` when the record is
    /// unreadable.
    Stale(Option<SupervisorLock>),
}

/// File-based mutual exclusion between supervisor processes.
#[derive(Debug, Clone)]
pub struct SingletonLock {
    path: PathBuf,
}

impl SingletonLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record without touching it. Missing or unparseable records
    /// yield `None`.
    pub fn read(&self) -> Option<SupervisorLock> {
        let content = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(
                    event = "daemon.lock.read_failed",
                    path = %self.path.display(),
                    error = %e,
                );
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    event = "daemon.lock.parse_failed",
                    path = %self.path.display(),
                    error = %e,
                );
                None
            }
        }
    }

    /// Classify the lock slot.
    pub fn inspect(&self) -> LockState {
        if !self.path.exists() {
            return LockState::Unclaimed;
        }
        match self.read() {
            Some(record) if is_supervisor_process(record.pid) => LockState::Claimed(record),
            other => LockState::Stale(other),
        }
    }

    /// Make the slot claimable: fail if a live supervisor holds it, clear it
    /// if the holder is gone.
    pub fn prepare(&self) -> Result<(), DaemonError> {
        match self.inspect() {
            LockState::Unclaimed => Ok(()),
            LockState::Claimed(record) => {
                info!(
                    event = "daemon.lock.held_by_other",
                    pid = record.pid,
                    path = %self.path.display(),
                );
                Err(DaemonError::AlreadyRunning {
                    pid: Some(record.pid),
                })
            }
            LockState::Stale(record) => {
                warn!(
                    event = "daemon.lock.stale_detected",
                    pid = ?record.map(|r| r.pid),
                    path = %self.path.display(),
                );
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(source) => Err(DaemonError::LockIo {
                        path: self.path.clone(),
                        source,
                    }),
                }
            }
        }
    }

    /// Atomically create the record. Fails with `AlreadyRunning` if any
    /// record exists, however it got there.
    pub fn claim(&self, record: &SupervisorLock) -> Result<(), DaemonError> {
        let lock_io = |source: io::Error| DaemonError::LockIo {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(lock_io)?;
        }
        let body = serde_json::to_vec(record)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }

        let mut file = match options.open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let pid = self.read().map(|r| r.pid);
                warn!(
                    event = "daemon.lock.claim_failed",
                    path = %self.path.display(),
                    holder = ?pid,
                );
                return Err(DaemonError::AlreadyRunning { pid });
            }
            Err(e) => return Err(lock_io(e)),
        };

        if let Err(e) = file.write_all(&body).and_then(|()| file.sync_all()) {
            // Leave no half-written record behind.
            let _ = fs::remove_file(&self.path);
            return Err(lock_io(e));
        }

        info!(
            event = "daemon.lock.claim_completed",
            pid = record.pid,
            host = %record.host,
            port = %record.port,
            path = %self.path.display(),
        );
        Ok(())
    }

    /// Delete the record. Failure only leaves a stale record for the next
    /// boot, so it is logged and swallowed.
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(event = "daemon.lock.release_completed", path = %self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                event = "daemon.lock.release_failed",
                path = %self.path.display(),
                error = %e,
            ),
        }
    }
}
