use std::io;
use std::path::PathBuf;

/// All error types for the koi-daemon crate.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("{}", already_running_message(.pid))]
    AlreadyRunning { pid: Option<u32> },

    #[error("lock file {}: {source}", .path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("helper protocol error: {0}")]
    HelperProtocol(String),

    #[error("helper exited unsuccessfully (code {})", exit_code_label(.code))]
    HelperExited { code: Option<i32> },

    #[error("helper registry full ({capacity} slots in use)")]
    HelperCapacity { capacity: usize },

    #[error("failed to signal process {pid}: {message}")]
    ProcessSignal { pid: u32, message: String },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance already running: {0}")]
    InstanceAlreadyRunning(String),

    #[error("instance not running: {0}")]
    InstanceNotRunning(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("daemon not running")]
    NotRunning,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("daemon returned {code}: {message}")]
    Remote { code: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn already_running_message(pid: &Option<u32>) -> String {
    let who = match pid {
        Some(pid) => format!("PID={pid}"),
        None => "PID unknown".to_string(),
    };
    format!(
        "koi daemon already running, {who}. Cannot start another daemon while one holds the lock. \
         If that daemon crashed, use 'koi daemon start' to fix it. \
         To restart the daemon, use 'koi daemon restart'"
    )
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl DaemonError {
    /// Error code string for the IPC protocol.
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::Spawn { .. } => "spawn_failed",
            DaemonError::AlreadyRunning { .. } => "daemon_already_running",
            DaemonError::LockIo { .. } => "lock_io_error",
            DaemonError::HelperProtocol(_) => "helper_protocol_error",
            DaemonError::HelperExited { .. } => "helper_exited",
            DaemonError::HelperCapacity { .. } => "helper_capacity_exhausted",
            DaemonError::ProcessSignal { .. } => "process_signal_failed",
            DaemonError::InstanceNotFound(_) => "instance_not_found",
            DaemonError::InstanceAlreadyRunning(_) => "instance_already_running",
            DaemonError::InstanceNotRunning(_) => "instance_not_running",
            DaemonError::ConfigInvalid(_) => "config_invalid",
            DaemonError::ShuttingDown => "shutting_down",
            DaemonError::NotRunning => "daemon_not_running",
            DaemonError::ConnectionFailed(_) => "connection_failed",
            DaemonError::ProtocolError(_) => "protocol_error",
            DaemonError::Remote { .. } => "remote_error",
            DaemonError::Io(_) => "io_error",
            DaemonError::Serde(_) => "serialization_error",
        }
    }

    /// Whether this error is caused by user input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DaemonError::InstanceNotFound(_)
                | DaemonError::InstanceAlreadyRunning(_)
                | DaemonError::InstanceNotRunning(_)
                | DaemonError::AlreadyRunning { .. }
                | DaemonError::ConfigInvalid(_)
        )
    }
}
