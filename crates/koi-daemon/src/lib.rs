pub mod client;
pub mod context;
pub mod errors;
pub mod instance;
pub mod lock;
pub mod logging;
pub mod logs;
pub mod proc;
pub mod protocol;
pub mod server;
pub mod shell;
pub mod types;

// Primary re-exports
pub use client::DaemonClient;
pub use context::DaemonContext;
pub use errors::DaemonError;
pub use instance::InstanceManager;
pub use lock::{SingletonLock, SupervisorLock};
pub use logging::init_logging;
pub use proc::ProcessHandle;
pub use protocol::{DaemonRequest, DaemonResponse};
pub use server::{run_server, run_server_with};
pub use shell::KoiShell;
pub use types::{
    DaemonConfig, DaemonStatus, InstanceConfig, InstanceInfo, InstanceStatus, load_daemon_config,
};
