//! Platform signal delivery.
//!
//! Managed processes are started as the leader of their own process group, so
//! on unix both operations address the whole group and reach any descendants
//! the child has forked.

use tracing::debug;

use crate::errors::DaemonError;

/// Ask the process tree rooted at `pid` to exit.
///
/// SIGINT to the process group on unix, `taskkill /T` without `/F` on
/// Windows. A process that is already gone is not an error.
pub fn interrupt(pid: u32) -> Result<(), DaemonError> {
    debug!(event = "daemon.proc.signal_started", pid = pid, kind = "interrupt");
    #[cfg(unix)]
    {
        send_group(pid, nix::sys::signal::Signal::SIGINT)
    }
    #[cfg(not(unix))]
    {
        taskkill(pid, false)
    }
}

/// Unconditionally terminate the process tree rooted at `pid`.
pub fn terminate(pid: u32) -> Result<(), DaemonError> {
    debug!(event = "daemon.proc.signal_started", pid = pid, kind = "kill");
    #[cfg(unix)]
    {
        send_group(pid, nix::sys::signal::Signal::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        taskkill(pid, true)
    }
}

#[cfg(unix)]
fn send_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), DaemonError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| DaemonError::ProcessSignal {
        pid,
        message: "pid out of range".to_string(),
    })?;

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(()),
        // No such group: the leader may have been started outside a group.
        Err(Errno::ESRCH) => match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DaemonError::ProcessSignal {
                pid,
                message: e.to_string(),
            }),
        },
        Err(e) => Err(DaemonError::ProcessSignal {
            pid,
            message: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn taskkill(pid: u32, force: bool) -> Result<(), DaemonError> {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    let output = std::process::Command::new("taskkill")
        .args(&args)
        .output()
        .map_err(|e| DaemonError::ProcessSignal {
            pid,
            message: e.to_string(),
        })?;
    if output.status.success() {
        return Ok(());
    }
    // 128: no such process.
    if output.status.code() == Some(128) {
        return Ok(());
    }
    Err(DaemonError::ProcessSignal {
        pid,
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
