use std::ffi::OsStr;
use std::path::Path;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

/// Check whether a process with the given PID exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(unistd::Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // Exists, owned by someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// Check whether `pid` is a live supervisor, i.e. runs the same executable as
/// the current process.
///
/// Guards against PID reuse: a lock record left by a crashed supervisor may
/// name a PID the OS has since handed to an unrelated program.
pub fn is_supervisor_process(pid: u32) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    let Ok(current_exe) = std::env::current_exe() else {
        // Cannot tell; trust liveness.
        return true;
    };

    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    let Some(process) = system.process(sys_pid) else {
        return false;
    };
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return false;
    }

    let same = match process.exe() {
        Some(exe) => same_executable(exe, &current_exe),
        None => same_name(process.name(), &current_exe),
    };
    debug!(
        event = "daemon.proc.identity_checked",
        pid = pid,
        name = %process.name().to_string_lossy(),
        supervisor = same,
    );
    same
}

fn same_executable(exe: &Path, current: &Path) -> bool {
    if exe == current {
        return true;
    }
    match (exe.canonicalize(), current.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => same_name(exe.file_name().unwrap_or_default(), current),
    }
}

/// Compare process names, tolerating the 15-byte truncation Linux applies to
/// `comm`.
fn same_name(name: &OsStr, current: &Path) -> bool {
    let Some(current_name) = current.file_name() else {
        return false;
    };
    let name = name.to_string_lossy();
    let current_name = current_name.to_string_lossy();
    if name == current_name {
        return true;
    }
    name.len() >= 15 && current_name.starts_with(name.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_unlikely_pid_is_dead() {
        assert!(!is_process_alive(4_194_301));
    }

    #[test]
    fn test_current_process_is_supervisor() {
        assert!(is_supervisor_process(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_other_program_is_not_supervisor() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let pid = child.id();
        let result = is_supervisor_process(pid);
        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!result);
    }

    #[test]
    fn test_same_name_truncation() {
        let current = Path::new("/usr/bin/koi-daemon-integration");
        assert!(same_name(OsStr::new("koi-daemon-inte"), current));
        assert!(!same_name(OsStr::new("koi"), current));
        assert!(same_name(OsStr::new("koi-daemon-integration"), current));
    }
}
