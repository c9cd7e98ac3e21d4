use std::sync::Arc;

use tokio::sync::watch;

use crate::logs::ChannelId;
use crate::proc::ProcessHandle;
use crate::types::{InstanceConfig, InstanceInfo, InstanceStatus};

/// A configured instance plus the runtime state of its current process.
pub struct ManagedInstance {
    config: InstanceConfig,
    channel: ChannelId,
    status: InstanceStatus,
    /// Present while a process is live.
    handle: Option<Arc<ProcessHandle>>,
    /// Flips to `true` once the current process exited and its output drained.
    exited: Option<watch::Receiver<bool>>,
    started_at: Option<String>,
    exit_code: Option<i32>,
    stop_requested: bool,
    /// Bumped on every start so a late exit of an old run cannot clobber a
    /// newer one.
    generation: u64,
}

impl ManagedInstance {
    pub fn new(config: InstanceConfig, channel: ChannelId) -> Self {
        Self {
            config,
            channel,
            status: InstanceStatus::Stopped,
            handle: None,
            exited: None,
            started_at: None,
            exit_code: None,
            stop_requested: false,
            generation: 0,
        }
    }

    // --- Getters ---

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn handle(&self) -> Option<&Arc<ProcessHandle>> {
        self.handle.as_ref()
    }

    pub fn exited(&self) -> Option<watch::Receiver<bool>> {
        self.exited.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    // --- State transitions ---

    /// Record a freshly launched process. Returns the new generation.
    pub fn set_running(
        &mut self,
        handle: Arc<ProcessHandle>,
        exited: watch::Receiver<bool>,
    ) -> u64 {
        self.generation += 1;
        self.status = InstanceStatus::Running;
        self.handle = Some(handle);
        self.exited = Some(exited);
        self.started_at = Some(chrono::Utc::now().to_rfc3339());
        self.exit_code = None;
        self.stop_requested = false;
        self.generation
    }

    pub fn mark_stop_requested(&mut self) {
        self.stop_requested = true;
    }

    /// Record the end of the run started as `generation`. Stale generations
    /// are ignored.
    pub fn set_exited(&mut self, generation: u64, code: Option<i32>) -> bool {
        if generation != self.generation {
            return false;
        }
        self.status = if self.stop_requested {
            InstanceStatus::Stopped
        } else {
            InstanceStatus::Exited
        };
        self.handle = None;
        self.exit_code = code;
        true
    }

    pub fn to_info(&self) -> InstanceInfo {
        InstanceInfo {
            name: self.config.name.clone(),
            channel: self.channel,
            status: self.status,
            pid: self.handle.as_ref().and_then(|h| h.pid()),
            started_at: self.started_at.clone(),
            exit_code: self.exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InstanceConfig {
        InstanceConfig {
            name: "default".to_string(),
            command: "node".to_string(),
            args: Vec::new(),
            cwd: None,
            env: Default::default(),
            autostart: true,
        }
    }

    fn handle() -> Arc<ProcessHandle> {
        let program = std::env::current_exe().unwrap();
        let handle =
            ProcessHandle::spawn(3, program, Vec::new(), std::env::temp_dir(), Vec::new()).unwrap();
        Arc::new(handle)
    }

    #[test]
    fn test_new_instance_is_stopped() {
        let instance = ManagedInstance::new(config(), 3);
        let info = instance.to_info();
        assert_eq!(info.status, InstanceStatus::Stopped);
        assert_eq!(info.channel, 3);
        assert!(info.pid.is_none());
        assert!(info.started_at.is_none());
    }

    #[test]
    fn test_exit_without_stop_request_is_exited() {
        let mut instance = ManagedInstance::new(config(), 3);
        let (_tx, rx) = watch::channel(false);
        let generation = instance.set_running(handle(), rx);
        assert!(instance.is_running());
        assert!(instance.to_info().started_at.is_some());

        assert!(instance.set_exited(generation, Some(1)));
        assert_eq!(instance.status(), InstanceStatus::Exited);
        assert_eq!(instance.to_info().exit_code, Some(1));
        assert!(instance.handle().is_none());
    }

    #[test]
    fn test_exit_after_stop_request_is_stopped() {
        let mut instance = ManagedInstance::new(config(), 3);
        let (_tx, rx) = watch::channel(false);
        let generation = instance.set_running(handle(), rx);
        instance.mark_stop_requested();
        instance.set_exited(generation, None);
        assert_eq!(instance.status(), InstanceStatus::Stopped);
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut instance = ManagedInstance::new(config(), 3);
        let (_tx1, rx1) = watch::channel(false);
        let old = instance.set_running(handle(), rx1);
        let (_tx2, rx2) = watch::channel(false);
        let new = instance.set_running(handle(), rx2);
        assert_ne!(old, new);

        assert!(!instance.set_exited(old, Some(0)));
        assert!(instance.is_running());
    }
}
