use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::errors::DaemonError;
use crate::instance::state::ManagedInstance;
use crate::logs::{ChannelId, FileSink, TracingSink};
use crate::proc::{ProcessHandle, build_instance_env};
use crate::types::InstanceInfo;

type InstanceMap = BTreeMap<String, ManagedInstance>;

/// Owns every configured instance and its process.
///
/// The map is guarded by a mutex that is never held across an await, so
/// list/start/stop calls from concurrent requests serialize cleanly while
/// waiting for exits happens outside the lock.
pub struct InstanceManager {
    ctx: Arc<DaemonContext>,
    instances: Arc<Mutex<InstanceMap>>,
    watchers: TaskTracker,
    closing: AtomicBool,
}

impl InstanceManager {
    /// One stopped entry per configured instance, channels numbered from 1 in
    /// configuration order.
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        let instances = ctx
            .config
            .instances
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let channel = ChannelId::try_from(i + 1).unwrap_or(ChannelId::MAX);
                (
                    config.name.clone(),
                    ManagedInstance::new(config.clone(), channel),
                )
            })
            .collect();
        Self {
            ctx,
            instances: Arc::new(Mutex::new(instances)),
            watchers: TaskTracker::new(),
            closing: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstanceMap> {
        match self.instances.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn list(&self) -> Vec<InstanceInfo> {
        self.lock().values().map(ManagedInstance::to_info).collect()
    }

    pub fn get(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.lock()
            .get(name)
            .map(ManagedInstance::to_info)
            .ok_or_else(|| DaemonError::InstanceNotFound(name.to_string()))
    }

    pub fn instance_count(&self) -> usize {
        self.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().values().filter(|i| i.is_running()).count()
    }

    /// Launch the named instance.
    pub fn start(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        let mut map = self.lock();
        // Checked under the map lock: `stop_all` flips it under the same
        // lock, so a start either lands in its snapshot or is refused.
        if self.closing.load(Ordering::SeqCst) {
            return Err(DaemonError::ShuttingDown);
        }
        let instance = map
            .get_mut(name)
            .ok_or_else(|| DaemonError::InstanceNotFound(name.to_string()))?;
        if instance.is_running() {
            return Err(DaemonError::InstanceAlreadyRunning(name.to_string()));
        }

        info!(event = "daemon.instance.start_started", instance = name);
        let handle = Arc::new(self.build_handle(instance)?);
        let task = handle.start()?;

        let (exited_tx, exited_rx) = watch::channel(false);
        let generation = instance.set_running(Arc::clone(&handle), exited_rx);
        let info = instance.to_info();
        drop(map);

        let instances = Arc::clone(&self.instances);
        let instance_name = name.to_string();
        self.watchers.spawn(async move {
            let code = match task.await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    error!(
                        event = "daemon.instance.supervise_failed",
                        instance = %instance_name,
                        error = %e,
                    );
                    None
                }
                Err(e) => {
                    error!(
                        event = "daemon.instance.supervise_failed",
                        instance = %instance_name,
                        error = %e,
                    );
                    None
                }
            };
            let mut map = match instances.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(instance) = map.get_mut(&instance_name)
                && instance.set_exited(generation, code)
            {
                info!(
                    event = "daemon.instance.exit_completed",
                    instance = %instance_name,
                    status = %instance.status(),
                    code = ?code,
                );
            }
            drop(map);
            let _ = exited_tx.send(true);
        });

        info!(
            event = "daemon.instance.start_completed",
            instance = name,
            pid = ?info.pid,
            channel = info.channel,
        );
        Ok(info)
    }

    /// Ask the named instance to exit. Does not wait.
    pub fn stop(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        let handle = self.request_stop(name)?;
        info!(event = "daemon.instance.stop_started", instance = name);
        handle.stop()?;
        self.get(name)
    }

    /// Stop the named instance and wait for it to exit, killing it if it is
    /// still alive after `grace`.
    pub async fn stop_and_wait(
        &self,
        name: &str,
        grace: Duration,
    ) -> Result<InstanceInfo, DaemonError> {
        let exited = {
            let mut map = self.lock();
            let instance = map
                .get_mut(name)
                .ok_or_else(|| DaemonError::InstanceNotFound(name.to_string()))?;
            if !instance.is_running() {
                return Err(DaemonError::InstanceNotRunning(name.to_string()));
            }
            instance.mark_stop_requested();
            instance.handle().cloned().zip(instance.exited())
        };
        if let Some((handle, exited)) = exited {
            let deadline = Instant::now() + grace;
            terminate(name, &handle, exited, deadline, grace).await?;
        }
        self.get(name)
    }

    /// Stop then start again.
    pub async fn restart(
        &self,
        name: &str,
        grace: Duration,
    ) -> Result<InstanceInfo, DaemonError> {
        info!(event = "daemon.instance.restart_started", instance = name);
        match self.stop_and_wait(name, grace).await {
            Ok(_) | Err(DaemonError::InstanceNotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        let info = self.start(name)?;
        info!(event = "daemon.instance.restart_completed", instance = name);
        Ok(info)
    }

    /// Restart in the background. The task is tracked, so `stop_all` waits
    /// for it; a restart that reaches its start after shutdown began is
    /// refused with `ShuttingDown`.
    pub fn spawn_restart(self: &Arc<Self>, name: &str, grace: Duration) {
        let manager = Arc::clone(self);
        let name = name.to_string();
        self.watchers.spawn(async move {
            if let Err(e) = manager.restart(&name, grace).await {
                error!(event = "daemon.instance.restart_failed", instance = %name, error = %e);
            }
        });
    }

    /// Start every instance marked `autostart`. Failures are isolated per
    /// instance and returned for reporting.
    pub fn start_autostart(&self) -> Vec<(String, DaemonError)> {
        if !self.ctx.config.start_instances {
            debug!(event = "daemon.instance.autostart_skipped");
            return Vec::new();
        }
        let names: Vec<String> = self
            .lock()
            .values()
            .filter(|i| i.config().autostart)
            .map(|i| i.name().to_string())
            .collect();

        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.start(&name) {
                error!(event = "daemon.instance.autostart_failed", instance = %name, error = %e);
                failures.push((name, e));
            }
        }
        failures
    }

    /// Stop every running instance: interrupt all, wait up to `grace`, kill
    /// the rest, then wait for every exit. Refuses new starts from here on.
    ///
    /// Every instance is attempted; failures are collected, not
    /// short-circuited.
    pub async fn stop_all(&self, grace: Duration) -> Vec<(String, DaemonError)> {
        let running: Vec<_> = {
            let mut map = self.lock();
            self.closing.store(true, Ordering::SeqCst);
            map.values_mut()
                .filter(|i| i.is_running())
                .filter_map(|i| {
                    i.mark_stop_requested();
                    let name = i.name().to_string();
                    i.handle().cloned().zip(i.exited()).map(|(h, rx)| (name, h, rx))
                })
                .collect()
        };
        info!(event = "daemon.instance.stop_all_started", running = running.len());

        let deadline = Instant::now() + grace;
        let mut pending = Vec::with_capacity(running.len());
        for (name, handle, exited) in running {
            pending.push(async move {
                let result = terminate(&name, &handle, exited, deadline, grace).await;
                (name, result)
            });
        }

        let mut failures = Vec::new();
        let mut joins = tokio::task::JoinSet::new();
        for fut in pending {
            joins.spawn(fut);
        }
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => failures.push((name, e)),
                Err(e) => warn!(event = "daemon.instance.stop_task_failed", error = %e),
            }
        }

        self.watchers.close();
        if tokio::time::timeout(grace, self.watchers.wait()).await.is_err() {
            warn!(event = "daemon.instance.watchers_pending");
        }
        info!(
            event = "daemon.instance.stop_all_completed",
            failed = failures.len()
        );
        failures
    }

    fn request_stop(&self, name: &str) -> Result<Arc<ProcessHandle>, DaemonError> {
        let mut map = self.lock();
        let instance = map
            .get_mut(name)
            .ok_or_else(|| DaemonError::InstanceNotFound(name.to_string()))?;
        let Some(handle) = instance.handle().cloned().filter(|_| instance.is_running()) else {
            return Err(DaemonError::InstanceNotRunning(name.to_string()));
        };
        instance.mark_stop_requested();
        Ok(handle)
    }

    fn build_handle(&self, instance: &ManagedInstance) -> Result<ProcessHandle, DaemonError> {
        let config = instance.config();
        let paths = &self.ctx.paths;

        let cwd = match &config.cwd {
            Some(cwd) => cwd.clone(),
            None => {
                let dir = paths.instance_dir(&config.name);
                std::fs::create_dir_all(&dir)?;
                dir
            }
        };
        let env = build_instance_env(&paths.bin_dir(), &self.ctx.config.env, &config.env);

        let mut handle = ProcessHandle::spawn(
            instance.channel(),
            &config.command,
            config.args.clone(),
            cwd,
            env,
        )?;
        handle.register(Arc::new(TracingSink::new(config.name.clone())));
        handle.register(Arc::new(FileSink::new(
            paths.instance_log_file(&config.name),
        )));
        Ok(handle)
    }
}

/// Interrupt, wait until `deadline`, kill if still alive, then wait once more.
async fn terminate(
    name: &str,
    handle: &ProcessHandle,
    mut exited: watch::Receiver<bool>,
    deadline: Instant,
    grace: Duration,
) -> Result<(), DaemonError> {
    let mut outcome = Ok(());
    if let Err(e) = handle.stop() {
        warn!(event = "daemon.instance.stop_failed", instance = name, error = %e);
        outcome = Err(e);
    }

    if tokio::time::timeout_at(deadline, exited.wait_for(|done| *done))
        .await
        .is_ok()
    {
        return outcome;
    }

    warn!(event = "daemon.instance.kill_started", instance = name);
    if let Err(e) = handle.kill() {
        error!(event = "daemon.instance.kill_failed", instance = name, error = %e);
        return Err(e);
    }
    if tokio::time::timeout(grace, exited.wait_for(|done| *done))
        .await
        .is_err()
    {
        // The process is gone; something it spawned still holds the pipes.
        warn!(
            event = "daemon.instance.drain_pending",
            instance = name,
            pid_live = handle.pid().is_some(),
        );
    }
    outcome
}
