use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::logs::router::{OutputHook, RawLine, relay};
use crate::logs::{ChannelId, LogLevel, LogRecord, LogRouter, LogSink};
use crate::proc::{env, signal};

/// How long pipes may stay open after the leader exits, before the rest of
/// its process group is killed (and again before the readers are dropped).
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// One supervised OS process.
///
/// Built with [`ProcessHandle::spawn`], configured with sinks and an optional
/// output hook, then started with [`run`](Self::run) or
/// [`start`](Self::start). The handle owns at most one live process; once it
/// exits the handle may be started again.
pub struct ProcessHandle {
    channel: ChannelId,
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    sinks: Vec<Arc<dyn LogSink>>,
    output_hook: Option<OutputHook>,
    pid: Mutex<Option<u32>>,
    /// Process group of the current run. Outlives `pid`: it stays set until
    /// supervision ends, so signals still reach descendants of a dead leader.
    group: Mutex<Option<u32>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("channel", &self.channel)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("sinks", &self.sinks.len())
            .field("pid", &self.pid())
            .field("group", &self.group())
            .finish()
    }
}

impl ProcessHandle {
    /// Validate and resolve everything needed to launch, without launching.
    ///
    /// `program` is used as-is when it contains a path separator, otherwise it
    /// is looked up on the `PATH` the process will see. `env` entries are
    /// applied over the inherited environment.
    pub fn spawn(
        channel: ChannelId,
        program: impl AsRef<Path>,
        args: Vec<String>,
        cwd: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Result<Self, DaemonError> {
        let program = program.as_ref();
        let cwd = cwd.into();

        if !cwd.is_dir() {
            warn!(
                event = "daemon.proc.spawn_failed",
                program = %program.display(),
                cwd = %cwd.display(),
                reason = "cwd",
            );
            return Err(DaemonError::Spawn {
                program: program.display().to_string(),
                message: format!("working directory not found: {}", cwd.display()),
            });
        }

        let program = resolve_program(program, &cwd, &env)?;
        debug!(
            event = "daemon.proc.spawn_completed",
            channel = channel,
            program = %program.display(),
        );

        Ok(Self {
            channel,
            program,
            args,
            cwd,
            env,
            sinks: Vec::new(),
            output_hook: None,
            pid: Mutex::new(None),
            group: Mutex::new(None),
        })
    }

    /// Append a sink. Sinks cannot be removed.
    pub fn register(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    /// Install a callback that sees every stdout line before the sinks do.
    pub fn set_output_hook(&mut self, hook: OutputHook) {
        self.output_hook = Some(hook);
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// PID of the live process, `None` before start and after exit.
    pub fn pid(&self) -> Option<u32> {
        read_slot(&self.pid)
    }

    /// Process group signalled by [`stop`](Self::stop) and
    /// [`kill`](Self::kill). Set from launch until supervision returns.
    pub fn group(&self) -> Option<u32> {
        read_slot(&self.group)
    }

    /// True from launch until the process exited and its output drained.
    pub fn is_running(&self) -> bool {
        self.group().is_some()
    }

    /// Launch the process and wait for it to exit.
    ///
    /// Returns once the process has exited, both pipes reached end of stream
    /// and every sink accepted every line. A non-zero exit status is returned
    /// as `Ok`; only failures of the supervisor itself are errors.
    pub async fn run(&self) -> Result<ExitStatus, DaemonError> {
        let child = self.launch()?;
        self.supervise(child).await
    }

    /// Launch the process and supervise it in the background.
    ///
    /// Returns after the OS process exists, so `pid()` is valid on return.
    pub fn start(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<Result<ExitStatus, DaemonError>>, DaemonError> {
        let child = self.launch()?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.supervise(child).await }))
    }

    /// Request graceful termination of the process group. Does not wait.
    pub fn stop(&self) -> Result<(), DaemonError> {
        match self.group() {
            Some(pid) => signal::interrupt(pid),
            None => Ok(()),
        }
    }

    /// Unconditionally terminate the process tree. Does not wait.
    pub fn kill(&self) -> Result<(), DaemonError> {
        match self.group() {
            Some(pid) => signal::terminate(pid),
            None => Ok(()),
        }
    }

    fn launch(&self) -> Result<Child, DaemonError> {
        let mut group = match self.group.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(pgid) = *group {
            return Err(DaemonError::Spawn {
                program: self.program.display().to_string(),
                message: format!("already running as process group {pgid}"),
            });
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            warn!(
                event = "daemon.proc.launch_failed",
                program = %self.program.display(),
                error = %e,
            );
            DaemonError::Spawn {
                program: self.program.display().to_string(),
                message: e.to_string(),
            }
        })?;

        *group = child.id();
        write_slot(&self.pid, child.id());
        info!(
            event = "daemon.proc.launch_completed",
            channel = self.channel,
            program = %self.program.display(),
            pid = ?child.id(),
        );
        Ok(child)
    }

    async fn supervise(&self, mut child: Child) -> Result<ExitStatus, DaemonError> {
        let (tx, rx) = mpsc::channel::<RawLine>(1);
        let relay_task = tokio::spawn(relay(
            rx,
            LogRouter::spawn(&self.sinks),
            self.output_hook.clone(),
        ));

        let mut readers = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            readers.spawn(pump(
                stdout,
                tx.clone(),
                self.channel,
                LogLevel::Info,
                true,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.spawn(pump(
                stderr,
                tx.clone(),
                self.channel,
                LogLevel::Warn,
                false,
            ));
        }
        // Readers hold the only senders; the relay ends when both finish.
        drop(tx);

        let status = child.wait().await;
        write_slot(&self.pid, None);

        // Descendants that inherited the pipes keep them open after the
        // leader is gone. Give them a moment, then kill the group, then give
        // up on the pipes.
        if !drain_within(&mut readers, DRAIN_GRACE).await {
            warn!(
                event = "daemon.proc.orphans_kill_started",
                channel = self.channel,
                group = ?self.group(),
            );
            if let Err(e) = self.kill() {
                warn!(event = "daemon.proc.orphans_kill_failed", error = %e);
            }
            if !drain_within(&mut readers, DRAIN_GRACE).await {
                warn!(event = "daemon.proc.drain_abandoned", channel = self.channel);
                readers.abort_all();
                while readers.join_next().await.is_some() {}
            }
        }
        if let Err(e) = relay_task.await {
            debug!(event = "daemon.proc.relay_failed", error = %e);
        }
        write_slot(&self.group, None);

        let status = status?;
        info!(
            event = "daemon.proc.exit_completed",
            channel = self.channel,
            program = %self.program.display(),
            code = ?status.code(),
        );
        Ok(status)
    }
}

/// Wait for every reader to finish, up to `within`. Returns whether they did.
async fn drain_within(readers: &mut JoinSet<()>, within: Duration) -> bool {
    tokio::time::timeout(within, async {
        while let Some(joined) = readers.join_next().await {
            if let Err(e) = joined {
                debug!(event = "daemon.proc.reader_failed", error = %e);
            }
        }
    })
    .await
    .is_ok()
}

fn read_slot(slot: &Mutex<Option<u32>>) -> Option<u32> {
    match slot.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn write_slot(slot: &Mutex<Option<u32>>, value: Option<u32>) {
    match slot.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

/// Read one pipe line by line into the relay until end of stream.
async fn pump<R>(
    stream: R,
    tx: mpsc::Sender<RawLine>,
    channel: ChannelId,
    level: LogLevel,
    from_stdout: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                let line = RawLine {
                    record: LogRecord::new(channel, level, text),
                    from_stdout,
                };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(event = "daemon.proc.read_failed", channel = channel, error = %e);
                break;
            }
        }
    }
}

fn resolve_program(
    program: &Path,
    cwd: &Path,
    overrides: &[(String, String)],
) -> Result<PathBuf, DaemonError> {
    let spawn_error = |message: String| DaemonError::Spawn {
        program: program.display().to_string(),
        message,
    };

    if program.components().count() > 1 {
        let candidate = if program.is_absolute() {
            program.to_path_buf()
        } else {
            cwd.join(program)
        };
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(spawn_error(format!(
            "executable not found: {}",
            candidate.display()
        )));
    }

    let search_path = env::lookup(overrides, "PATH")
        .map(std::ffi::OsString::from)
        .or_else(|| std::env::var_os("PATH"));
    which::which_in(program, search_path, cwd)
        .map_err(|e| spawn_error(format!("not found on PATH: {e}")))
}
