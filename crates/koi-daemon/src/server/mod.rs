pub mod api;
pub mod shutdown;

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::DaemonContext;
use crate::errors::DaemonError;
use crate::instance::InstanceManager;
use crate::lock::{SingletonLock, SupervisorLock};
use crate::shell::KoiShell;

pub use api::{API_PATH, ApiState, router};

/// Loopback host the control endpoint binds to.
pub const LISTEN_HOST: &str = "127.0.0.1";

/// Run the supervisor until a signal or a `shutdown` request arrives.
pub async fn run_server(ctx: DaemonContext) -> Result<(), DaemonError> {
    run_server_with(ctx, CancellationToken::new()).await
}

/// Like [`run_server`], but also stops when `token` is cancelled.
///
/// Boot order: lock check, state directories, bind, lock claim, autostart.
/// Teardown stops instances, then helpers, then releases the lock.
pub async fn run_server_with(
    ctx: DaemonContext,
    token: CancellationToken,
) -> Result<(), DaemonError> {
    let ctx = Arc::new(ctx);
    let lock = SingletonLock::new(ctx.paths.daemon_lock_file());

    lock.prepare()?;
    ctx.ensure_dirs()?;

    let listener = TcpListener::bind((LISTEN_HOST, 0)).await?;
    let port = listener.local_addr()?.port();
    let record = SupervisorLock::for_current_process(LISTEN_HOST, port);
    lock.claim(&record)?;

    info!(
        event = "daemon.server.started",
        pid = record.pid,
        url = %record.api_url(),
        lock = %lock.path().display(),
    );

    let result = serve(Arc::clone(&ctx), listener, record, token).await;

    lock.release();
    info!(event = "daemon.server.stopped");
    result
}

async fn serve(
    ctx: Arc<DaemonContext>,
    listener: TcpListener,
    record: SupervisorLock,
    token: CancellationToken,
) -> Result<(), DaemonError> {
    let manager = Arc::new(InstanceManager::new(Arc::clone(&ctx)));
    let shell = Arc::new(KoiShell::new(ctx.helper_path(), ctx.paths.config_dir()));
    let grace = ctx.config.stop_timeout();

    let signal_token = token.clone();
    let signals = tokio::spawn(async move {
        if let Err(e) = shutdown::wait_for_shutdown_signal(signal_token).await {
            error!(event = "daemon.server.signal_handler_failed", error = %e);
        }
    });

    for (name, e) in manager.start_autostart() {
        error!(event = "daemon.server.autostart_failed", instance = %name, error = %e);
    }

    let state = Arc::new(ApiState {
        ctx,
        manager: Arc::clone(&manager),
        shell: Arc::clone(&shell),
        record,
        shutdown: token.clone(),
        started_at: Instant::now(),
    });

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await;
    if let Err(e) = &served {
        error!(event = "daemon.server.serve_failed", error = %e);
    }
    token.cancel();

    info!(event = "daemon.server.shutdown_started");
    for (name, e) in manager.stop_all(grace).await {
        warn!(event = "daemon.server.instance_stop_failed", instance = %name, error = %e);
    }
    shell.shutdown(grace).await;
    let _ = signals.await;
    info!(event = "daemon.server.shutdown_completed");

    served.map_err(DaemonError::from)
}
