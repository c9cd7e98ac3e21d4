use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for SIGTERM or SIGINT/Ctrl-C, then cancel `token`.
///
/// Returns early with an error if a handler cannot be installed; the token is
/// left untouched in that case.
pub async fn wait_for_shutdown_signal(token: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigint.recv() => {
                info!(event = "daemon.server.signal_received", signal = "SIGINT");
            }
            _ = sigterm.recv() => {
                info!(event = "daemon.server.signal_received", signal = "SIGTERM");
            }
            _ = token.cancelled() => return Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!(event = "daemon.server.signal_received", signal = "SIGINT");
            }
            _ = token.cancelled() => return Ok(()),
        }
    }

    token.cancel();
    Ok(())
}
