use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use koi_daemon::{DaemonContext, DaemonError, KoiShell};

#[derive(Debug, Parser)]
#[command(name = "koi-daemon", version, about = "Supervise Koishi instances")]
struct Args {
    /// State directory (defaults to $KOI_HOME or ~/.koi)
    #[arg(long, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Boot without starting any instance
    #[arg(long)]
    no_start: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    let args = Args::parse();
    koi_daemon::init_logging(args.json_logs);
    info!(event = "daemon.start_started");

    let exit_code = match run(args) {
        Ok(()) => {
            info!(event = "daemon.start_completed");
            0
        }
        Err(e) => {
            error!(event = "daemon.start_failed", code = e.error_code(), error = %e);
            eprintln!("koi-daemon: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(args: Args) -> Result<(), DaemonError> {
    let mut ctx = DaemonContext::load(args.home)?;
    if args.no_start {
        ctx.config.start_instances = false;
    }
    let helper = KoiShell::new(ctx.helper_path(), ctx.paths.config_dir());

    eprintln!(
        "Starting daemon in foreground (PID: {})...",
        std::process::id()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let result = koi_daemon::run_server(ctx).await;
        if matches!(result, Err(DaemonError::AlreadyRunning { .. })) && helper.is_available() {
            // Failures are logged by the shell.
            let _ = helper.already_running().await;
        }
        result
    })
}
