//! CLI entry point for the compressarr daemon
//!
//! Parses command line arguments, initializes logging, runs the daemon, and
//! translates signals into shutdown with the documented exit codes.

use clap::Parser;
use compressarr::{Daemon, DaemonOptions, FfprobeMediaProbe, StaticPluginLoader, StoragePaths};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Grace window between shutdown and forced exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Compressarr - media transcoding orchestrator
#[derive(Parser, Debug)]
#[command(name = "compressarr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Force color output
    #[arg(short = 'C', long)]
    color: bool,

    /// Enable debug-level logging
    #[arg(short = 'D', long)]
    debug: bool,

    /// Maximum concurrent jobs
    #[arg(short = 'I', long, default_value_t = 1)]
    instances: usize,

    /// Override the job temp-root (default: <storage>/jobs)
    #[arg(short = 'J', long)]
    job_path: Option<PathBuf>,

    /// Additional plugin search path
    #[arg(short = 'P', long)]
    plugin_path: Option<PathBuf>,

    /// Override the storage root (default: ~/.compressarr)
    #[arg(short = 'U', long)]
    user_storage_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    compressarr::logging::init_logging(args.debug, args.color);

    // The storage root must be settled before anything reads it.
    let paths = StoragePaths::new(
        args.user_storage_path
            .unwrap_or_else(StoragePaths::default_root),
    );
    if let Some(job_path) = args.job_path {
        paths.set_job_root(job_path);
    }

    let mut options = DaemonOptions::new(
        Arc::new(StaticPluginLoader::default()),
        Arc::new(FfprobeMediaProbe),
    );
    options.instances = args.instances.max(1);
    options.plugin_path = args.plugin_path;

    let daemon = match Daemon::new(&paths, options).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = daemon.launch() {
        error!("Failed to start watchers: {}", e);
        return ExitCode::FAILURE;
    }

    let signum = tokio::select! {
        result = daemon.run() => {
            return match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Daemon error: {}", e);
                    ExitCode::FAILURE
                }
            };
        }
        signum = wait_for_signal() => signum,
    };

    daemon.shutdown();
    if tokio::time::timeout(SHUTDOWN_GRACE, daemon.run())
        .await
        .is_err()
    {
        error!("shutdown grace window expired, forcing exit");
    }

    // Signal-initiated shutdown exits 128 + signum.
    ExitCode::from(128u8.wrapping_add(signum))
}

/// Wait for SIGINT or SIGTERM, returning the signal number.
#[cfg(unix)]
async fn wait_for_signal() -> u8 {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => SignalKind::interrupt().as_raw_value() as u8,
        _ = terminate.recv() => SignalKind::terminate().as_raw_value() as u8,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> u8 {
    let _ = tokio::signal::ctrl_c().await;
    // SIGINT equivalent
    2
}
