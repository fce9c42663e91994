use aodd::{Config, ConfigError, Supervisor, WorkerError};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Always-on diagnostics daemon for SMB client hosts.
#[derive(Debug, Parser)]
#[command(name = "aodd", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(Debug, Error)]
enum InitError {
    #[error("aodd must run as root")]
    NotRoot,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

fn main() -> ExitCode {
    // AOD_LOG overrides the level (e.g. AOD_LOG=debug).
    let filter = EnvFilter::try_from_env("AOD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), InitError> {
    // SAFETY: geteuid cannot fail and has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        return Err(InitError::NotRoot);
    }

    let config = Config::load(&cli.config)?;
    info!(config = ?cli.config, output = ?config.aod_output_dir, "starting");

    let mut supervisor = Supervisor::new(config);
    supervisor.start()?;

    wait_for_signal()?;
    supervisor.shutdown_and_join();
    info!("clean shutdown");
    Ok(())
}

/// Blocks until SIGINT or SIGTERM.
fn wait_for_signal() -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        Ok(())
    })
}
