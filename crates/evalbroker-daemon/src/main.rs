//! evalbroker-daemon - standalone host for the file-based evaluation broker.
//!
//! The broker is normally embedded in an editor host; this binary wraps it
//! for headless runs: it wires a dispatcher, activates the broker for a
//! workspace, and then waits for a termination signal or a client-submitted
//! `shutdown` command. A `shutdown` command terminates the process with
//! status 0; a lock held by a live sibling terminates with status 1.

mod loopback;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use evalbroker_core::broker::{Broker, BrokerError};
use evalbroker_core::config::BrokerConfig;
use evalbroker_core::fs_safe::{self, MAX_DOCUMENT_SIZE};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::loopback::LoopbackDispatcher;

/// evalbroker daemon - file-based assistant evaluation broker
#[derive(Parser, Debug)]
#[command(name = "evalbroker-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Workspace root the singleton lock is scoped to
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the exchange base directory
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => fs_safe::bounded_read_json(path, MAX_DOCUMENT_SIZE)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    if let Some(base) = &args.base_dir {
        config.base_directory.clone_from(base);
    }
    Ok(config)
}

fn init_tracing(args: &Args, config: &BrokerConfig) -> Result<()> {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.as_filter().to_string());
    let filter = EnvFilter::try_new(&level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        },
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<std::process::ExitCode> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&args, &config)?;

    if !config.auto_start {
        info!("autoStart is disabled; exiting without activating");
        return Ok(std::process::ExitCode::SUCCESS);
    }

    let dispatcher = Arc::new(LoopbackDispatcher::new());
    let broker = match Broker::activate(config, &args.workspace, dispatcher).await {
        Ok(broker) => broker,
        Err(BrokerError::LockContended { owner_pid }) => {
            error!(
                owner_pid,
                "another broker already serves this workspace; refusing to activate"
            );
            return Ok(std::process::ExitCode::FAILURE);
        },
        Err(e) => return Err(e).context("broker activation failed"),
    };

    let shutdown_requested = broker.shutdown_requested();
    tokio::select! {
        () = shutdown_requested.cancelled() => {
            info!("shutdown command received");
        },
        result = wait_for_signal() => {
            if let Err(e) = result {
                error!(error = %e, "signal handling failed");
            }
        },
    }

    broker.shutdown().await;
    Ok(std::process::ExitCode::SUCCESS)
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received");
    Ok(())
}
