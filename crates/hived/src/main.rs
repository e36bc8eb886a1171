//! Hive Daemon - cluster bootstrap and self-healing controller
//!
//! Bootstraps this node into the swarm once, then keeps the quorum, service
//! and search-health loops running until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use hive_common::config::HiveConfig;
use hived::daemon::{Collaborators, Daemon, RunOptions};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hived")]
#[command(about = "Hive cluster controller daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (overrides HIVE_CONFIG and /etc/hive/hive.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Discard the bootstrap journal and bootstrap again
    #[arg(long)]
    rebootstrap: bool,

    /// Start the monitoring loops without bootstrapping
    #[arg(long, conflicts_with = "rebootstrap")]
    skip_bootstrap: bool,
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("hived v{} starting", env!("CARGO_PKG_VERSION"));

    let config = HiveConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let parts = Collaborators::production(&config)?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "signal handling failed, shutting down"),
        }
        let _ = tx.send(true);
    });

    let options = RunOptions {
        rebootstrap: args.rebootstrap,
        skip_bootstrap: args.skip_bootstrap,
    };
    Daemon::new(config, parts).run(options, rx).await?;

    info!("hived stopped");
    Ok(())
}
