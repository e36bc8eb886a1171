//! Hive Control - operator CLI for the hive controller
//!
//! Read-only views of what the daemon sees: capacity plans, membership,
//! quorum, search-engine health and the bootstrap journal.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hivectl")]
#[command(about = "Hive cluster controller - operator tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (overrides HIVE_CONFIG and /etc/hive/hive.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the capacity plan for a node count
    Plan {
        /// Number of nodes in the cluster
        #[arg(long)]
        nodes: usize,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show cluster membership and workload replicas
    Status,

    /// Evaluate quorum without acting on it
    Quorum,

    /// Probe the search engine once and classify the result
    Probe,

    /// Show recent search-engine health samples
    History {
        /// Number of samples to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show the bootstrap journal of this node
    BootstrapStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Plan { nodes, json } => commands::plan(config, nodes, json),
        Commands::Status => commands::status(config).await,
        Commands::Quorum => commands::quorum(config).await,
        Commands::Probe => commands::probe(config).await,
        Commands::History { limit } => commands::history(config, limit).await,
        Commands::BootstrapStatus => commands::bootstrap_status(config).await,
    }
}
