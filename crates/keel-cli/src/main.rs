//! keel CLI tool.

use anyhow::Context;
use clap::{Parser, Subcommand};
use keel_config::load_system_config;
use keel_scheduler::{KeyLayout, RedisStore, StatusLedger};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod commands;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Inspect the keel build queue", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "KEEL_CONFIG", default_value = "keel.kdl")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the queue state of a job
    Status {
        /// Serialized job key
        key: String,
    },
    /// List the ready and active pools
    Pools {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "keel.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => commands::validate(&path),
        Commands::Status { key } => {
            let ledger = connect(&cli.config).await?;
            commands::queue::status(&ledger, &key).await
        }
        Commands::Pools { json } => {
            let ledger = connect(&cli.config).await?;
            commands::queue::pools(&ledger, json).await
        }
    }
}

async fn connect(config_path: &str) -> anyhow::Result<StatusLedger> {
    let config = load_system_config(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path))?;
    let coordinator = config.coordinator;

    let url = coordinator.redis_url.as_deref().unwrap_or(DEFAULT_REDIS_URL);
    let store = RedisStore::connect(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    // Nothing listens for transitions here; this process only reads.
    let (ledger, _transitions) = StatusLedger::new(
        Arc::new(store),
        KeyLayout::new(coordinator.key_prefix),
        coordinator.status_ttl,
    );
    Ok(ledger)
}
