use brainsync_core::SyncEngine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod db;

use commands::{
    ConfigCommand, Engine, ResolveCommand, ScanCommand, StatusCommand, SyncCommand, WatchCommand,
};
use config::Config;
use db::{init_db, SqliteStore};

#[derive(Parser)]
#[command(name = "brainsync")]
#[command(version)]
#[command(about = "Keep projects, tasks and areas in sync with a markdown vault", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile entities with their files now
    Sync(SyncCommand),

    /// Reconcile every entity and vault file
    Scan(ScanCommand),

    /// Show sync status
    Status(StatusCommand),

    /// Resolve a conflict by keeping one side
    Resolve(ResolveCommand),

    /// Watch the vault and sync continuously
    Watch(WatchCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brainsync=info,brainsync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Save config path for config commands
    let cli_config_path = cli.config.clone();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Sync(cmd)) => cmd.run(&open_engine(&config).await?).await?,
        Some(Commands::Scan(cmd)) => cmd.run(&open_engine(&config).await?).await?,
        Some(Commands::Status(cmd)) => cmd.run(&open_engine(&config).await?).await?,
        Some(Commands::Resolve(cmd)) => cmd.run(&open_engine(&config).await?).await?,
        Some(Commands::Watch(cmd)) => cmd.run(Arc::new(open_engine(&config).await?)).await?,
        Some(Commands::Config(cmd)) => cmd.run(&config, cli_config_path)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Opens the database and builds an engine over the configured vault.
async fn open_engine(config: &Config) -> Result<Engine, Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_path.value).await?;
    std::fs::create_dir_all(&config.vault_root.value)?;

    let store = Arc::new(SqliteStore::new(pool));
    let engine = SyncEngine::new(store, config.sync_settings(), CancellationToken::new())?;
    Ok(engine)
}
