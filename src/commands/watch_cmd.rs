//! `brainsync watch`: keep the vault and the database in sync until Ctrl-C.

use brainsync_core::SyncService;
use clap::Args;
use std::sync::Arc;
use tracing::info;

use super::{print_summary, CommandError, Engine, OutputFormat};

/// Watch the vault and reconcile changes as they happen
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Skip the full scan that normally runs before watching starts
    #[arg(long)]
    no_initial_scan: bool,

    /// Output format of the final summary
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl WatchCommand {
    pub async fn run(&self, engine: Arc<Engine>) -> Result<(), CommandError> {
        let service = SyncService::start(Arc::clone(&engine))?;
        if !self.no_initial_scan {
            service.handle().request_full_scan();
        }

        println!(
            "Watching {} (Ctrl-C to stop)",
            engine.settings().vault_root.display()
        );
        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested, draining queued work");

        let summary = service.shutdown().await;
        print_summary(&summary, self.format)
    }
}
