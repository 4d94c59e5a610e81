//! `brainsync scan`: full reconciliation, or a preview of it.

use brainsync_core::engine::SyncReason;
use brainsync_core::{SyncOperation, SyncStore};
use clap::Args;

use super::{check_summary, print_summary, CommandError, Engine, OutputFormat};

/// Reconcile every entity and every vault file
#[derive(Debug, Args)]
pub struct ScanCommand {
    /// Only show what each entity's next reconciliation would do
    #[arg(long)]
    dry_run: bool,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl ScanCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), CommandError> {
        if !self.dry_run {
            let summary = engine.trigger_full_scan().await;
            print_summary(&summary, self.format)?;
            return check_summary(&summary);
        }

        let mut plans: Vec<SyncOperation> = Vec::new();
        for kind in &engine.settings().kinds {
            for entity in engine.store().list_entities(*kind).await? {
                plans.push(engine.plan(entity).await?);
            }
        }

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plans)?),
            OutputFormat::Text => {
                let pending: Vec<_> = plans
                    .iter()
                    .filter(|p| p.reason != SyncReason::Unchanged)
                    .collect();
                if pending.is_empty() {
                    println!("Everything is in sync ({} entities).", plans.len());
                }
                for plan in pending {
                    println!("  {}", plan);
                }
            }
        }
        Ok(())
    }
}
