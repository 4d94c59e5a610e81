//! `brainsync sync`: reconcile entities on demand.

use brainsync_core::{EntityRef, SyncSummary};
use clap::Args;

use super::{check_summary, print_summary, CommandError, Engine, OutputFormat};

/// Reconcile one or more entities now
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Entities to reconcile, e.g. task#42. Without any, every entity and
    /// vault file is reconciled.
    entities: Vec<EntityRef>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl SyncCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), CommandError> {
        let summary = if self.entities.is_empty() {
            engine.trigger_full_scan().await
        } else {
            let mut summary = SyncSummary::new();
            for entity in &self.entities {
                summary.absorb(engine.trigger_sync(*entity).await);
            }
            summary
        };

        print_summary(&summary, self.format)?;
        check_summary(&summary)
    }
}
