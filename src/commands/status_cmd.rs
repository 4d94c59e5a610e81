//! `brainsync status`: inspect sync state without changing anything.

use brainsync_core::{EntityRef, SyncState, SyncStore};
use clap::Args;

use super::{CommandError, Engine, OutputFormat};

/// Show the sync status of an entity, or every pair needing attention
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Entity to inspect, e.g. task#42
    entity: Option<EntityRef>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl StatusCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), CommandError> {
        match self.entity {
            Some(entity) => self.show_entity(engine, entity).await,
            None => self.show_attention(engine).await,
        }
    }

    async fn show_entity(&self, engine: &Engine, entity: EntityRef) -> Result<(), CommandError> {
        let status = engine.status(entity).await?;
        if let OutputFormat::Json = self.format {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }

        println!("{}: {}", status.entity, status.status);
        println!(
            "  file:   {}{}",
            status.file_path.display(),
            if status.file_exists { "" } else { " (missing)" }
        );
        println!(
            "  entity: {}",
            if status.entity_exists { "present" } else { "missing" }
        );
        match &status.state {
            Some(state) => print_state(state),
            None => println!("  never synced"),
        }
        Ok(())
    }

    async fn show_attention(&self, engine: &Engine) -> Result<(), CommandError> {
        let states: Vec<SyncState> = engine
            .store()
            .list_states()
            .await?
            .into_iter()
            .filter(|s| s.conflict_flag || s.sync_error.is_some())
            .collect();

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&states)?),
            OutputFormat::Text => {
                if states.is_empty() {
                    println!("No conflicts or sync errors.");
                }
                for state in &states {
                    println!("{} ({})", state.entity, state.file_path.display());
                    print_state(state);
                }
            }
        }
        Ok(())
    }
}

fn print_state(state: &SyncState) {
    if let Some(at) = state.last_synced_at {
        println!("  last synced: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(hash) = &state.last_synced_file_hash {
        println!("  file hash:   {}", hash.short());
    }
    if let Some(hash) = &state.last_synced_db_hash {
        println!("  db hash:     {}", hash.short());
    }
    if state.conflict_flag {
        match &state.conflict_artifact {
            Some(artifact) => println!("  conflict:    see {}", artifact.display()),
            None => println!("  conflict:    unresolved"),
        }
    }
    if let Some(error) = &state.sync_error {
        println!("  sync error:  {}", error);
    }
}
