//! `brainsync resolve`: settle a flagged conflict.

use brainsync_core::{EntityRef, Resolution};
use clap::{Args, ValueEnum};

use super::{CommandError, Engine};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Side {
    /// Overwrite the file from the database
    Database,
    /// Overwrite the database from the file
    File,
}

impl From<Side> for Resolution {
    fn from(side: Side) -> Self {
        match side {
            Side::Database => Resolution::KeepDatabase,
            Side::File => Resolution::KeepFile,
        }
    }
}

/// Resolve a conflict by keeping one side
#[derive(Debug, Args)]
pub struct ResolveCommand {
    /// Conflicted entity, e.g. task#42
    entity: EntityRef,

    /// Side that wins
    #[arg(long, value_enum)]
    keep: Side,
}

impl ResolveCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), CommandError> {
        let resolution = Resolution::from(self.keep);
        let outcome = engine.resolve_conflict(self.entity, resolution).await?;
        println!("✓ {} resolved ({}): {:?}", self.entity, resolution, outcome);
        Ok(())
    }
}
