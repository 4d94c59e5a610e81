mod config_cmd;
mod resolve_cmd;
mod scan_cmd;
mod status_cmd;
mod sync_cmd;
mod watch_cmd;

pub use config_cmd::ConfigCommand;
pub use resolve_cmd::ResolveCommand;
pub use scan_cmd::ScanCommand;
pub use status_cmd::StatusCommand;
pub use sync_cmd::SyncCommand;
pub use watch_cmd::WatchCommand;

use brainsync_core::{StoreError, SyncError, SyncSummary, WatchError};
use clap::ValueEnum;

use crate::db::SqliteStore;

pub type Engine = brainsync_core::SyncEngine<SqliteStore>;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn print_summary(summary: &SyncSummary, format: OutputFormat) -> Result<(), CommandError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Text => {
            println!("{}", summary);
            for conflict in &summary.conflicts {
                println!("  ! conflict: {}", conflict);
            }
            for failure in &summary.failures {
                println!("  ✗ {}: {}", failure.target, failure.error);
            }
        }
    }
    Ok(())
}

/// Errors from brainsync commands
#[derive(Debug)]
pub enum CommandError {
    Sync(SyncError),
    Store(StoreError),
    Watch(WatchError),
    Io(std::io::Error),
    Json(serde_json::Error),
    /// Some reconciliations failed; the count is in the summary already printed.
    Incomplete(usize),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Sync(e) => write!(f, "{}", e),
            CommandError::Store(e) => write!(f, "{}", e),
            CommandError::Watch(e) => write!(f, "{}", e),
            CommandError::Io(e) => write!(f, "{}", e),
            CommandError::Json(e) => write!(f, "Failed to encode output: {}", e),
            CommandError::Incomplete(count) => write!(
                f,
                "{} reconciliation{} failed",
                count,
                if *count == 1 { "" } else { "s" }
            ),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Sync(e) => Some(e),
            CommandError::Store(e) => Some(e),
            CommandError::Watch(e) => Some(e),
            CommandError::Io(e) => Some(e),
            CommandError::Json(e) => Some(e),
            CommandError::Incomplete(_) => None,
        }
    }
}

impl From<SyncError> for CommandError {
    fn from(e: SyncError) -> Self {
        CommandError::Sync(e)
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        CommandError::Store(e)
    }
}

impl From<WatchError> for CommandError {
    fn from(e: WatchError) -> Self {
        CommandError::Watch(e)
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::Io(e)
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::Json(e)
    }
}

/// Fails the command when any reconciliation errored.
fn check_summary(summary: &SyncSummary) -> Result<(), CommandError> {
    if summary.errored > 0 {
        Err(CommandError::Incomplete(summary.errored))
    } else {
        Ok(())
    }
}
