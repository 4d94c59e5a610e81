//! Error types for the sync engine and the file watcher.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{EntityKind, EntityRef};
use crate::store::StoreError;

/// Why a reconciliation did not complete.
///
/// Store failures abort the whole reconciliation with nothing written, so the
/// next trigger retries from scratch. Filesystem failures are retried in place
/// with backoff and only surface here once the attempts are used up.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transaction failed: {0}")]
    Transaction(#[from] StoreError),

    #[error("Filesystem error on {} after {attempts} attempt(s): {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Sync is disabled for {0} entities")]
    KindDisabled(EntityKind),

    #[error("{0} has neither a database row nor a file")]
    NotFound(EntityRef),

    #[error("{0} has no conflict to resolve")]
    NoConflict(EntityRef),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the error should be recorded on the entity's sync state.
    ///
    /// Transaction failures are not: the store may be what is failing.
    pub fn is_flaggable(&self) -> bool {
        matches!(self, SyncError::Filesystem { .. })
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to watch {}: {source}", .path.display())]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Invalid ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Vault root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}
