use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::document::ContentHash;
use crate::models::EntityRef;

/// Persisted sync bookkeeping for one entity/file pair.
///
/// Hashes are `None` until the first successful sync; such a row only exists
/// to carry a conflict or error flag for a pair that was never linked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub entity: EntityRef,
    /// Path relative to the vault root.
    pub file_path: PathBuf,
    pub last_synced_file_hash: Option<ContentHash>,
    pub last_synced_db_hash: Option<ContentHash>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub conflict_flag: bool,
    pub conflict_artifact: Option<PathBuf>,
    pub sync_error: Option<String>,
}

impl SyncState {
    /// A row for a pair that has not synced yet.
    pub fn unlinked(entity: EntityRef, file_path: impl Into<PathBuf>) -> Self {
        Self {
            entity,
            file_path: file_path.into(),
            last_synced_file_hash: None,
            last_synced_db_hash: None,
            last_synced_at: None,
            conflict_flag: false,
            conflict_artifact: None,
            sync_error: None,
        }
    }

    /// A row recording a successful sync; clears any flags.
    pub fn synced(
        entity: EntityRef,
        file_path: impl Into<PathBuf>,
        file_hash: ContentHash,
        db_hash: ContentHash,
    ) -> Self {
        Self {
            last_synced_file_hash: Some(file_hash),
            last_synced_db_hash: Some(db_hash),
            last_synced_at: Some(Utc::now()),
            ..Self::unlinked(entity, file_path)
        }
    }

    pub fn is_linked(&self) -> bool {
        self.last_synced_file_hash.is_some() && self.last_synced_db_hash.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    #[test]
    fn test_unlinked_and_synced() {
        let entity = EntityRef::new(EntityKind::Task, 1);
        let state = SyncState::unlinked(entity, "tasks/task-1.md");
        assert!(!state.is_linked());
        assert!(state.last_synced_at.is_none());

        let synced = SyncState::synced(
            entity,
            "tasks/task-1.md",
            ContentHash::of_text("a"),
            ContentHash::of_text("b"),
        );
        assert!(synced.is_linked());
        assert!(!synced.conflict_flag);
        assert!(synced.last_synced_at.is_some());
    }
}
