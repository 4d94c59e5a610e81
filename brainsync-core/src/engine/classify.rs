//! Pure classification of an entity/file pair.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::document::ContentHash;
use crate::models::EntityRef;
use crate::settings::{ConflictPolicy, DeletionPolicy};
use crate::store::SyncState;

/// Where a pair stands relative to its last successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    /// The database changed, the file did not.
    PushPending,
    /// The file changed, the database did not.
    PullPending,
    Conflict,
    Unlinked,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::InSync => "in_sync",
            SyncStatus::PushPending => "push_pending",
            SyncStatus::PullPending => "pull_pending",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Unlinked => "unlinked",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Database to file.
    Push,
    /// File to database.
    Pull,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    Unchanged,
    DatabaseChanged,
    FileChanged,
    /// Entity without a file yet.
    NewEntity,
    /// File without an entity yet.
    NewFile,
    FileDeleted,
    EntityDeleted,
    BothDeleted,
    BothChanged,
    /// Entity and file both exist but were never linked.
    FirstAssociation,
    /// Both sides changed but already agree.
    Converged,
    /// Flagged earlier and still waiting for an explicit resolution.
    ConflictPending,
    /// A caller picked the winning side.
    Resolution,
    /// Neither side exists.
    Missing,
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncReason::Unchanged => "unchanged",
            SyncReason::DatabaseChanged => "database changed",
            SyncReason::FileChanged => "file changed",
            SyncReason::NewEntity => "new entity",
            SyncReason::NewFile => "new file",
            SyncReason::FileDeleted => "file deleted",
            SyncReason::EntityDeleted => "entity deleted",
            SyncReason::BothDeleted => "both deleted",
            SyncReason::BothChanged => "both changed",
            SyncReason::FirstAssociation => "first association",
            SyncReason::Converged => "already converged",
            SyncReason::ConflictPending => "unresolved conflict",
            SyncReason::Resolution => "explicit resolution",
            SyncReason::Missing => "missing",
        };
        write!(f, "{}", s)
    }
}

/// The unit of work one reconciliation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub entity: EntityRef,
    pub direction: SyncDirection,
    pub reason: SyncReason,
}

impl SyncOperation {
    pub fn new(entity: EntityRef, direction: SyncDirection, reason: SyncReason) -> Self {
        Self {
            entity,
            direction,
            reason,
        }
    }

    /// Both sides diverged and no side was picked.
    pub fn is_conflict(&self) -> bool {
        self.direction == SyncDirection::None
            && matches!(
                self.reason,
                SyncReason::BothChanged | SyncReason::FirstAssociation | SyncReason::ConflictPending
            )
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
            SyncDirection::None => "none",
        };
        write!(f, "{} {} ({})", direction, self.entity, self.reason)
    }
}

/// Compares current hashes with the last-synced ones. `None` hashes mean the
/// side is absent.
pub fn classify(
    state: Option<&SyncState>,
    file_hash: Option<&ContentHash>,
    db_hash: Option<&ContentHash>,
) -> SyncStatus {
    let Some(state) = state.filter(|s| s.is_linked()) else {
        return SyncStatus::Unlinked;
    };
    let file_changed = file_hash != state.last_synced_file_hash.as_ref();
    let db_changed = db_hash != state.last_synced_db_hash.as_ref();
    match (file_changed, db_changed) {
        (false, false) => SyncStatus::InSync,
        (true, false) => SyncStatus::PullPending,
        (false, true) => SyncStatus::PushPending,
        (true, true) => SyncStatus::Conflict,
    }
}

/// Facts about a pair that the operation depends on besides its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairFacts {
    pub entity_exists: bool,
    pub file_exists: bool,
    /// Pulling the file would leave the entity as it is.
    pub converged: bool,
    /// The file was modified after the entity's `updated_at`.
    pub file_newer: bool,
    /// The pair carries a conflict flag from an earlier reconciliation.
    pub conflict_flagged: bool,
}

/// Decides what a reconciliation does for a classified pair.
///
/// A flagged pair stays put whatever either side did since, unless both
/// sides now agree.
pub fn plan_operation(
    entity: EntityRef,
    status: SyncStatus,
    facts: PairFacts,
    conflict_policy: ConflictPolicy,
    deletion_policy: DeletionPolicy,
) -> SyncOperation {
    use SyncDirection::{None as Stay, Pull, Push};

    let (direction, reason) = match status {
        SyncStatus::InSync => (Stay, SyncReason::Unchanged),
        SyncStatus::PushPending if facts.entity_exists => (Push, SyncReason::DatabaseChanged),
        SyncStatus::PushPending => (Push, SyncReason::EntityDeleted),
        SyncStatus::PullPending if facts.file_exists => (Pull, SyncReason::FileChanged),
        SyncStatus::PullPending => match deletion_policy {
            DeletionPolicy::DeleteEntity => (Pull, SyncReason::FileDeleted),
            DeletionPolicy::Restore => (Push, SyncReason::FileDeleted),
        },
        SyncStatus::Conflict if !facts.entity_exists && !facts.file_exists => {
            (Stay, SyncReason::BothDeleted)
        }
        SyncStatus::Conflict if facts.converged => (Stay, SyncReason::Converged),
        SyncStatus::Conflict => (
            conflict_direction(conflict_policy, facts),
            SyncReason::BothChanged,
        ),
        SyncStatus::Unlinked => match (facts.entity_exists, facts.file_exists) {
            (true, false) => (Push, SyncReason::NewEntity),
            (false, true) => (Pull, SyncReason::NewFile),
            (false, false) => (Stay, SyncReason::Missing),
            (true, true) if facts.converged => (Stay, SyncReason::Converged),
            (true, true) => (
                conflict_direction(conflict_policy, facts),
                SyncReason::FirstAssociation,
            ),
        },
    };
    if facts.conflict_flagged && reason != SyncReason::Converged {
        return SyncOperation::new(entity, Stay, SyncReason::ConflictPending);
    }
    SyncOperation::new(entity, direction, reason)
}

fn conflict_direction(policy: ConflictPolicy, facts: PairFacts) -> SyncDirection {
    match policy {
        ConflictPolicy::Manual => SyncDirection::None,
        ConflictPolicy::PreferDatabase => SyncDirection::Push,
        ConflictPolicy::PreferFile => SyncDirection::Pull,
        ConflictPolicy::NewestWins if facts.file_newer => SyncDirection::Pull,
        ConflictPolicy::NewestWins => SyncDirection::Push,
    }
}
