use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::SyncError;
use crate::models::EntityRef;

/// What one reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Unchanged,
    /// State recorded for a pair that already agreed; nothing written.
    Linked,
    Pushed,
    Pulled,
    /// A new file produced a new entity.
    Created { entity: EntityRef },
    /// The entity is gone, so its file was removed.
    FileRemoved,
    /// The file is gone, so its entity was deleted.
    EntityDeleted,
    Conflicted { artifact: Option<PathBuf> },
    /// Still conflicted from an earlier pass.
    ConflictPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub target: String,
    pub error: String,
}

/// Counts over any number of reconciliations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub pushed: usize,
    pub pulled: usize,
    pub conflicted: usize,
    pub errored: usize,
    pub unchanged: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SyncFailure>,
}

impl SyncSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: impl fmt::Display, result: &Result<SyncOutcome, SyncError>) {
        match result {
            Ok(SyncOutcome::Pushed | SyncOutcome::FileRemoved) => self.pushed += 1,
            Ok(SyncOutcome::Pulled | SyncOutcome::Created { .. } | SyncOutcome::EntityDeleted) => {
                self.pulled += 1
            }
            Ok(SyncOutcome::Conflicted { .. } | SyncOutcome::ConflictPending) => {
                self.conflicted += 1;
                self.conflicts.push(target.to_string());
            }
            Ok(SyncOutcome::Unchanged | SyncOutcome::Linked) => self.unchanged += 1,
            Err(e) => {
                self.errored += 1;
                self.failures.push(SyncFailure {
                    target: target.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn absorb(&mut self, other: SyncSummary) {
        self.pushed += other.pushed;
        self.pulled += other.pulled;
        self.conflicted += other.conflicted;
        self.errored += other.errored;
        self.unchanged += other.unchanged;
        self.conflicts.extend(other.conflicts);
        self.failures.extend(other.failures);
    }

    pub fn total(&self) -> usize {
        self.pushed + self.pulled + self.conflicted + self.errored + self.unchanged
    }

    /// True when something needs a human: a conflict or an error.
    pub fn needs_attention(&self) -> bool {
        self.conflicted > 0 || self.errored > 0
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {}, pulled {}, conflicted {}, errored {}, unchanged {}",
            self.pushed, self.pulled, self.conflicted, self.errored, self.unchanged
        )
    }
}
