//! Static sync configuration, resolved once at startup.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::EntityKind;
use crate::watcher::WatchConfig;

/// What to do when both sides changed since the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Flag the pair and write a conflict artifact; wait for an explicit resolution.
    #[default]
    Manual,
    PreferDatabase,
    PreferFile,
    /// Compare the file's mtime with the entity's `updated_at`.
    NewestWins,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Manual => "manual",
            ConflictPolicy::PreferDatabase => "prefer_database",
            ConflictPolicy::PreferFile => "prefer_file",
            ConflictPolicy::NewestWins => "newest_wins",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "manual" => Ok(ConflictPolicy::Manual),
            "prefer_database" | "database" => Ok(ConflictPolicy::PreferDatabase),
            "prefer_file" | "file" => Ok(ConflictPolicy::PreferFile),
            "newest_wins" | "newest" => Ok(ConflictPolicy::NewestWins),
            _ => Err(format!(
                "Invalid conflict policy '{}'. Use manual, prefer_database, prefer_file or newest_wins.",
                s
            )),
        }
    }
}

/// What to do when a linked file disappears while its entity is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    #[default]
    DeleteEntity,
    /// Write the file back from the entity.
    Restore,
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionPolicy::DeleteEntity => write!(f, "delete_entity"),
            DeletionPolicy::Restore => write!(f, "restore"),
        }
    }
}

impl FromStr for DeletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "delete_entity" | "delete" => Ok(DeletionPolicy::DeleteEntity),
            "restore" => Ok(DeletionPolicy::Restore),
            _ => Err(format!(
                "Invalid deletion policy '{}'. Use delete_entity or restore.",
                s
            )),
        }
    }
}

/// Bounded exponential backoff for filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// capped at `max_delay`, with up to 25% random jitter added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..=jitter_ms);
        (delay + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

/// Everything the engine and the service need to know, fixed at startup.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub vault_root: PathBuf,
    /// Entity kinds that participate in sync.
    pub kinds: BTreeSet<EntityKind>,
    pub conflict_policy: ConflictPolicy,
    pub deletion_policy: DeletionPolicy,
    pub retry: RetryPolicy,
    /// Upper bound on concurrent reconciliations.
    pub max_workers: usize,
    /// Capacity of the change-event and dirty-signal queues.
    pub queue_capacity: usize,
    pub full_scan_interval: Option<Duration>,
    pub watch: WatchConfig,
}

impl SyncSettings {
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
            kinds: EntityKind::ALL.iter().copied().collect(),
            conflict_policy: ConflictPolicy::default(),
            deletion_policy: DeletionPolicy::default(),
            retry: RetryPolicy::default(),
            max_workers: 4,
            queue_capacity: 1024,
            full_scan_interval: None,
            watch: WatchConfig::default(),
        }
    }

    pub fn is_enabled(&self, kind: EntityKind) -> bool {
        self.kinds.contains(&kind)
    }
}
