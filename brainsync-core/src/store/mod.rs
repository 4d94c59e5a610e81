//! Transactional store boundary.
//!
//! The engine never talks to a database directly: it reads and writes entities
//! and `sync_state` rows through [`SyncStore`], where every method is one
//! transaction that either fully applies or leaves nothing behind.

mod memory;
mod state;

pub use memory::MemoryStore;
pub use state::SyncState;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

use crate::models::{EntityKind, EntityRef, SyncEntity};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("{0} was modified concurrently")]
    Stale(EntityRef),

    #[error("{0} not found")]
    NotFound(EntityRef),
}

#[async_trait]
pub trait SyncStore: Send + Sync + 'static {
    async fn load_entity(&self, entity: EntityRef) -> Result<Option<SyncEntity>, StoreError>;

    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityRef>, StoreError>;

    async fn load_state(&self, entity: EntityRef) -> Result<Option<SyncState>, StoreError>;

    /// Finds the state row linked to a vault-relative file path.
    async fn find_state_by_path(&self, path: &Path) -> Result<Option<SyncState>, StoreError>;

    async fn list_states(&self) -> Result<Vec<SyncState>, StoreError>;

    /// Writes a pulled entity and its new state together.
    ///
    /// Fails with [`StoreError::Stale`] when the stored entity's `updated_at`
    /// no longer equals `expected_updated_at`.
    async fn apply_pull(
        &self,
        entity: &SyncEntity,
        expected_updated_at: DateTime<Utc>,
        state: &SyncState,
    ) -> Result<(), StoreError>;

    /// Inserts an entity discovered from a file together with its state.
    ///
    /// Keeps `entity.id` when it is positive and unused, otherwise assigns a
    /// new id. Returns the reference the entity was stored under.
    async fn create_from_file(
        &self,
        entity: &SyncEntity,
        state: &SyncState,
    ) -> Result<EntityRef, StoreError>;

    async fn save_state(&self, state: &SyncState) -> Result<(), StoreError>;

    /// Deletes an entity and its state row.
    async fn delete_entity(&self, entity: EntityRef) -> Result<(), StoreError>;

    async fn delete_state(&self, entity: EntityRef) -> Result<(), StoreError>;
}
