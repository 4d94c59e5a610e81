use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{StoreError, SyncState, SyncStore};
use crate::models::{EntityKind, EntityRef, SyncEntity};

/// In-process [`SyncStore`] holding everything in maps.
///
/// Used by embedders without a database and by the engine tests; writes can be
/// made to fail to exercise transaction-failure handling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entities: BTreeMap<EntityRef, SyncEntity>,
    states: BTreeMap<EntityRef, SyncState>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts or replaces an entity, as a database-side mutation would.
    pub fn put_entity(&self, entity: SyncEntity) {
        self.inner().entities.insert(entity.entity_ref(), entity);
    }

    /// Mutates a stored entity in place and bumps `updated_at`.
    pub fn update_entity(&self, entity: EntityRef, f: impl FnOnce(&mut SyncEntity)) -> bool {
        let mut inner = self.inner();
        match inner.entities.get_mut(&entity) {
            Some(stored) => {
                let previous = stored.updated_at;
                f(stored);
                stored.updated_at = Utc::now().max(previous + chrono::Duration::milliseconds(1));
                true
            }
            None => false,
        }
    }

    pub fn remove_entity(&self, entity: EntityRef) -> Option<SyncEntity> {
        self.inner().entities.remove(&entity)
    }

    pub fn entity(&self, entity: EntityRef) -> Option<SyncEntity> {
        self.inner().entities.get(&entity).cloned()
    }

    pub fn state(&self, entity: EntityRef) -> Option<SyncState> {
        self.inner().states.get(&entity).cloned()
    }

    /// Makes every write fail with a database error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.inner().fail_writes = fail;
    }

    fn check_writable(inner: &Inner) -> Result<(), StoreError> {
        if inner.fail_writes {
            Err(StoreError::Database("simulated write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn load_entity(&self, entity: EntityRef) -> Result<Option<SyncEntity>, StoreError> {
        Ok(self.entity(entity))
    }

    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityRef>, StoreError> {
        Ok(self
            .inner()
            .entities
            .keys()
            .filter(|r| r.kind == kind)
            .copied()
            .collect())
    }

    async fn load_state(&self, entity: EntityRef) -> Result<Option<SyncState>, StoreError> {
        Ok(self.state(entity))
    }

    async fn find_state_by_path(&self, path: &Path) -> Result<Option<SyncState>, StoreError> {
        Ok(self
            .inner()
            .states
            .values()
            .find(|s| s.file_path == path)
            .cloned())
    }

    async fn list_states(&self) -> Result<Vec<SyncState>, StoreError> {
        Ok(self.inner().states.values().cloned().collect())
    }

    async fn apply_pull(
        &self,
        entity: &SyncEntity,
        expected_updated_at: DateTime<Utc>,
        state: &SyncState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        Self::check_writable(&inner)?;
        let key = entity.entity_ref();
        match inner.entities.get(&key) {
            Some(stored) if stored.updated_at != expected_updated_at => {
                return Err(StoreError::Stale(key))
            }
            None => return Err(StoreError::NotFound(key)),
            Some(_) => {}
        }
        inner.entities.insert(key, entity.clone());
        inner.states.insert(key, state.clone());
        Ok(())
    }

    async fn create_from_file(
        &self,
        entity: &SyncEntity,
        state: &SyncState,
    ) -> Result<EntityRef, StoreError> {
        let mut inner = self.inner();
        Self::check_writable(&inner)?;
        let requested = EntityRef::new(entity.kind, entity.id);
        let key = if entity.id > 0 && !inner.entities.contains_key(&requested) {
            requested
        } else {
            let next = inner
                .entities
                .keys()
                .filter(|r| r.kind == entity.kind)
                .map(|r| r.id)
                .max()
                .unwrap_or(0)
                + 1;
            EntityRef::new(entity.kind, next)
        };
        let mut stored = entity.clone();
        stored.id = key.id;
        let mut state = state.clone();
        state.entity = key;
        inner.entities.insert(key, stored);
        inner.states.insert(key, state);
        Ok(key)
    }

    async fn save_state(&self, state: &SyncState) -> Result<(), StoreError> {
        let mut inner = self.inner();
        Self::check_writable(&inner)?;
        inner.states.insert(state.entity, state.clone());
        Ok(())
    }

    async fn delete_entity(&self, entity: EntityRef) -> Result<(), StoreError> {
        let mut inner = self.inner();
        Self::check_writable(&inner)?;
        inner.entities.remove(&entity);
        inner.states.remove(&entity);
        Ok(())
    }

    async fn delete_state(&self, entity: EntityRef) -> Result<(), StoreError> {
        let mut inner = self.inner();
        Self::check_writable(&inner)?;
        inner.states.remove(&entity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ContentHash;

    fn state_for(entity: EntityRef) -> SyncState {
        SyncState::synced(
            entity,
            format!("tasks/task-{}.md", entity.id),
            ContentHash::of_text("file"),
            ContentHash::of_text("db"),
        )
    }

    #[tokio::test]
    async fn test_apply_pull_rejects_stale_entity() {
        let store = MemoryStore::new();
        let entity = SyncEntity::new(EntityKind::Task, 1, "A");
        let key = entity.entity_ref();
        let loaded_at = entity.updated_at;
        store.put_entity(entity.clone());

        store.update_entity(key, |e| e.title = "changed elsewhere".into());

        let mut pulled = entity.clone();
        pulled.title = "from file".into();
        let err = store
            .apply_pull(&pulled, loaded_at, &state_for(key))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Stale(r) if r == key));
        assert!(store.state(key).is_none());
    }

    #[tokio::test]
    async fn test_create_from_file_assigns_next_id() {
        let store = MemoryStore::new();
        store.put_entity(SyncEntity::new(EntityKind::Task, 5, "existing"));

        let draft = SyncEntity::new(EntityKind::Task, 5, "new");
        let state = SyncState::unlinked(EntityRef::new(EntityKind::Task, 0), "inbox/new.md");
        let created = store.create_from_file(&draft, &state).await.unwrap();

        assert_eq!(created, EntityRef::new(EntityKind::Task, 6));
        assert_eq!(store.entity(created).unwrap().title, "new");
        assert_eq!(store.state(created).unwrap().entity, created);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing() {
        let store = MemoryStore::new();
        let key = EntityRef::new(EntityKind::Area, 1);
        store.fail_writes(true);
        assert!(store.save_state(&state_for(key)).await.is_err());
        assert!(store.state(key).is_none());
    }

    #[tokio::test]
    async fn test_find_state_by_path() {
        let store = MemoryStore::new();
        let key = EntityRef::new(EntityKind::Task, 3);
        store.save_state(&state_for(key)).await.unwrap();
        let found = store
            .find_state_by_path(Path::new("tasks/task-3.md"))
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.entity), Some(key));
    }
}
