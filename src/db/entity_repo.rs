use async_trait::async_trait;
use brainsync_core::{
    ContentHash, EntityKind, EntityRef, FieldValue, StoreError, SyncEntity, SyncState, SyncStore,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// [`SyncStore`] over the entity tables and `sync_state`.
///
/// Every trait method runs in its own transaction.
pub struct SqliteStore {
    pool: SqlitePool,
}

// Row types for database queries
#[derive(sqlx::FromRow)]
struct EntityRow {
    id: i64,
    title: String,
    status: String,
    fields: String,
    notes: String,
    updated_at: String,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    entity_kind: String,
    entity_id: i64,
    file_path: String,
    last_synced_file_hash: Option<String>,
    last_synced_db_hash: Option<String>,
    last_synced_at: Option<String>,
    conflict_flag: bool,
    conflict_artifact: Option<String>,
    sync_error: Option<String>,
}

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Area => "areas",
        EntityKind::Project => "projects",
        EntityKind::Task => "tasks",
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("Invalid timestamp '{}': {}", raw, e)))
}

/// Vault-relative paths are stored with `/` separators on every platform.
fn path_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

impl EntityRow {
    fn into_entity(self, kind: EntityKind) -> Result<SyncEntity, StoreError> {
        let fields: BTreeMap<String, FieldValue> =
            serde_json::from_str(&self.fields).map_err(|e| {
                StoreError::Database(format!(
                    "Invalid fields for {}: {}",
                    EntityRef::new(kind, self.id),
                    e
                ))
            })?;
        Ok(SyncEntity {
            kind,
            id: self.id,
            title: self.title,
            status: self.status,
            fields,
            body_markdown: self.notes,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl StateRow {
    fn into_state(self) -> Result<SyncState, StoreError> {
        let kind = self
            .entity_kind
            .parse::<EntityKind>()
            .map_err(StoreError::Database)?;
        Ok(SyncState {
            entity: EntityRef::new(kind, self.entity_id),
            file_path: PathBuf::from(self.file_path),
            last_synced_file_hash: self.last_synced_file_hash.map(ContentHash::from_hex),
            last_synced_db_hash: self.last_synced_db_hash.map(ContentHash::from_hex),
            last_synced_at: self
                .last_synced_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            conflict_flag: self.conflict_flag,
            conflict_artifact: self.conflict_artifact.map(PathBuf::from),
            sync_error: self.sync_error,
        })
    }
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert_state(
        tx: &mut Transaction<'_, Sqlite>,
        state: &SyncState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (entity_kind, entity_id, file_path, last_synced_file_hash, last_synced_db_hash, last_synced_at, conflict_flag, conflict_artifact, sync_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_kind, entity_id) DO UPDATE SET
                file_path = excluded.file_path,
                last_synced_file_hash = excluded.last_synced_file_hash,
                last_synced_db_hash = excluded.last_synced_db_hash,
                last_synced_at = excluded.last_synced_at,
                conflict_flag = excluded.conflict_flag,
                conflict_artifact = excluded.conflict_artifact,
                sync_error = excluded.sync_error
            "#,
        )
        .bind(state.entity.kind.as_str())
        .bind(state.entity.id)
        .bind(path_key(&state.file_path))
        .bind(state.last_synced_file_hash.as_ref().map(|h| h.as_str()))
        .bind(state.last_synced_db_hash.as_ref().map(|h| h.as_str()))
        .bind(state.last_synced_at.map(timestamp))
        .bind(state.conflict_flag)
        .bind(state.conflict_artifact.as_deref().map(path_key))
        .bind(&state.sync_error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn entity_exists(
        tx: &mut Transaction<'_, Sqlite>,
        entity: EntityRef,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", table(entity.kind));
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(entity.id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(count > 0)
    }

    fn encode_fields(entity: &SyncEntity) -> Result<String, StoreError> {
        serde_json::to_string(&entity.fields)
            .map_err(|e| StoreError::Database(format!("Cannot encode fields: {}", e)))
    }
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn load_entity(&self, entity: EntityRef) -> Result<Option<SyncEntity>, StoreError> {
        let sql = format!(
            "SELECT id, title, status, fields, notes, updated_at FROM {} WHERE id = ?",
            table(entity.kind)
        );
        let row: Option<EntityRow> = sqlx::query_as(&sql)
            .bind(entity.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| row.into_entity(entity.kind)).transpose()
    }

    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityRef>, StoreError> {
        let sql = format!("SELECT id FROM {} ORDER BY id", table(kind));
        let ids: Vec<(i64,)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(ids
            .into_iter()
            .map(|(id,)| EntityRef::new(kind, id))
            .collect())
    }

    async fn load_state(&self, entity: EntityRef) -> Result<Option<SyncState>, StoreError> {
        let row: Option<StateRow> =
            sqlx::query_as("SELECT * FROM sync_state WHERE entity_kind = ? AND entity_id = ?")
                .bind(entity.kind.as_str())
                .bind(entity.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(StateRow::into_state).transpose()
    }

    async fn find_state_by_path(&self, path: &Path) -> Result<Option<SyncState>, StoreError> {
        let row: Option<StateRow> =
            sqlx::query_as("SELECT * FROM sync_state WHERE file_path = ? LIMIT 1")
                .bind(path_key(path))
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(StateRow::into_state).transpose()
    }

    async fn list_states(&self) -> Result<Vec<SyncState>, StoreError> {
        let rows: Vec<StateRow> =
            sqlx::query_as("SELECT * FROM sync_state ORDER BY entity_kind, entity_id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter().map(StateRow::into_state).collect()
    }

    async fn apply_pull(
        &self,
        entity: &SyncEntity,
        expected_updated_at: DateTime<Utc>,
        state: &SyncState,
    ) -> Result<(), StoreError> {
        let key = entity.entity_ref();
        let fields = Self::encode_fields(entity)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let sql = format!(
            "UPDATE {} SET title = ?, status = ?, fields = ?, notes = ?, updated_at = ? WHERE id = ? AND updated_at = ?",
            table(entity.kind)
        );
        let result = sqlx::query(&sql)
            .bind(&entity.title)
            .bind(&entity.status)
            .bind(&fields)
            .bind(&entity.body_markdown)
            .bind(timestamp(entity.updated_at))
            .bind(entity.id)
            .bind(timestamp(expected_updated_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let exists = Self::entity_exists(&mut tx, key).await.map_err(db_err)?;
            tx.rollback().await.map_err(db_err)?;
            return Err(if exists {
                StoreError::Stale(key)
            } else {
                StoreError::NotFound(key)
            });
        }

        Self::upsert_state(&mut tx, state).await.map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn create_from_file(
        &self,
        entity: &SyncEntity,
        state: &SyncState,
    ) -> Result<EntityRef, StoreError> {
        let fields = Self::encode_fields(entity)?;
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let requested = EntityRef::new(entity.kind, entity.id);
        let keep_id = entity.id > 0
            && !Self::entity_exists(&mut tx, requested)
                .await
                .map_err(db_err)?;

        let sql = format!(
            "INSERT INTO {} (id, title, status, fields, notes, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            table(entity.kind)
        );
        let result = sqlx::query(&sql)
            .bind(keep_id.then_some(entity.id))
            .bind(&entity.title)
            .bind(&entity.status)
            .bind(&fields)
            .bind(&entity.body_markdown)
            .bind(&now)
            .bind(timestamp(entity.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let key = EntityRef::new(entity.kind, result.last_insert_rowid());
        let mut state = state.clone();
        state.entity = key;
        Self::upsert_state(&mut tx, &state).await.map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(key)
    }

    async fn save_state(&self, state: &SyncState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::upsert_state(&mut tx, state).await.map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_entity(&self, entity: EntityRef) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let sql = format!("DELETE FROM {} WHERE id = ?", table(entity.kind));
        sqlx::query(&sql)
            .bind(entity.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM sync_state WHERE entity_kind = ? AND entity_id = ?")
            .bind(entity.kind.as_str())
            .bind(entity.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_state(&self, entity: EntityRef) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_state WHERE entity_kind = ? AND entity_id = ?")
            .bind(entity.kind.as_str())
            .bind(entity.id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use brainsync_core::{render_entity, SyncEngine, SyncSettings};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct TestContext {
        _temp_dir: TempDir,
        vault: PathBuf,
        store: SqliteStore,
    }

    async fn setup_store() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let vault = temp_dir.path().join("vault");
        std::fs::create_dir_all(&vault).unwrap();
        TestContext {
            _temp_dir: temp_dir,
            vault,
            store: SqliteStore::new(pool),
        }
    }

    /// Inserts a row the way the surrounding application would.
    async fn insert(store: &SqliteStore, entity: &SyncEntity) {
        let sql = format!(
            "INSERT INTO {} (id, title, status, fields, notes, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            table(entity.kind)
        );
        sqlx::query(&sql)
            .bind(entity.id)
            .bind(&entity.title)
            .bind(&entity.status)
            .bind(serde_json::to_string(&entity.fields).unwrap())
            .bind(&entity.body_markdown)
            .bind(timestamp(entity.updated_at))
            .bind(timestamp(entity.updated_at))
            .execute(&store.pool)
            .await
            .unwrap();
    }

    fn sample_task(id: i64) -> SyncEntity {
        SyncEntity::new(EntityKind::Task, id, "Write report")
            .with_status("in_progress")
            .with_field(
                "due",
                FieldValue::Date(NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()),
            )
            .with_field("project", FieldValue::Integer(3))
            .with_field(
                "tags",
                FieldValue::List(vec!["writing".to_string(), "q4".to_string()]),
            )
            .with_notes("Outline first.")
    }

    fn state_for(entity: EntityRef, path: &str) -> SyncState {
        SyncState::synced(
            entity,
            path,
            ContentHash::of_text("file"),
            ContentHash::of_text("db"),
        )
    }

    #[tokio::test]
    async fn test_load_entity_round_trips_fields() {
        let ctx = setup_store().await;
        let task = sample_task(7);
        insert(&ctx.store, &task).await;

        let loaded = ctx.store.load_entity(task.entity_ref()).await.unwrap().unwrap();
        assert_eq!(loaded, task);

        let missing = EntityRef::new(EntityKind::Task, 8);
        assert!(ctx.store.load_entity(missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_entities_by_kind() {
        let ctx = setup_store().await;
        insert(&ctx.store, &SyncEntity::new(EntityKind::Task, 2, "b")).await;
        insert(&ctx.store, &SyncEntity::new(EntityKind::Task, 1, "a")).await;
        insert(&ctx.store, &SyncEntity::new(EntityKind::Area, 1, "home")).await;

        let tasks = ctx.store.list_entities(EntityKind::Task).await.unwrap();
        assert_eq!(
            tasks,
            vec![
                EntityRef::new(EntityKind::Task, 1),
                EntityRef::new(EntityKind::Task, 2)
            ]
        );
        let projects = ctx.store.list_entities(EntityKind::Project).await.unwrap();
        assert!(projects.is_empty());
    }

    #[tokio::test]
    async fn test_apply_pull_writes_entity_and_state() {
        let ctx = setup_store().await;
        let task = sample_task(1);
        insert(&ctx.store, &task).await;

        let mut pulled = task.clone();
        pulled.title = "Write final report".to_string();
        pulled.updated_at = Utc::now();
        let state = state_for(task.entity_ref(), "tasks/task-1.md");

        ctx.store
            .apply_pull(&pulled, task.updated_at, &state)
            .await
            .unwrap();

        let loaded = ctx.store.load_entity(task.entity_ref()).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Write final report");
        let stored = ctx.store.load_state(task.entity_ref()).await.unwrap().unwrap();
        assert_eq!(stored, state);
    }

    #[tokio::test]
    async fn test_apply_pull_rejects_stale_entity() {
        let ctx = setup_store().await;
        let task = sample_task(1);
        insert(&ctx.store, &task).await;

        let mut pulled = task.clone();
        pulled.title = "Lost update".to_string();
        let stale = task.updated_at - chrono::Duration::seconds(5);
        let result = ctx
            .store
            .apply_pull(&pulled, stale, &state_for(task.entity_ref(), "tasks/task-1.md"))
            .await;

        assert!(matches!(result, Err(StoreError::Stale(_))));
        let loaded = ctx.store.load_entity(task.entity_ref()).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Write report");
        assert!(ctx.store.load_state(task.entity_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_pull_missing_entity() {
        let ctx = setup_store().await;
        let task = sample_task(9);
        let result = ctx
            .store
            .apply_pull(&task, task.updated_at, &state_for(task.entity_ref(), "tasks/task-9.md"))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_from_file_keeps_free_id() {
        let ctx = setup_store().await;
        let draft = SyncEntity::new(EntityKind::Project, 12, "Garden");
        let state = SyncState::unlinked(draft.entity_ref(), "projects/garden.md");

        let created = ctx.store.create_from_file(&draft, &state).await.unwrap();
        assert_eq!(created, EntityRef::new(EntityKind::Project, 12));
        let stored = ctx.store.load_state(created).await.unwrap().unwrap();
        assert_eq!(stored.file_path, PathBuf::from("projects/garden.md"));
    }

    #[tokio::test]
    async fn test_create_from_file_allocates_when_id_taken() {
        let ctx = setup_store().await;
        insert(&ctx.store, &SyncEntity::new(EntityKind::Task, 4, "Taken")).await;

        let draft = SyncEntity::new(EntityKind::Task, 4, "Copy");
        let state = SyncState::unlinked(draft.entity_ref(), "tasks/copy.md");
        let created = ctx.store.create_from_file(&draft, &state).await.unwrap();

        assert_eq!(created, EntityRef::new(EntityKind::Task, 5));
        let original = ctx.store.load_entity(EntityRef::new(EntityKind::Task, 4)).await;
        assert_eq!(original.unwrap().unwrap().title, "Taken");
        let stored = ctx.store.load_state(created).await.unwrap().unwrap();
        assert_eq!(stored.entity, created);
    }

    #[tokio::test]
    async fn test_find_state_by_path() {
        let ctx = setup_store().await;
        let entity = EntityRef::new(EntityKind::Area, 2);
        let mut state = state_for(entity, "areas/health.md");
        state.conflict_flag = true;
        state.conflict_artifact = Some(PathBuf::from("areas/health.md.conflict-20261018T090000Z"));
        ctx.store.save_state(&state).await.unwrap();

        let found = ctx
            .store
            .find_state_by_path(Path::new("areas/health.md"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, state);
        assert!(ctx
            .store
            .find_state_by_path(Path::new("areas/other.md"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_save_state_replaces_row() {
        let ctx = setup_store().await;
        let entity = EntityRef::new(EntityKind::Task, 1);
        ctx.store
            .save_state(&SyncState::unlinked(entity, "tasks/task-1.md"))
            .await
            .unwrap();
        ctx.store
            .save_state(&state_for(entity, "tasks/renamed.md"))
            .await
            .unwrap();

        let states = ctx.store.list_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].file_path, PathBuf::from("tasks/renamed.md"));
        assert!(states[0].is_linked());
    }

    #[tokio::test]
    async fn test_delete_entity_removes_state() {
        let ctx = setup_store().await;
        let task = sample_task(3);
        insert(&ctx.store, &task).await;
        ctx.store
            .save_state(&state_for(task.entity_ref(), "tasks/task-3.md"))
            .await
            .unwrap();

        ctx.store.delete_entity(task.entity_ref()).await.unwrap();

        assert!(ctx.store.load_entity(task.entity_ref()).await.unwrap().is_none());
        assert!(ctx.store.load_state(task.entity_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engine_over_sqlite_pushes_then_pulls() {
        let ctx = setup_store().await;
        let task = sample_task(42);
        insert(&ctx.store, &task).await;
        let TestContext {
            _temp_dir,
            vault,
            store,
        } = ctx;
        let store = Arc::new(store);
        let engine = SyncEngine::new(
            Arc::clone(&store),
            SyncSettings::new(&vault),
            CancellationToken::new(),
        )
        .unwrap();

        let summary = engine.trigger_sync(task.entity_ref()).await;
        assert_eq!(summary.pushed, 1);
        let path = vault.join("tasks/task-42.md");
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, render_entity(&task, &[]));

        std::fs::write(&path, written.replace("Outline first.", "Outline first.\nThen draft.")).unwrap();
        let summary = engine.trigger_sync(task.entity_ref()).await;
        assert_eq!(summary.pulled, 1);

        let loaded = store.load_entity(task.entity_ref()).await.unwrap().unwrap();
        assert_eq!(loaded.body_markdown, "Outline first.\nThen draft.");
        let summary = engine.trigger_sync(task.entity_ref()).await;
        assert_eq!(summary.unchanged, 1);
    }
}
