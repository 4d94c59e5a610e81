//! The reconciliation engine.
//!
//! One reconciliation inspects an entity/file pair, classifies it against the
//! hashes recorded at the last successful sync, and then pushes, pulls, links,
//! flags a conflict or propagates a deletion. Reconciliations of the same key
//! are serialized; different keys run concurrently up to `max_workers`.

mod classify;
mod fs;
mod locks;
pub mod paths;
mod retry;
mod summary;

pub use classify::{
    classify, plan_operation, PairFacts, SyncDirection, SyncOperation, SyncReason, SyncStatus,
};
pub use fs::conflict_artifact_path;
pub use summary::{SyncFailure, SyncOutcome, SyncSummary};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::document::{
    entity_hash, render_entity, render_over, ContentHash, DocumentParser, ParsedDocument,
};
use crate::error::{SyncError, WatchError};
use crate::models::{schema, EntityRef, SyncEntity};
use crate::settings::SyncSettings;
use crate::store::{SyncState, SyncStore};
use crate::watcher::{ChangeEvent, ChangeKind, PathFilter};
use locks::{KeyedLocks, SyncKey};
use retry::retry_io;

/// The side that wins an explicit conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepDatabase,
    KeepFile,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepDatabase => write!(f, "database"),
            Resolution::KeepFile => write!(f, "file"),
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "database" | "db" | "keep_database" => Ok(Resolution::KeepDatabase),
            "file" | "keep_file" => Ok(Resolution::KeepFile),
            _ => Err(format!(
                "Invalid resolution '{}'. Use database or file.",
                s
            )),
        }
    }
}

/// Read-only view of one pair, as reported by [`SyncEngine::status`].
#[derive(Debug, Clone, Serialize)]
pub struct EntityStatus {
    pub entity: EntityRef,
    pub status: SyncStatus,
    pub file_path: PathBuf,
    pub entity_exists: bool,
    pub file_exists: bool,
    pub state: Option<SyncState>,
}

struct FileSnapshot {
    bytes: Vec<u8>,
    doc: ParsedDocument,
    decodable: bool,
    modified: Option<DateTime<Utc>>,
}

/// Everything one reconciliation reads before deciding.
struct Inspection {
    entity_ref: EntityRef,
    rel_path: PathBuf,
    abs_path: PathBuf,
    state: Option<SyncState>,
    entity: Option<SyncEntity>,
    db_hash: Option<ContentHash>,
    file: Option<FileSnapshot>,
    status: SyncStatus,
}

impl Inspection {
    fn file_hash(&self) -> Option<&ContentHash> {
        self.file.as_ref().map(|f| &f.doc.content_hash)
    }

    fn conflict_flagged(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.conflict_flag)
    }

    /// The entity as it would be after pulling the file.
    fn pulled_entity(&self) -> Option<SyncEntity> {
        let entity = self.entity.as_ref()?;
        let file = self.file.as_ref()?;
        let mut pulled = entity.clone();
        schema::apply_fields(&mut pulled, &file.doc.recognized_fields);
        Some(pulled)
    }

    fn facts(&self) -> PairFacts {
        let converged = self
            .pulled_entity()
            .is_some_and(|pulled| Some(entity_hash(&pulled)) == self.db_hash);
        let modified = self.file.as_ref().and_then(|f| f.modified);
        let file_newer = match (&self.entity, modified) {
            (Some(entity), Some(modified)) => modified > entity.updated_at,
            (None, Some(_)) => true,
            _ => false,
        };
        PairFacts {
            entity_exists: self.entity.is_some(),
            file_exists: self.file.is_some(),
            converged,
            file_newer,
            conflict_flagged: self.conflict_flagged(),
        }
    }
}

enum PathOwner {
    Entity(EntityRef),
    NewFile,
    Ignored,
}

enum Target {
    Entity {
        entity: EntityRef,
        hint: Option<PathBuf>,
    },
    NewFile(PathBuf),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Entity { entity, .. } => write!(f, "{}", entity),
            Target::NewFile(path) => write!(f, "{}", path.display()),
        }
    }
}

pub struct SyncEngine<S> {
    store: Arc<S>,
    settings: Arc<SyncSettings>,
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    filter: PathFilter,
    locks: KeyedLocks,
    workers: Semaphore,
    cancel: CancellationToken,
}

impl<S: SyncStore> SyncEngine<S> {
    /// Builds an engine over `store`. Fails only on invalid ignore patterns.
    pub fn new(
        store: Arc<S>,
        settings: SyncSettings,
        cancel: CancellationToken,
    ) -> Result<Self, WatchError> {
        let root = settings.vault_root.clone();
        let filter = PathFilter::new(&root, &settings.watch)?;
        let canonical_root = root.canonicalize().ok();
        let workers = Semaphore::new(settings.max_workers.max(1));
        Ok(Self {
            store,
            settings: Arc::new(settings),
            root,
            canonical_root,
            filter,
            locks: KeyedLocks::new(),
            workers,
            cancel,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reconciles one entity now.
    pub async fn trigger_sync(&self, entity: EntityRef) -> SyncSummary {
        let result = self.reconcile(entity).await;
        let mut summary = SyncSummary::new();
        summary.record(entity, &result);
        summary
    }

    pub async fn reconcile(&self, entity: EntityRef) -> Result<SyncOutcome, SyncError> {
        self.sync_entity(entity, None, None, None).await
    }

    /// Reconciles every entity of an enabled kind, every state row and every
    /// file under the root that nothing links yet.
    pub async fn trigger_full_scan(&self) -> SyncSummary {
        let mut summary = SyncSummary::new();
        let targets = match self.scan_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                error!(error = %e, "Full scan failed");
                summary.record("full scan", &Err(e));
                return summary;
            }
        };
        info!(targets = targets.len(), "Starting full scan");

        let results: Vec<(String, Result<SyncOutcome, SyncError>)> = stream::iter(targets)
            .map(|target| async move {
                let label = target.to_string();
                let result = match target {
                    Target::Entity { entity, hint } => {
                        self.sync_entity(entity, hint, None, None).await
                    }
                    Target::NewFile(path) => self.import_file(path).await,
                };
                (label, result)
            })
            .buffer_unordered(self.settings.max_workers.max(1))
            .collect()
            .await;

        for (label, result) in &results {
            summary.record(label, result);
        }
        info!(%summary, "Full scan finished");
        summary
    }

    /// Reconciles whatever owns the path of a debounced change.
    pub async fn handle_change(&self, event: &ChangeEvent) -> SyncSummary {
        let mut summary = SyncSummary::new();
        let Some(rel) = self.relative(&event.path) else {
            debug!(path = %event.path.display(), "Change outside the vault root, ignoring");
            return summary;
        };

        let result = match &event.kind {
            ChangeKind::Renamed { from } => match self.relative(from) {
                Some(from) => self.relocate(from, rel.clone()).await,
                None => self.sync_path(rel.clone()).await,
            },
            ChangeKind::Created | ChangeKind::Modified | ChangeKind::Deleted => {
                self.sync_path(rel.clone()).await
            }
        };
        match result {
            Ok(None) => debug!(path = %rel.display(), "Path not synced, ignoring"),
            Ok(Some(outcome)) => summary.record(rel.display(), &Ok(outcome)),
            Err(e) => summary.record(rel.display(), &Err(e)),
        }
        summary
    }

    /// Forces the chosen side onto a conflicted pair and clears the flag.
    pub async fn resolve_conflict(
        &self,
        entity: EntityRef,
        resolution: Resolution,
    ) -> Result<SyncOutcome, SyncError> {
        self.sync_entity(entity, None, Some(resolution), None).await
    }

    pub async fn status(&self, entity: EntityRef) -> Result<EntityStatus, SyncError> {
        let inspection = self.inspect(entity, None).await?;
        Ok(EntityStatus {
            entity,
            status: inspection.status,
            file_path: inspection.rel_path,
            entity_exists: inspection.entity.is_some(),
            file_exists: inspection.file.is_some(),
            state: inspection.state,
        })
    }

    /// What the next reconciliation of `entity` would do, without doing it.
    pub async fn plan(&self, entity: EntityRef) -> Result<SyncOperation, SyncError> {
        let inspection = self.inspect(entity, None).await?;
        Ok(self.operation_for(&inspection))
    }

    /// State rows currently flagged as conflicted.
    pub async fn conflicts(&self) -> Result<Vec<SyncState>, SyncError> {
        let states = self.store.list_states().await?;
        Ok(states.into_iter().filter(|s| s.conflict_flag).collect())
    }

    async fn sync_entity(
        &self,
        entity: EntityRef,
        hint: Option<PathBuf>,
        forced: Option<Resolution>,
        relocate_from: Option<PathBuf>,
    ) -> Result<SyncOutcome, SyncError> {
        if !self.settings.is_enabled(entity.kind) {
            return Err(SyncError::KindDisabled(entity.kind));
        }
        let _guard = self.locks.lock(SyncKey::Entity(entity)).await;
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        let result = async {
            if let (Some(from), Some(to)) = (&relocate_from, &hint) {
                self.relocate_state(entity, from, to).await?;
            }
            self.reconcile_locked(entity, hint.clone(), forced).await
        }
        .await;

        if let Err(e) = &result {
            error!(entity = %entity, error = %e, "Reconciliation failed");
            if e.is_flaggable() {
                self.flag_error(entity, hint, e).await;
            }
        }
        result
    }

    async fn reconcile_locked(
        &self,
        entity: EntityRef,
        hint: Option<PathBuf>,
        forced: Option<Resolution>,
    ) -> Result<SyncOutcome, SyncError> {
        let inspection = self.inspect(entity, hint).await?;
        let mut op = self.operation_for(&inspection);

        if let Some(resolution) = forced {
            if !inspection.conflict_flagged() && !op.is_conflict() {
                return Err(SyncError::NoConflict(entity));
            }
            let direction = match resolution {
                Resolution::KeepDatabase => SyncDirection::Push,
                Resolution::KeepFile => SyncDirection::Pull,
            };
            op = SyncOperation::new(entity, direction, SyncReason::Resolution);
            info!(entity = %entity, %resolution, "Resolving conflict");
        }

        debug!(
            entity = %entity,
            status = %inspection.status,
            operation = %op,
            "Classified"
        );
        self.execute(inspection, op).await
    }

    async fn inspect(
        &self,
        entity: EntityRef,
        hint: Option<PathBuf>,
    ) -> Result<Inspection, SyncError> {
        let state = self.store.load_state(entity).await?;
        let rel_path = state
            .as_ref()
            .map(|s| s.file_path.clone())
            .or(hint)
            .unwrap_or_else(|| paths::entity_path(entity));
        let abs_path = self.root.join(&rel_path);
        let record = self.store.load_entity(entity).await?;

        let bytes = retry_io(&self.settings.retry, &self.cancel, &abs_path, || {
            fs::read_optional(&abs_path)
        })
        .await?;
        let file = match bytes {
            Some(bytes) => {
                let decodable = std::str::from_utf8(&bytes).is_ok();
                let doc = DocumentParser::with_kind_hint(entity.kind).parse_bytes(&bytes);
                let modified = fs::modified_at(&abs_path).await;
                Some(FileSnapshot {
                    bytes,
                    doc,
                    decodable,
                    modified,
                })
            }
            None => None,
        };

        let db_hash = record.as_ref().map(entity_hash);
        let status = classify(
            state.as_ref(),
            file.as_ref().map(|f| &f.doc.content_hash),
            db_hash.as_ref(),
        );
        Ok(Inspection {
            entity_ref: entity,
            rel_path,
            abs_path,
            state,
            entity: record,
            db_hash,
            file,
            status,
        })
    }

    fn operation_for(&self, inspection: &Inspection) -> SyncOperation {
        plan_operation(
            inspection.entity_ref,
            inspection.status,
            inspection.facts(),
            self.settings.conflict_policy,
            self.settings.deletion_policy,
        )
    }

    async fn execute(
        &self,
        inspection: Inspection,
        op: SyncOperation,
    ) -> Result<SyncOutcome, SyncError> {
        match op.direction {
            SyncDirection::None => match op.reason {
                SyncReason::Converged => self.link(&inspection).await,
                SyncReason::BothDeleted => {
                    self.store.delete_state(inspection.entity_ref).await?;
                    info!(entity = %inspection.entity_ref, "Both sides gone, dropped sync state");
                    Ok(SyncOutcome::Unchanged)
                }
                SyncReason::Missing => Err(SyncError::NotFound(inspection.entity_ref)),
                SyncReason::BothChanged
                | SyncReason::FirstAssociation
                | SyncReason::ConflictPending => self.flag_conflict(&inspection).await,
                _ => self.clear_flags(inspection).await,
            },
            SyncDirection::Push => match inspection.entity {
                Some(_) => self.push(&inspection).await,
                None => self.remove_file(&inspection).await,
            },
            SyncDirection::Pull => match (&inspection.file, &inspection.entity) {
                (Some(_), Some(_)) => self.pull(&inspection).await,
                (Some(_), None) => self.create_entity(&inspection).await,
                (None, _) => self.delete_entity(&inspection).await,
            },
        }
    }

    /// Records a pair that already agrees; nothing is written.
    async fn link(&self, inspection: &Inspection) -> Result<SyncOutcome, SyncError> {
        let (Some(file_hash), Some(db_hash)) = (inspection.file_hash(), &inspection.db_hash)
        else {
            return Err(SyncError::NotFound(inspection.entity_ref));
        };
        let state = SyncState::synced(
            inspection.entity_ref,
            &inspection.rel_path,
            file_hash.clone(),
            db_hash.clone(),
        );
        self.store.save_state(&state).await?;
        info!(
            entity = %inspection.entity_ref,
            path = %inspection.rel_path.display(),
            "Linked"
        );
        Ok(SyncOutcome::Linked)
    }

    async fn clear_flags(&self, inspection: Inspection) -> Result<SyncOutcome, SyncError> {
        if let Some(mut state) = inspection.state {
            if state.conflict_flag || state.sync_error.is_some() {
                state.conflict_flag = false;
                state.conflict_artifact = None;
                state.sync_error = None;
                self.store.save_state(&state).await?;
                debug!(entity = %inspection.entity_ref, "Cleared sync flags");
            }
        }
        Ok(SyncOutcome::Unchanged)
    }

    async fn flag_conflict(&self, inspection: &Inspection) -> Result<SyncOutcome, SyncError> {
        if inspection.conflict_flagged() {
            debug!(entity = %inspection.entity_ref, "Conflict still pending");
            return Ok(SyncOutcome::ConflictPending);
        }

        let artifact = match &inspection.file {
            Some(file) => {
                let rel = conflict_artifact_path(&inspection.rel_path, Utc::now());
                let abs = self.root.join(&rel);
                retry_io(&self.settings.retry, &self.cancel, &abs, || {
                    fs::write_atomic(&abs, &file.bytes)
                })
                .await?;
                Some(rel)
            }
            None => None,
        };

        let mut state = inspection
            .state
            .clone()
            .unwrap_or_else(|| SyncState::unlinked(inspection.entity_ref, &inspection.rel_path));
        state.file_path = inspection.rel_path.clone();
        state.conflict_flag = true;
        state.conflict_artifact = artifact.clone();
        self.store.save_state(&state).await?;

        warn!(
            entity = %inspection.entity_ref,
            path = %inspection.rel_path.display(),
            artifact = ?artifact,
            "Conflict: database and file both changed"
        );
        Ok(SyncOutcome::Conflicted { artifact })
    }

    async fn push(&self, inspection: &Inspection) -> Result<SyncOutcome, SyncError> {
        let Some(entity) = &inspection.entity else {
            return Err(SyncError::NotFound(inspection.entity_ref));
        };

        let text = match &inspection.file {
            Some(file) if file.decodable => render_over(entity, &file.doc),
            Some(file) => {
                // Undecodable content cannot be carried through, keep a copy.
                let rel = conflict_artifact_path(&inspection.rel_path, Utc::now());
                let abs = self.root.join(&rel);
                retry_io(&self.settings.retry, &self.cancel, &abs, || {
                    fs::write_atomic(&abs, &file.bytes)
                })
                .await?;
                warn!(
                    entity = %inspection.entity_ref,
                    artifact = %rel.display(),
                    "Overwriting a file that is not valid UTF-8, kept a copy"
                );
                render_entity(entity, &[])
            }
            None => render_entity(entity, &[]),
        };
        let file_hash = ContentHash::of_text(&text);
        let db_hash = entity_hash(entity);
        let changed = inspection.file_hash() != Some(&file_hash);
        if changed {
            let abs = &inspection.abs_path;
            retry_io(&self.settings.retry, &self.cancel, abs, || {
                fs::write_atomic(abs, text.as_bytes())
            })
            .await?;
        }

        let state = SyncState::synced(
            inspection.entity_ref,
            &inspection.rel_path,
            file_hash,
            db_hash,
        );
        self.store.save_state(&state).await?;

        if changed {
            info!(
                entity = %inspection.entity_ref,
                path = %inspection.rel_path.display(),
                "Pushed to file"
            );
            Ok(SyncOutcome::Pushed)
        } else {
            Ok(SyncOutcome::Linked)
        }
    }

    async fn pull(&self, inspection: &Inspection) -> Result<SyncOutcome, SyncError> {
        let (Some(entity), Some(file), Some(mut pulled)) = (
            &inspection.entity,
            &inspection.file,
            inspection.pulled_entity(),
        ) else {
            return Err(SyncError::NotFound(inspection.entity_ref));
        };
        self.log_warnings(&inspection.rel_path, &file.doc);

        let db_hash = entity_hash(&pulled);
        let state = SyncState::synced(
            inspection.entity_ref,
            &inspection.rel_path,
            file.doc.content_hash.clone(),
            db_hash.clone(),
        );

        if inspection.db_hash.as_ref() == Some(&db_hash) {
            self.store.save_state(&state).await?;
            debug!(
                entity = %inspection.entity_ref,
                "File changed outside synced fields, state updated"
            );
            return Ok(SyncOutcome::Linked);
        }

        pulled.updated_at = Utc::now();
        self.store
            .apply_pull(&pulled, entity.updated_at, &state)
            .await?;
        info!(
            entity = %inspection.entity_ref,
            path = %inspection.rel_path.display(),
            "Pulled from file"
        );
        Ok(SyncOutcome::Pulled)
    }

    async fn create_entity(&self, inspection: &Inspection) -> Result<SyncOutcome, SyncError> {
        let Some(file) = &inspection.file else {
            return Err(SyncError::NotFound(inspection.entity_ref));
        };
        self.log_warnings(&inspection.rel_path, &file.doc);

        let mut draft = SyncEntity::new(inspection.entity_ref.kind, inspection.entity_ref.id, "");
        schema::apply_fields(&mut draft, &file.doc.recognized_fields);
        let state = SyncState::synced(
            inspection.entity_ref,
            &inspection.rel_path,
            file.doc.content_hash.clone(),
            entity_hash(&draft),
        );
        let created = self.store.create_from_file(&draft, &state).await?;
        info!(
            entity = %created,
            path = %inspection.rel_path.display(),
            "Created entity from file"
        );
        Ok(SyncOutcome::Created { entity: created })
    }

    async fn remove_file(&self, inspection: &Inspection) -> Result<SyncOutcome, SyncError> {
        if inspection.file.is_some() {
            let abs = &inspection.abs_path;
            retry_io(&self.settings.retry, &self.cancel, abs, || {
                fs::remove_if_exists(abs)
            })
            .await?;
        }
        self.store.delete_state(inspection.entity_ref).await?;
        info!(
            entity = %inspection.entity_ref,
            path = %inspection.rel_path.display(),
            "Entity deleted, removed its file"
        );
        Ok(SyncOutcome::FileRemoved)
    }

    async fn delete_entity(&self, inspection: &Inspection) -> Result<SyncOutcome, SyncError> {
        self.store.delete_entity(inspection.entity_ref).await?;
        info!(
            entity = %inspection.entity_ref,
            path = %inspection.rel_path.display(),
            "File deleted, deleted its entity"
        );
        Ok(SyncOutcome::EntityDeleted)
    }

    /// Imports a file no entity owns yet.
    async fn import_file(&self, rel: PathBuf) -> Result<SyncOutcome, SyncError> {
        let _guard = self.locks.lock(SyncKey::Path(rel.clone())).await;
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        if self.store.find_state_by_path(&rel).await?.is_some() {
            return Ok(SyncOutcome::Unchanged);
        }
        let abs = self.root.join(&rel);
        let Some(bytes) = retry_io(&self.settings.retry, &self.cancel, &abs, || {
            fs::read_optional(&abs)
        })
        .await?
        else {
            return Ok(SyncOutcome::Unchanged);
        };

        let doc = DocumentParser::for_path(&rel).parse_bytes(&bytes);
        let Some(kind) = doc.kind.filter(|k| self.settings.is_enabled(*k)) else {
            debug!(path = %rel.display(), "No enabled kind for file, ignoring");
            return Ok(SyncOutcome::Unchanged);
        };
        self.log_warnings(&rel, &doc);

        let mut draft = SyncEntity::new(kind, doc.declared_id().unwrap_or(0), "");
        schema::apply_fields(&mut draft, &doc.recognized_fields);
        let state = SyncState::synced(
            EntityRef::new(kind, draft.id),
            &rel,
            doc.content_hash.clone(),
            entity_hash(&draft),
        );
        let created = self.store.create_from_file(&draft, &state).await?;
        info!(entity = %created, path = %rel.display(), "Created entity from new file");
        Ok(SyncOutcome::Created { entity: created })
    }

    async fn sync_path(&self, rel: PathBuf) -> Result<Option<SyncOutcome>, SyncError> {
        match self.resolve_path(&rel).await? {
            PathOwner::Entity(entity) => self
                .sync_entity(entity, Some(rel), None, None)
                .await
                .map(Some),
            PathOwner::NewFile => self.import_file(rel).await.map(Some),
            PathOwner::Ignored => Ok(None),
        }
    }

    async fn relocate(&self, from: PathBuf, to: PathBuf) -> Result<Option<SyncOutcome>, SyncError> {
        let Some(state) = self.store.find_state_by_path(&from).await? else {
            return self.sync_path(to).await;
        };
        if !self.settings.is_enabled(state.entity.kind)
            || !self.filter.accepts(&self.root.join(&to))
        {
            return Ok(None);
        }
        self.sync_entity(state.entity, Some(to), None, Some(from))
            .await
            .map(Some)
    }

    async fn relocate_state(
        &self,
        entity: EntityRef,
        from: &Path,
        to: &Path,
    ) -> Result<(), SyncError> {
        if let Some(mut state) = self.store.load_state(entity).await? {
            if state.file_path == from {
                state.file_path = to.to_path_buf();
                self.store.save_state(&state).await?;
                info!(
                    entity = %entity,
                    from = %from.display(),
                    to = %to.display(),
                    "File renamed, relocated sync state"
                );
            }
        }
        Ok(())
    }

    /// Finds the owner of a vault-relative path: a state row, then the path
    /// rule, then the header's `kind` and `id`.
    async fn resolve_path(&self, rel: &Path) -> Result<PathOwner, SyncError> {
        if !self.filter.accepts(&self.root.join(rel)) {
            return Ok(PathOwner::Ignored);
        }
        if let Some(state) = self.store.find_state_by_path(rel).await? {
            return Ok(self.owner(state.entity));
        }
        if let Some(entity) = paths::parse_entity_path(rel) {
            if self.store.load_state(entity).await?.is_none() {
                return Ok(self.owner(entity));
            }
        }

        let abs = self.root.join(rel);
        let Some(bytes) = retry_io(&self.settings.retry, &self.cancel, &abs, || {
            fs::read_optional(&abs)
        })
        .await?
        else {
            return Ok(PathOwner::Ignored);
        };
        let doc = DocumentParser::for_path(rel).parse_bytes(&bytes);
        let Some(kind) = doc.kind else {
            return Ok(PathOwner::Ignored);
        };
        if let Some(id) = doc.declared_id() {
            let entity = EntityRef::new(kind, id);
            if self.store.load_state(entity).await?.is_none()
                && self.store.load_entity(entity).await?.is_some()
            {
                return Ok(self.owner(entity));
            }
        }
        if self.settings.is_enabled(kind) {
            Ok(PathOwner::NewFile)
        } else {
            Ok(PathOwner::Ignored)
        }
    }

    fn owner(&self, entity: EntityRef) -> PathOwner {
        if self.settings.is_enabled(entity.kind) {
            PathOwner::Entity(entity)
        } else {
            PathOwner::Ignored
        }
    }

    async fn scan_targets(&self) -> Result<Vec<Target>, SyncError> {
        let states = self.store.list_states().await?;
        let linked: HashSet<&Path> = states.iter().map(|s| s.file_path.as_path()).collect();

        let mut entities: BTreeMap<EntityRef, Option<PathBuf>> = BTreeMap::new();
        for kind in &self.settings.kinds {
            for entity in self.store.list_entities(*kind).await? {
                entities.insert(entity, None);
            }
        }
        for state in &states {
            if self.settings.is_enabled(state.entity.kind) {
                entities.entry(state.entity).or_insert(None);
            }
        }

        let files = self.filter.scan_async().await.map_err(|source| SyncError::Filesystem {
            path: self.root.clone(),
            attempts: 1,
            source,
        })?;
        let mut new_files = Vec::new();
        for abs in files {
            let Some(rel) = self.relative(&abs) else {
                continue;
            };
            if linked.contains(rel.as_path()) {
                continue;
            }
            match self.resolve_path(&rel).await? {
                PathOwner::Entity(entity) => {
                    let hint = entities.entry(entity).or_insert(None);
                    if hint.is_none() {
                        *hint = Some(rel);
                    }
                }
                PathOwner::NewFile => new_files.push(rel),
                PathOwner::Ignored => {}
            }
        }

        let mut targets: Vec<Target> = entities
            .into_iter()
            .map(|(entity, hint)| Target::Entity { entity, hint })
            .collect();
        targets.extend(new_files.into_iter().map(Target::NewFile));
        Ok(targets)
    }

    /// Records an exhausted filesystem failure on the entity's state.
    async fn flag_error(&self, entity: EntityRef, hint: Option<PathBuf>, error: &SyncError) {
        let state = match self.store.load_state(entity).await {
            Ok(state) => state,
            Err(e) => {
                warn!(entity = %entity, error = %e, "Could not load state to flag sync error");
                return;
            }
        };
        let mut state = state.unwrap_or_else(|| {
            SyncState::unlinked(entity, hint.unwrap_or_else(|| paths::entity_path(entity)))
        });
        state.sync_error = Some(error.to_string());
        if let Err(e) = self.store.save_state(&state).await {
            warn!(entity = %entity, error = %e, "Could not flag sync error");
        }
    }

    fn log_warnings(&self, rel: &Path, doc: &ParsedDocument) {
        for warning in &doc.parse_warnings {
            warn!(path = %rel.display(), %warning, "Parse warning");
        }
    }

    /// Maps an event path onto a vault-relative one.
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        if path.is_relative() {
            return Some(path.to_path_buf());
        }
        path.strip_prefix(&self.root)
            .ok()
            .or_else(|| {
                self.canonical_root
                    .as_ref()
                    .and_then(|root| path.strip_prefix(root).ok())
            })
            .map(Path::to_path_buf)
    }
}
