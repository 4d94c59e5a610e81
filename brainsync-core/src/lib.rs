//! Brainsync Core Library
//!
//! Bidirectional sync between database entities and a vault of markdown files.

pub mod document;
pub mod engine;
pub mod error;
pub mod models;
pub mod service;
pub mod settings;
pub mod store;
pub mod watcher;

pub use document::{
    entity_hash, parse, render, render_entity, render_over, BlockAnchor, ContentHash, DocumentParser,
    DocumentWriter, ParseWarning, ParsedDocument, PreservedBlock,
};
pub use engine::{
    EntityStatus, Resolution, SyncOperation, SyncOutcome, SyncStatus, SyncEngine, SyncSummary,
};
pub use error::{SyncError, WatchError};
pub use models::{EntityKind, EntityRef, FieldValue, SyncEntity};
pub use service::{SyncHandle, SyncService};
pub use settings::{ConflictPolicy, DeletionPolicy, RetryPolicy, SyncSettings};
pub use store::{MemoryStore, StoreError, SyncState, SyncStore};
pub use watcher::{ChangeEvent, ChangeKind, FileWatcher, WatchConfig, WatchEvent};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
