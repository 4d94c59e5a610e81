mod entity;
mod field;
mod kind;
pub mod schema;

pub use entity::{EntityRef, SyncEntity};
pub use field::FieldValue;
pub use kind::EntityKind;
pub use schema::{FieldSpec, FieldType, NOTES_FIELD};
