use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::field::FieldValue;
use super::kind::EntityKind;

/// Identifies one syncable entity, rendered as `task#42`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('#')
            .ok_or_else(|| format!("Invalid entity reference '{}'. Expected <kind>#<id>", s))?;
        let kind = kind.parse::<EntityKind>()?;
        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("Invalid entity id '{}' in '{}'", id, s))?;
        Ok(Self { kind, id })
    }
}

/// Database-side view of a project, task or area.
///
/// The sync engine treats this as a plain transfer object: the store loads it,
/// the engine compares and rewrites it, the store persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntity {
    pub kind: EntityKind,
    pub id: i64,
    pub title: String,
    pub status: String,
    /// Kind-specific structured fields (`due`, `project`, `tags`, ...).
    /// Absent keys mean "no value"; `Null` is never stored.
    pub fields: BTreeMap<String, FieldValue>,
    pub body_markdown: String,
    pub updated_at: DateTime<Utc>,
}

impl SyncEntity {
    pub fn new(kind: EntityKind, id: i64, title: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            title: title.into(),
            status: kind.default_status().to_string(),
            fields: BTreeMap::new(),
            body_markdown: String::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        let name = name.into();
        if value.is_null() {
            self.fields.remove(&name);
        } else {
            self.fields.insert(name, value);
        }
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.body_markdown = notes.into();
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

impl fmt::Display for SyncEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [{}]", self.title, self.entity_ref())?;
        writeln!(f, "Status: {}", self.status)?;
        for (name, value) in &self.fields {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ref_display_and_parse() {
        let r = EntityRef::new(EntityKind::Task, 42);
        assert_eq!(r.to_string(), "task#42");
        assert_eq!("task#42".parse::<EntityRef>().unwrap(), r);
        assert_eq!(
            "Project#7".parse::<EntityRef>().unwrap(),
            EntityRef::new(EntityKind::Project, 7)
        );
    }

    #[test]
    fn test_entity_ref_parse_invalid() {
        assert!("task42".parse::<EntityRef>().is_err());
        assert!("task#abc".parse::<EntityRef>().is_err());
        assert!("goal#1".parse::<EntityRef>().is_err());
    }

    #[test]
    fn test_new_entity_uses_default_status() {
        let entity = SyncEntity::new(EntityKind::Task, 1, "Write report");
        assert_eq!(entity.status, "todo");
        assert!(entity.fields.is_empty());
        assert!(entity.body_markdown.is_empty());
    }

    #[test]
    fn test_with_field_null_removes() {
        let entity = SyncEntity::new(EntityKind::Task, 1, "x")
            .with_field("priority", FieldValue::text("high"))
            .with_field("priority", FieldValue::Null);
        assert!(entity.field("priority").is_none());
    }
}
