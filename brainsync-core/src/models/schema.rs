//! Per-kind field schema shared by the parser, the writer and the engine.
//!
//! Every kind owns `id`, `kind`, `title` and `status` plus a few structured
//! fields. The free-text notes live in the `## Notes` section of a document and
//! in `body_markdown` on the entity.

use chrono::NaiveDate;
use serde_yaml::Value;
use std::collections::BTreeMap;

use super::entity::SyncEntity;
use super::field::FieldValue;
use super::kind::EntityKind;

/// Name of the recognized section that maps to `body_markdown`.
pub const NOTES_FIELD: &str = "notes";

const KIND_NAMES: &[&str] = &["area", "project", "task"];
const PRIORITIES: &[&str] = &["low", "medium", "high"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Text,
    Date,
    List,
    /// Text restricted to a fixed set of values.
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
}

impl FieldSpec {
    const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type }
    }

    /// Identity fields describe which entity a file belongs to; they are
    /// never applied to an entity on pull.
    pub fn is_identity(&self) -> bool {
        matches!(self.name, "id" | "kind")
    }
}

const AREA_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", FieldType::Integer),
    FieldSpec::new("kind", FieldType::Choice(KIND_NAMES)),
    FieldSpec::new("title", FieldType::Text),
    FieldSpec::new("status", FieldType::Choice(&["active", "archived"])),
    FieldSpec::new("tags", FieldType::List),
];

const PROJECT_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", FieldType::Integer),
    FieldSpec::new("kind", FieldType::Choice(KIND_NAMES)),
    FieldSpec::new("title", FieldType::Text),
    FieldSpec::new(
        "status",
        FieldType::Choice(&["active", "on_hold", "completed", "archived"]),
    ),
    FieldSpec::new("area", FieldType::Integer),
    FieldSpec::new("deadline", FieldType::Date),
    FieldSpec::new("tags", FieldType::List),
];

const TASK_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", FieldType::Integer),
    FieldSpec::new("kind", FieldType::Choice(KIND_NAMES)),
    FieldSpec::new("title", FieldType::Text),
    FieldSpec::new(
        "status",
        FieldType::Choice(&["todo", "in_progress", "waiting", "done", "cancelled"]),
    ),
    FieldSpec::new("project", FieldType::Integer),
    FieldSpec::new("due", FieldType::Date),
    FieldSpec::new("priority", FieldType::Choice(PRIORITIES)),
    FieldSpec::new("tags", FieldType::List),
];

/// Header fields of a kind, in the order the writer renders them.
pub fn fields_for(kind: EntityKind) -> &'static [FieldSpec] {
    match kind {
        EntityKind::Area => AREA_FIELDS,
        EntityKind::Project => PROJECT_FIELDS,
        EntityKind::Task => TASK_FIELDS,
    }
}

pub fn spec_for(kind: EntityKind, name: &str) -> Option<&'static FieldSpec> {
    fields_for(kind).iter().find(|spec| spec.name == name)
}

/// Kind-specific fields: everything in the header except identity, title and status.
fn structured_fields(kind: EntityKind) -> impl Iterator<Item = &'static FieldSpec> {
    fields_for(kind)
        .iter()
        .filter(|spec| !spec.is_identity() && spec.name != "title" && spec.name != "status")
}

impl FieldType {
    /// Decodes the YAML source of a header value.
    ///
    /// Text and list fields keep the source spelling of plain numbers and
    /// booleans, so `1.10` stays `1.10` instead of becoming `1.1`.
    pub fn decode_source(&self, source: &str) -> Result<FieldValue, String> {
        if source.trim().is_empty() {
            return Ok(FieldValue::Null);
        }
        let value = serde_yaml::from_str::<Value>(source).map_err(|e| e.to_string())?;
        let value = match self {
            FieldType::Text | FieldType::List => keep_source_spelling(value, source),
            _ => value,
        };
        self.decode(&value)
    }

    /// Decodes a YAML scalar (or flow list) into a typed value.
    ///
    /// `Null` always decodes to `FieldValue::Null`; a value of the wrong shape
    /// returns a message suitable for a parse warning.
    pub fn decode(&self, value: &Value) -> Result<FieldValue, String> {
        if value.is_null() {
            return Ok(FieldValue::Null);
        }
        match self {
            FieldType::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .map(FieldValue::Integer)
                    .ok_or_else(|| format!("expected an integer, got {}", n)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(FieldValue::Integer)
                    .map_err(|_| format!("expected an integer, got '{}'", s)),
                other => Err(format!("expected an integer, got {}", describe(other))),
            },
            FieldType::Text => scalar_text(value)
                .map(FieldValue::Text)
                .ok_or_else(|| format!("expected text, got {}", describe(value))),
            FieldType::Date => {
                let text = scalar_text(value)
                    .ok_or_else(|| format!("expected a date, got {}", describe(value)))?;
                NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                    .map(FieldValue::Date)
                    .map_err(|_| format!("expected a YYYY-MM-DD date, got '{}'", text))
            }
            FieldType::List => match value {
                Value::Sequence(items) => items
                    .iter()
                    .map(|item| {
                        scalar_text(item)
                            .ok_or_else(|| format!("expected list items to be text, got {}", describe(item)))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(FieldValue::List),
                other => scalar_text(other)
                    .map(|s| FieldValue::List(vec![s]))
                    .ok_or_else(|| format!("expected a list, got {}", describe(other))),
            },
            FieldType::Choice(allowed) => {
                let text = scalar_text(value)
                    .ok_or_else(|| format!("expected one of {}, got {}", allowed.join("|"), describe(value)))?;
                let normalized = text.trim().to_lowercase();
                if allowed.contains(&normalized.as_str()) {
                    Ok(FieldValue::Text(normalized))
                } else {
                    Err(format!(
                        "'{}' is not one of {}",
                        text,
                        allowed.join("|")
                    ))
                }
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_literal(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::Bool(_))
}

/// Replaces numbers and booleans with their source text. Lists whose items
/// cannot be lined up with the source are left as YAML read them.
fn keep_source_spelling(value: Value, source: &str) -> Value {
    match value {
        value if is_literal(&value) => Value::String(plain_text(source.trim())),
        Value::Sequence(items) if items.iter().any(is_literal) => {
            match source_items(source.trim()) {
                Some(raw) if raw.len() == items.len() => Value::Sequence(
                    items
                        .into_iter()
                        .zip(raw)
                        .map(|(item, raw)| {
                            if is_literal(&item) {
                                Value::String(plain_text(raw))
                            } else {
                                item
                            }
                        })
                        .collect(),
                ),
                _ => Value::Sequence(items),
            }
        }
        other => other,
    }
}

/// A plain scalar's text without a trailing comment.
fn plain_text(raw: &str) -> String {
    raw.split(" #").next().unwrap_or(raw).trim().to_string()
}

/// Source text of each item of a flow (`[a, b]`) or block (`- a`) list.
fn source_items(source: &str) -> Option<Vec<&str>> {
    if let Some(inner) = source.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return Some(split_flow(inner));
    }
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            (line == "-" || line.starts_with("- ")).then(|| line[1..].trim())
        })
        .collect()
}

/// Splits flow list items at commas outside quotes and nested brackets.
fn split_flow(inner: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '{') => depth += 1,
            (None, ']' | '}') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                items.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = inner[start..].trim();
    if !last.is_empty() {
        items.push(last);
    }
    items
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "text",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Fields an entity contributes to its markdown document.
///
/// Null structured fields and empty notes are left out so a fresh entity
/// renders a minimal file.
pub fn document_fields(entity: &SyncEntity) -> BTreeMap<String, FieldValue> {
    let mut fields = BTreeMap::new();
    fields.insert("id".to_string(), FieldValue::Integer(entity.id));
    fields.insert("kind".to_string(), FieldValue::text(entity.kind.as_str()));
    fields.insert("title".to_string(), FieldValue::text(entity.title.clone()));
    fields.insert("status".to_string(), FieldValue::text(entity.status.clone()));
    for spec in structured_fields(entity.kind) {
        if let Some(value) = entity.fields.get(spec.name) {
            if !value.is_null() {
                fields.insert(spec.name.to_string(), value.clone());
            }
        }
    }
    if !entity.body_markdown.trim().is_empty() {
        fields.insert(
            NOTES_FIELD.to_string(),
            FieldValue::text(entity.body_markdown.trim().to_string()),
        );
    }
    fields
}

/// Applies recognized document fields onto an entity.
///
/// Missing fields fall back to the kind's defaults: empty title, the default
/// status, no structured value, empty notes. Identity fields are ignored.
pub fn apply_fields(entity: &mut SyncEntity, fields: &BTreeMap<String, FieldValue>) {
    entity.title = fields
        .get("title")
        .and_then(FieldValue::as_text)
        .unwrap_or_default()
        .to_string();
    entity.status = fields
        .get("status")
        .and_then(FieldValue::as_text)
        .unwrap_or(entity.kind.default_status())
        .to_string();
    for spec in structured_fields(entity.kind) {
        match fields.get(spec.name) {
            Some(value) if !value.is_null() => {
                entity.fields.insert(spec.name.to_string(), value.clone());
            }
            _ => {
                entity.fields.remove(spec.name);
            }
        }
    }
    entity.body_markdown = fields
        .get(NOTES_FIELD)
        .and_then(FieldValue::as_text)
        .map(|notes| notes.trim().to_string())
        .unwrap_or_default();
}

/// The subset of an entity that participates in sync, in canonical form.
///
/// Unknown or null structured fields and surrounding whitespace in the notes
/// do not count as a change.
pub fn syncable_fields(entity: &SyncEntity) -> BTreeMap<String, FieldValue> {
    let mut fields = document_fields(entity);
    fields.remove("id");
    fields.remove("kind");
    fields
        .entry(NOTES_FIELD.to_string())
        .or_insert_with(|| FieldValue::text(""));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_decode_integer() {
        assert_eq!(FieldType::Integer.decode(&yaml("42")), Ok(FieldValue::Integer(42)));
        assert_eq!(FieldType::Integer.decode(&yaml("'42'")), Ok(FieldValue::Integer(42)));
        assert!(FieldType::Integer.decode(&yaml("forty")).is_err());
    }

    #[test]
    fn test_decode_date() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();
        assert_eq!(FieldType::Date.decode(&yaml("2026-10-20")), Ok(FieldValue::Date(date)));
        assert!(FieldType::Date.decode(&yaml("next tuesday")).is_err());
    }

    #[test]
    fn test_decode_list() {
        assert_eq!(
            FieldType::List.decode(&yaml("[a, b]")),
            Ok(FieldValue::List(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            FieldType::List.decode(&yaml("solo")),
            Ok(FieldValue::List(vec!["solo".into()]))
        );
        assert!(FieldType::List.decode(&yaml("{a: 1}")).is_err());
    }

    #[test]
    fn test_decode_source_keeps_number_spelling() {
        assert_eq!(FieldType::Text.decode_source("1.10"), Ok(FieldValue::text("1.10")));
        assert_eq!(FieldType::Text.decode_source("'1.10'"), Ok(FieldValue::text("1.10")));
        assert_eq!(
            FieldType::List.decode_source("[007, \"a, b\", 2.50]"),
            Ok(FieldValue::List(vec!["007".into(), "a, b".into(), "2.50".into()]))
        );
        assert_eq!(FieldType::Integer.decode_source("0012"), Ok(FieldValue::Integer(12)));
        assert_eq!(FieldType::Date.decode_source(""), Ok(FieldValue::Null));
    }

    #[test]
    fn test_decode_choice() {
        let status = spec_for(EntityKind::Task, "status").unwrap();
        assert_eq!(status.field_type.decode(&yaml("Done")), Ok(FieldValue::text("done")));
        assert!(status.field_type.decode(&yaml("finished")).is_err());
    }

    #[test]
    fn test_decode_null_is_null() {
        assert_eq!(FieldType::Date.decode(&Value::Null), Ok(FieldValue::Null));
    }

    #[test]
    fn test_document_fields_skip_empty() {
        let entity = SyncEntity::new(EntityKind::Task, 42, "Draft");
        let fields = document_fields(&entity);
        assert_eq!(fields.get("id"), Some(&FieldValue::Integer(42)));
        assert_eq!(fields.get("kind"), Some(&FieldValue::text("task")));
        assert!(!fields.contains_key(NOTES_FIELD));
        assert!(!fields.contains_key("due"));
    }

    #[test]
    fn test_apply_fields_defaults_missing() {
        let mut entity = SyncEntity::new(EntityKind::Task, 1, "Old")
            .with_status("done")
            .with_field("priority", FieldValue::text("high"))
            .with_notes("old notes");
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), FieldValue::text("New"));
        fields.insert("id".to_string(), FieldValue::Integer(999));

        apply_fields(&mut entity, &fields);

        assert_eq!(entity.id, 1);
        assert_eq!(entity.title, "New");
        assert_eq!(entity.status, "todo");
        assert!(entity.field("priority").is_none());
        assert!(entity.body_markdown.is_empty());
    }

    #[test]
    fn test_apply_document_fields_is_identity() {
        let entity = SyncEntity::new(EntityKind::Project, 3, "Launch")
            .with_status("on_hold")
            .with_field("area", FieldValue::Integer(1))
            .with_field("tags", FieldValue::List(vec!["q4".into()]))
            .with_notes("Kickoff next week");
        let mut copy = entity.clone();
        apply_fields(&mut copy, &document_fields(&entity));
        assert_eq!(copy, entity);
    }

    #[test]
    fn test_syncable_fields_ignore_unknown_and_identity() {
        let a = SyncEntity::new(EntityKind::Area, 1, "Health");
        let b = a.clone().with_field("color", FieldValue::text("red"));
        assert_eq!(syncable_fields(&a), syncable_fields(&b));
        assert!(!syncable_fields(&a).contains_key("id"));
        assert_eq!(syncable_fields(&a).get(NOTES_FIELD), Some(&FieldValue::text("")));
    }
}
