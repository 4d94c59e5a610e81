use serde_yaml::Value;
use std::collections::BTreeMap;

use super::hash::normalize;
use super::parser::{is_fence, is_notes_end, is_section_heading};
use super::{BlockAnchor, ParsedDocument, PreservedBlock, NOTES_END};
use crate::models::{schema, EntityKind, FieldValue, SyncEntity, NOTES_FIELD};

/// Renders recognized fields and preserved blocks into canonical markdown.
///
/// Output is a pure function of the inputs, so rendering the same entity
/// twice yields byte-identical files and identical content hashes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentWriter;

pub fn render(fields: &BTreeMap<String, FieldValue>, preserved_blocks: &[PreservedBlock]) -> String {
    DocumentWriter.render(fields, preserved_blocks)
}

/// Renders an entity's document fields around existing preserved content.
pub fn render_entity(entity: &SyncEntity, preserved_blocks: &[PreservedBlock]) -> String {
    DocumentWriter.render(&schema::document_fields(entity), preserved_blocks)
}

/// Renders `entity` in place of `existing`, keeping its preserved blocks and
/// an empty notes heading the file already had.
pub fn render_over(entity: &SyncEntity, existing: &ParsedDocument) -> String {
    let mut fields = schema::document_fields(entity);
    if existing.recognized_fields.contains_key(NOTES_FIELD) {
        fields
            .entry(NOTES_FIELD.to_string())
            .or_insert_with(|| FieldValue::text(""));
    }
    DocumentWriter.render(&fields, &existing.preserved_blocks)
}

impl DocumentWriter {
    pub fn render(
        &self,
        fields: &BTreeMap<String, FieldValue>,
        preserved_blocks: &[PreservedBlock],
    ) -> String {
        let blocks_at = |anchor: BlockAnchor| {
            preserved_blocks
                .iter()
                .filter(move |b| b.anchor == anchor)
                .map(|b| b.text.as_str())
        };

        let mut header: Vec<String> = Vec::new();
        // Continuation-looking header blocks can only stand at the top.
        header.extend(
            blocks_at(BlockAnchor::Header)
                .filter(|t| is_continuation(t))
                .map(str::to_string),
        );
        let order: Vec<&str> = fields
            .get("kind")
            .and_then(FieldValue::as_text)
            .and_then(|k| k.parse::<EntityKind>().ok())
            .map(|kind| schema::fields_for(kind).iter().map(|s| s.name).collect())
            .unwrap_or_default();
        for name in &order {
            if let Some(value) = fields.get(*name) {
                header.push(encode_entry(name, value));
            }
        }
        for (name, value) in fields {
            if name != NOTES_FIELD && !order.contains(&name.as_str()) {
                header.push(encode_entry(name, value));
            }
        }
        header.extend(
            blocks_at(BlockAnchor::Header)
                .filter(|t| !is_continuation(t))
                .map(str::to_string),
        );

        let mut sections: Vec<String> = Vec::new();
        if !header.is_empty() {
            sections.push(format!("---\n{}\n---", header.join("\n")));
        }
        sections.extend(blocks_at(BlockAnchor::BeforeNotes).map(str::to_string));
        let notes = fields.get(NOTES_FIELD).map(FieldValue::to_string);
        let has_after = blocks_at(BlockAnchor::AfterNotes).next().is_some();
        match notes.as_deref().map(|n| n.trim_matches('\n')) {
            Some(notes) if !notes.trim().is_empty() => {
                if needs_end_marker(notes) {
                    sections.push(format!("## Notes\n\n{}\n\n{}", notes, NOTES_END));
                } else {
                    sections.push(format!("## Notes\n\n{}", notes));
                }
            }
            // Blocks that followed the notes keep their anchor only below a heading.
            Some(_) => sections.push("## Notes".to_string()),
            None if has_after => sections.push("## Notes".to_string()),
            None => {}
        }
        sections.extend(blocks_at(BlockAnchor::AfterNotes).map(str::to_string));

        normalize(&sections.join("\n\n"))
    }
}

/// Whether notes would not read back as a single section: they hold a
/// level-2 heading or a marker line, or leave a code fence open.
fn needs_end_marker(notes: &str) -> bool {
    let mut in_fence = false;
    for line in notes.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
        } else if is_notes_end(line) || (!in_fence && is_section_heading(line)) {
            return true;
        }
    }
    in_fence
}

fn is_continuation(text: &str) -> bool {
    text.starts_with(' ') || text.starts_with('\t') || text.starts_with('-')
}

fn encode_entry(name: &str, value: &FieldValue) -> String {
    match value {
        FieldValue::Null => format!("{}:", name),
        other => format!("{}: {}", name, encode_value(other)),
    }
}

fn encode_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => String::new(),
        FieldValue::Text(s) => encode_scalar(s),
        FieldValue::Integer(n) => n.to_string(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        FieldValue::List(items) => {
            let items: Vec<String> = items.iter().map(|i| encode_flow_item(i)).collect();
            format!("[{}]", items.join(", "))
        }
    }
}

/// Plain YAML when the text reads back as the same string, double-quoted
/// (JSON escaping is valid YAML) otherwise.
fn encode_scalar(text: &str) -> String {
    if is_plain(text) {
        text.to_string()
    } else {
        quote(text)
    }
}

fn encode_flow_item(text: &str) -> String {
    if is_plain(text) && !text.contains([',', '[', ']', '{', '}']) {
        text.to_string()
    } else {
        quote(text)
    }
}

fn is_plain(text: &str) -> bool {
    !text.is_empty()
        && !text.contains('\n')
        && text.trim() == text
        && matches!(serde_yaml::from_str::<Value>(text), Ok(Value::String(ref s)) if s == text)
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text))
}
