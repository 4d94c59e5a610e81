//! Markdown documents: the file-side representation of a synced entity.
//!
//! A document is a `---` fenced header of `key: value` lines followed by a body
//! split into `## ` sections. Header keys owned by the entity's schema and the
//! `## Notes` section are *recognized fields*; everything else is carried
//! through parse/render cycles verbatim as *preserved blocks*.

mod hash;
mod parser;
mod writer;

pub use hash::{entity_hash, normalize, ContentHash};
pub use parser::{parse, parse_bytes, DocumentParser};
pub use writer::{render, render_entity, render_over, DocumentWriter};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{EntityKind, FieldValue};

/// Closes a notes section whose text holds lines that would otherwise start
/// a new section.
const NOTES_END: &str = "<!-- end of notes -->";

/// Where a preserved block sits relative to the recognized content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockAnchor {
    /// An unrecognized header entry, rendered after the recognized keys.
    Header,
    /// Body content that appeared before the notes section.
    BeforeNotes,
    /// Body content that appeared after the notes section.
    AfterNotes,
}

/// Raw user-authored content not owned by the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedBlock {
    pub anchor: BlockAnchor,
    pub text: String,
}

impl PreservedBlock {
    pub fn new(anchor: BlockAnchor, text: impl Into<String>) -> Self {
        Self {
            anchor,
            text: text.into(),
        }
    }
}

/// Non-fatal issue found while parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    /// 1-based line in the source, when the issue is tied to one.
    pub line: Option<usize>,
    pub message: String,
}

impl ParseWarning {
    pub fn new(line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Result of parsing one markdown file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// Kind the fields were recognized against, if it could be resolved.
    pub kind: Option<EntityKind>,
    pub recognized_fields: BTreeMap<String, FieldValue>,
    pub preserved_blocks: Vec<PreservedBlock>,
    /// Hash of the normalized source text.
    pub content_hash: ContentHash,
    pub parse_warnings: Vec<ParseWarning>,
}

impl ParsedDocument {
    /// Entity id declared in the header, if any.
    pub fn declared_id(&self) -> Option<i64> {
        self.recognized_fields.get("id").and_then(FieldValue::as_integer)
    }

    pub fn has_warnings(&self) -> bool {
        !self.parse_warnings.is_empty()
    }

    /// Compares the parts covered by the round-trip law.
    pub fn same_content(&self, other: &ParsedDocument) -> bool {
        self.recognized_fields == other.recognized_fields
            && self.preserved_blocks == other.preserved_blocks
    }
}
