use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::models::{schema, SyncEntity};

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wraps a previously computed hex digest (e.g. loaded from the store).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{:x}", digest))
    }

    /// Hash of the normalized form of `text`.
    pub fn of_text(text: &str) -> Self {
        Self::of_bytes(normalize(text).as_bytes())
    }

    /// Hash of raw file contents: normalized text when the bytes are UTF-8,
    /// the bytes themselves otherwise.
    pub fn of_file(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::of_text(text),
            Err(_) => Self::of_bytes(bytes),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical text form: unified line endings, no trailing whitespace on any
/// line, no trailing blank lines, exactly one final newline.
pub fn normalize(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len() + 1);
    for line in unified.lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    let trimmed = out.trim_end_matches('\n');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}

/// Hash of an entity's syncable fields. Timestamps and identity do not count.
pub fn entity_hash(entity: &SyncEntity) -> ContentHash {
    let fields = schema::syncable_fields(entity);
    // BTreeMap keys serialize in order, so the JSON is canonical.
    let json = serde_json::to_vec(&fields).unwrap_or_default();
    ContentHash::of_bytes(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, FieldValue};

    #[test]
    fn test_normalize_line_endings_and_whitespace() {
        assert_eq!(normalize("a  \r\nb\rc\t\n\n\n"), "a\nb\nc\n");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("\n\n"), "");
        assert_eq!(normalize("\u{feff}x"), "x\n");
    }

    #[test]
    fn test_text_hash_ignores_whitespace_noise() {
        assert_eq!(
            ContentHash::of_text("title: A\n"),
            ContentHash::of_text("title: A   \r\n\r\n")
        );
        assert_ne!(ContentHash::of_text("title: A"), ContentHash::of_text("title: B"));
    }

    #[test]
    fn test_file_hash_handles_invalid_utf8() {
        let bytes = [0xff, 0xfe, 0x00];
        assert_eq!(ContentHash::of_file(&bytes), ContentHash::of_bytes(&bytes));
        assert_eq!(ContentHash::of_file(b"x\r\n"), ContentHash::of_text("x"));
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = ContentHash::of_bytes(b"");
        assert_eq!(
            hash.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash.short(), "e3b0c44298fc");
    }

    #[test]
    fn test_entity_hash_tracks_syncable_fields_only() {
        let entity = SyncEntity::new(EntityKind::Task, 42, "Draft");
        let mut touched = entity.clone();
        touched.updated_at = touched.updated_at + chrono::Duration::seconds(30);
        assert_eq!(entity_hash(&entity), entity_hash(&touched));

        let renamed = entity.clone().with_notes("more");
        assert_ne!(entity_hash(&entity), entity_hash(&renamed));

        let tagged = entity.clone().with_field("tags", FieldValue::List(vec!["x".into()]));
        assert_ne!(entity_hash(&entity), entity_hash(&tagged));
    }
}
