use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;

use super::hash::{normalize, ContentHash};
use super::{BlockAnchor, ParseWarning, ParsedDocument, PreservedBlock, NOTES_END};
use crate::models::{schema, EntityKind, FieldValue, NOTES_FIELD};

const FENCE: &str = "---";

/// Parses markdown text into recognized fields and preserved blocks.
///
/// Parsing never fails: anything it cannot interpret is kept as a preserved
/// block and reported through `parse_warnings`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentParser {
    kind_hint: Option<EntityKind>,
}

/// Parses `text` without a kind hint; the header must declare `kind`.
pub fn parse(text: &str) -> ParsedDocument {
    DocumentParser::new().parse(text)
}

pub fn parse_bytes(bytes: &[u8]) -> ParsedDocument {
    DocumentParser::new().parse_bytes(bytes)
}

/// One `key: value` header entry and its continuation lines.
struct HeaderEntry<'a> {
    key: Option<&'a str>,
    line: usize,
    lines: Vec<&'a str>,
}

impl HeaderEntry<'_> {
    fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// The YAML text of the entry's value: the remainder of the first line
    /// plus any continuation lines.
    fn raw_value(&self) -> String {
        let first = self
            .lines
            .first()
            .and_then(|l| l.split_once(':'))
            .map(|(_, v)| v.trim())
            .unwrap_or_default();
        let rest = &self.lines[1..];
        match (first.is_empty(), rest.is_empty()) {
            (_, true) => first.to_string(),
            (true, false) => rest.join("\n"),
            (false, false) => format!("{}\n{}", first, rest.join("\n")),
        }
    }
}

impl DocumentParser {
    pub fn new() -> Self {
        Self { kind_hint: None }
    }

    /// Uses `kind` when the header does not declare one.
    pub fn with_kind_hint(kind: EntityKind) -> Self {
        Self {
            kind_hint: Some(kind),
        }
    }

    /// Derives the kind hint from the file's directory (`tasks/…` → task).
    pub fn for_path(path: &Path) -> Self {
        let kind_hint = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(EntityKind::from_dir_name);
        Self { kind_hint }
    }

    /// Parses raw file contents. Bytes that are not valid UTF-8 degrade to a
    /// single preserved block of the lossily decoded text.
    pub fn parse_bytes(&self, bytes: &[u8]) -> ParsedDocument {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.parse(text),
            Err(e) => {
                let lossy = String::from_utf8_lossy(bytes);
                let text = normalize(&lossy);
                let mut preserved_blocks = Vec::new();
                if !text.is_empty() {
                    preserved_blocks.push(PreservedBlock::new(
                        BlockAnchor::BeforeNotes,
                        text.trim_end().to_string(),
                    ));
                }
                ParsedDocument {
                    kind: self.kind_hint,
                    recognized_fields: BTreeMap::new(),
                    preserved_blocks,
                    content_hash: ContentHash::of_file(bytes),
                    parse_warnings: vec![ParseWarning::new(
                        None,
                        format!(
                            "file is not valid UTF-8 (invalid byte at offset {}); contents preserved as-is",
                            e.valid_up_to()
                        ),
                    )],
                }
            }
        }
    }

    pub fn parse(&self, text: &str) -> ParsedDocument {
        let normalized = normalize(text);
        let content_hash = ContentHash::of_bytes(normalized.as_bytes());
        let lines: Vec<&str> = normalized.lines().collect();

        let mut warnings = Vec::new();
        let mut recognized_fields = BTreeMap::new();
        let mut preserved_blocks = Vec::new();

        let (header, body_start) = split_header(&lines, &mut warnings);
        let entries = header.map(read_entries).unwrap_or_default();

        let kind = self.resolve_kind(&entries, &mut warnings);
        if kind.is_none() {
            warnings.push(ParseWarning::new(
                None,
                "could not determine the entity kind; document kept as preserved content",
            ));
        }

        for entry in &entries {
            let spec = match (kind, entry.key) {
                (Some(kind), Some(key)) => schema::spec_for(kind, key),
                _ => None,
            };
            let Some(spec) = spec else {
                preserved_blocks.push(PreservedBlock::new(BlockAnchor::Header, entry.text()));
                continue;
            };

            match spec.field_type.decode_source(&entry.raw_value()) {
                Ok(decoded) => {
                    if recognized_fields
                        .insert(spec.name.to_string(), decoded)
                        .is_some()
                    {
                        warnings.push(ParseWarning::new(
                            Some(entry.line),
                            format!("duplicate key `{}`; the last value wins", spec.name),
                        ));
                    }
                }
                Err(message) => warnings.push(ParseWarning::new(
                    Some(entry.line),
                    format!("`{}`: {}; using the default", spec.name, message),
                )),
            }
        }

        let mut notes_seen = false;
        for (start, block) in split_sections(&lines[body_start..], body_start + 1, kind.is_some()) {
            if kind.is_some() && is_notes_heading(block[0]) {
                if notes_seen {
                    warnings.push(ParseWarning::new(
                        Some(start),
                        "duplicate notes section kept as preserved content",
                    ));
                } else {
                    notes_seen = true;
                    let content = trim_blank_lines(&block[1..]).join("\n");
                    recognized_fields.insert(NOTES_FIELD.to_string(), FieldValue::Text(content));
                    continue;
                }
            }
            let anchor = if notes_seen {
                BlockAnchor::AfterNotes
            } else {
                BlockAnchor::BeforeNotes
            };
            preserved_blocks.push(PreservedBlock::new(anchor, block.join("\n")));
        }

        ParsedDocument {
            kind,
            recognized_fields,
            preserved_blocks,
            content_hash,
            parse_warnings: warnings,
        }
    }

    fn resolve_kind(
        &self,
        entries: &[HeaderEntry<'_>],
        warnings: &mut Vec<ParseWarning>,
    ) -> Option<EntityKind> {
        let Some(entry) = entries.iter().find(|e| e.key == Some("kind")) else {
            return self.kind_hint;
        };
        let raw = entry.raw_value();
        let declared = serde_yaml::from_str::<Value>(&raw)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or(raw);
        match declared.parse::<EntityKind>() {
            Ok(kind) => Some(kind),
            Err(message) => {
                warnings.push(ParseWarning::new(Some(entry.line), message));
                self.kind_hint
            }
        }
    }
}

/// Returns the header lines (without fences) and the index where the body starts.
fn split_header<'a>(
    lines: &'a [&'a str],
    warnings: &mut Vec<ParseWarning>,
) -> (Option<(usize, &'a [&'a str])>, usize) {
    if lines.first() != Some(&FENCE) {
        return (None, 0);
    }
    match lines[1..].iter().position(|l| *l == FENCE || *l == "...") {
        Some(offset) => {
            let close = offset + 1;
            (Some((2, &lines[1..close])), close + 1)
        }
        None => {
            warnings.push(ParseWarning::new(
                Some(1),
                "unterminated header fence; the header is kept as body text",
            ));
            (None, 0)
        }
    }
}

fn read_entries<'a>((first_line, lines): (usize, &'a [&'a str])) -> Vec<HeaderEntry<'a>> {
    let mut entries: Vec<HeaderEntry<'a>> = Vec::new();
    for (offset, line) in lines.iter().copied().enumerate() {
        let line_no = first_line + offset;
        let continuation = line.is_empty()
            || line.starts_with(' ')
            || line.starts_with('\t')
            || line.starts_with('-');
        if continuation {
            match entries.last_mut() {
                Some(entry) => entry.lines.push(line),
                None if line.is_empty() => {}
                None => entries.push(HeaderEntry {
                    key: None,
                    line: line_no,
                    lines: vec![line],
                }),
            }
            continue;
        }
        let key = line
            .split_once(':')
            .map(|(k, _)| k)
            .filter(|k| is_key(k) && !line.starts_with('#'));
        entries.push(HeaderEntry {
            key,
            line: line_no,
            lines: vec![line],
        });
    }
    for entry in &mut entries {
        while entry.lines.len() > 1 && entry.lines.last().is_some_and(|l| l.is_empty()) {
            entry.lines.pop();
        }
    }
    entries
}

fn is_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub(super) fn is_section_heading(line: &str) -> bool {
    line.starts_with("## ") || line == "##"
}

pub(super) fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

pub(super) fn is_notes_end(line: &str) -> bool {
    line.trim() == NOTES_END
}

fn is_notes_heading(line: &str) -> bool {
    is_section_heading(line) && line[2..].trim().eq_ignore_ascii_case(NOTES_FIELD)
}

/// Splits the body at level-2 headings outside code fences. Each block is
/// returned with its 1-based starting line, stripped of surrounding blank lines.
///
/// With `track_notes`, a first notes section followed by an end-of-notes
/// marker runs up to the last marker line whatever it contains, and the
/// marker itself is dropped.
fn split_sections<'a>(
    lines: &'a [&'a str],
    first_line: usize,
    track_notes: bool,
) -> Vec<(usize, &'a [&'a str])> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut in_fence = false;
    let mut notes_pending = track_notes;
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence && is_section_heading(line) {
            if i > start {
                ranges.push(start..i);
                start = i;
            }
            if notes_pending && is_notes_heading(line) {
                notes_pending = false;
                let end = lines.iter().rposition(|l| is_notes_end(l)).filter(|&end| end > i);
                if let Some(end) = end {
                    ranges.push(i..end);
                    start = end + 1;
                    i = end + 1;
                    in_fence = false;
                    continue;
                }
            }
        }
        i += 1;
    }
    ranges.push(start..lines.len());

    ranges
        .into_iter()
        .filter_map(|range| {
            let block = &lines[range.clone()];
            let leading = block.iter().take_while(|l| l.is_empty()).count();
            let trimmed = trim_blank_lines(block);
            (!trimmed.is_empty()).then_some((first_line + range.start + leading, trimmed))
        })
        .collect()
}

fn trim_blank_lines<'a>(lines: &'a [&'a str]) -> &'a [&'a str] {
    let start = lines.iter().position(|l| !l.is_empty()).unwrap_or(lines.len());
    let end = lines.iter().rposition(|l| !l.is_empty()).map_or(start, |i| i + 1);
    &lines[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const TASK: &str = "---
id: 42
kind: task
title: Draft v2
status: in_progress
due: 2026-10-20
tags: [writing, q4]
energy: low
---

Some context written before the notes.

## Notes

First line of notes.
Second line.

## Checklist
- [ ] outline
- [x] research
";

    #[test]
    fn test_parse_recognizes_header_fields() {
        let doc = parse(TASK);
        assert_eq!(doc.kind, Some(EntityKind::Task));
        assert_eq!(doc.declared_id(), Some(42));
        assert_eq!(doc.recognized_fields.get("title"), Some(&FieldValue::text("Draft v2")));
        assert_eq!(
            doc.recognized_fields.get("status"),
            Some(&FieldValue::text("in_progress"))
        );
        assert_eq!(
            doc.recognized_fields.get("due"),
            Some(&FieldValue::Date(NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()))
        );
        assert_eq!(
            doc.recognized_fields.get("tags"),
            Some(&FieldValue::List(vec!["writing".into(), "q4".into()]))
        );
        assert!(!doc.has_warnings(), "{:?}", doc.parse_warnings);
    }

    #[test]
    fn test_parse_notes_and_preserved_blocks() {
        let doc = parse(TASK);
        assert_eq!(
            doc.recognized_fields.get(NOTES_FIELD),
            Some(&FieldValue::text("First line of notes.\nSecond line."))
        );
        assert_eq!(
            doc.preserved_blocks,
            vec![
                PreservedBlock::new(BlockAnchor::Header, "energy: low"),
                PreservedBlock::new(
                    BlockAnchor::BeforeNotes,
                    "Some context written before the notes."
                ),
                PreservedBlock::new(
                    BlockAnchor::AfterNotes,
                    "## Checklist\n- [ ] outline\n- [x] research"
                ),
            ]
        );
    }

    #[test]
    fn test_invalid_value_is_warning_not_failure() {
        let doc = parse("---\nkind: task\ntitle: X\nstatus: someday\ndue: soon\n---\n");
        assert_eq!(doc.recognized_fields.get("title"), Some(&FieldValue::text("X")));
        assert!(!doc.recognized_fields.contains_key("status"));
        assert!(!doc.recognized_fields.contains_key("due"));
        assert_eq!(doc.parse_warnings.len(), 2);
        assert_eq!(doc.parse_warnings[0].line, Some(4));
    }

    #[test]
    fn test_kind_hint_used_without_header_kind() {
        let doc = DocumentParser::for_path(Path::new("/vault/projects/launch.md"))
            .parse("---\ntitle: Launch\n---\n");
        assert_eq!(doc.kind, Some(EntityKind::Project));
        assert_eq!(doc.recognized_fields.get("title"), Some(&FieldValue::text("Launch")));
    }

    #[test]
    fn test_unknown_kind_preserves_everything() {
        let doc = parse("---\ntitle: Mystery\n---\n\n## Notes\n\nhello\n");
        assert_eq!(doc.kind, None);
        assert!(doc.recognized_fields.is_empty());
        assert_eq!(doc.preserved_blocks.len(), 2);
        assert!(doc.has_warnings());
    }

    #[test]
    fn test_unterminated_header_degrades_to_body() {
        let doc = DocumentParser::with_kind_hint(EntityKind::Task).parse("---\ntitle: oops\n\nbody\n");
        assert!(doc.recognized_fields.is_empty());
        assert_eq!(doc.preserved_blocks.len(), 1);
        assert!(doc.preserved_blocks[0].text.contains("title: oops"));
        assert_eq!(doc.parse_warnings[0].line, Some(1));
    }

    #[test]
    fn test_invalid_utf8_is_preserved() {
        let bytes = b"---\nkind: task\n---\nbad \xff byte\n";
        let doc = DocumentParser::new().parse_bytes(bytes);
        assert!(doc.recognized_fields.is_empty());
        assert_eq!(doc.preserved_blocks.len(), 1);
        assert!(doc.preserved_blocks[0].text.contains("bad"));
        assert_eq!(doc.content_hash, ContentHash::of_file(bytes));
        assert!(doc.parse_warnings[0].message.contains("UTF-8"));
    }

    #[test]
    fn test_headings_inside_code_fence_do_not_split() {
        let text = "---\nkind: task\n---\n\n## Notes\n\n```md\n## not a section\n```\n";
        let doc = parse(text);
        assert_eq!(
            doc.recognized_fields.get(NOTES_FIELD),
            Some(&FieldValue::text("```md\n## not a section\n```"))
        );
        assert!(doc.preserved_blocks.is_empty());
    }

    #[test]
    fn test_block_style_list_and_continuations() {
        let doc = parse("---\nkind: area\ntags:\n  - health\n  - family\nlinks:\n  - a\n---\n");
        assert_eq!(
            doc.recognized_fields.get("tags"),
            Some(&FieldValue::List(vec!["health".into(), "family".into()]))
        );
        assert_eq!(
            doc.preserved_blocks,
            vec![PreservedBlock::new(BlockAnchor::Header, "links:\n  - a")]
        );
    }

    #[test]
    fn test_duplicate_notes_section_is_preserved() {
        let doc = parse("---\nkind: task\n---\n## Notes\none\n## notes\ntwo\n");
        assert_eq!(doc.recognized_fields.get(NOTES_FIELD), Some(&FieldValue::text("one")));
        assert_eq!(
            doc.preserved_blocks,
            vec![PreservedBlock::new(BlockAnchor::AfterNotes, "## notes\ntwo")]
        );
        assert_eq!(doc.parse_warnings.len(), 1);
    }

    #[test]
    fn test_end_marker_keeps_headings_inside_notes() {
        let text = "---\nkind: task\n---\n\n## Notes\n\nIntro line.\n\n## Sources\n\n- book one\n\n\
                    <!-- end of notes -->\n\n## Log\n- shipped\n";
        let doc = parse(text);
        assert_eq!(
            doc.recognized_fields.get(NOTES_FIELD),
            Some(&FieldValue::text("Intro line.\n\n## Sources\n\n- book one"))
        );
        assert_eq!(
            doc.preserved_blocks,
            vec![PreservedBlock::new(BlockAnchor::AfterNotes, "## Log\n- shipped")]
        );
        assert!(!doc.has_warnings(), "{:?}", doc.parse_warnings);
    }

    #[test]
    fn test_notes_without_marker_end_at_next_heading() {
        let doc = parse("---\nkind: task\n---\n## Notes\nshort\n## Sources\n- a\n");
        assert_eq!(doc.recognized_fields.get(NOTES_FIELD), Some(&FieldValue::text("short")));
        assert_eq!(doc.preserved_blocks[0].anchor, BlockAnchor::AfterNotes);
    }

    #[test]
    fn test_numbers_in_text_fields_keep_their_spelling() {
        let doc = parse("---\nkind: task\ntitle: 1.10\ntags: [007, 2.50, plain]\nproject: 0012\n---\n");
        assert_eq!(doc.recognized_fields.get("title"), Some(&FieldValue::text("1.10")));
        assert_eq!(
            doc.recognized_fields.get("tags"),
            Some(&FieldValue::List(vec!["007".into(), "2.50".into(), "plain".into()]))
        );
        assert_eq!(doc.recognized_fields.get("project"), Some(&FieldValue::Integer(12)));
        assert!(!doc.has_warnings(), "{:?}", doc.parse_warnings);

        let doc = parse("---\nkind: area\ntitle: true # flag\ntags:\n  - 1.0\n  - \"2.0\"\n---\n");
        assert_eq!(doc.recognized_fields.get("title"), Some(&FieldValue::text("true")));
        assert_eq!(
            doc.recognized_fields.get("tags"),
            Some(&FieldValue::List(vec!["1.0".into(), "2.0".into()]))
        );
    }

    #[test]
    fn test_content_hash_is_of_normalized_text() {
        let a = parse("---\r\nkind: task\r\n---\r\n");
        let b = parse("---\nkind: task   \n---\n\n\n");
        assert_eq!(a.content_hash, b.content_hash);
    }
}
