//! Deterministic file naming: `<kind dir>/<kind>-<id>.md` under the vault root.

use std::path::{Component, Path, PathBuf};

use crate::models::{EntityKind, EntityRef};

/// Vault-relative path the entity's file gets when nothing else links it.
pub fn entity_path(entity: EntityRef) -> PathBuf {
    PathBuf::from(entity.kind.dir_name()).join(format!("{}-{}.md", entity.kind, entity.id))
}

/// Inverse of [`entity_path`]; `None` for any path not following the rule.
pub fn parse_entity_path(relative: &Path) -> Option<EntityRef> {
    let mut components = relative.components();
    let (Some(Component::Normal(dir)), Some(Component::Normal(file)), None) =
        (components.next(), components.next(), components.next())
    else {
        return None;
    };
    let kind = EntityKind::from_dir_name(dir.to_str()?)?;
    let stem = file.to_str()?.strip_suffix(".md")?;
    let id: i64 = stem.strip_prefix(kind.as_str())?.strip_prefix('-')?.parse().ok()?;
    (id > 0).then(|| EntityRef::new(kind, id))
}
