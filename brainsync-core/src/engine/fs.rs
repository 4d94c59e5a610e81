//! Filesystem primitives used by reconciliations.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Reads a file, mapping "not found" to `None`.
pub(crate) async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replaces `path` with `contents` through a synced temp file and a rename,
/// so readers only ever see the old or the new content.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    fs::create_dir_all(parent).await?;

    let temp = parent.join(format!(
        ".{}.{}.tmp",
        name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));
    let result = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub(crate) async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = fs::metadata(path).await.ok()?;
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

/// `<file name>.conflict-<UTC timestamp>` next to `path`.
pub fn conflict_artifact_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.conflict-{}", name, at.format("%Y%m%dT%H%M%SZ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_creates_parents_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks/task-1.md");

        write_atomic(&path, b"first\n").await.unwrap();
        write_atomic(&path, b"second\n").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second\n");
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("tasks"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_write_atomic_fails_when_parent_is_a_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tasks"), "not a dir").unwrap();
        let err = write_atomic(&dir.path().join("tasks/task-1.md"), b"x")
            .await
            .unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_read_optional_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        assert!(read_optional(&path).await.unwrap().is_none());
        remove_if_exists(&path).await.unwrap();

        std::fs::write(&path, "x").unwrap();
        assert_eq!(read_optional(&path).await.unwrap(), Some(b"x".to_vec()));
        assert!(modified_at(&path).await.is_some());
        remove_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_conflict_artifact_path() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 3).unwrap();
        assert_eq!(
            conflict_artifact_path(Path::new("/vault/tasks/task-42.md"), at),
            PathBuf::from("/vault/tasks/task-42.md.conflict-20261018T090503Z")
        );
    }
}
