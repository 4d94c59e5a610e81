use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::WatchConfig;
use crate::error::WatchError;

/// Decides which paths under the vault root are sync candidates.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    ignore: GlobSet,
    extensions: Vec<String>,
}

impl PathFilter {
    pub fn new(root: impl Into<PathBuf>, config: &WatchConfig) -> Result<Self, WatchError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore {
            let glob = Glob::new(pattern).map_err(|source| WatchError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let ignore = builder.build().map_err(|source| WatchError::Pattern {
            pattern: config.ignore.join(", "),
            source,
        })?;

        Ok(Self {
            root: root.into(),
            ignore,
            extensions: config.extensions.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True for files under the root with a synced extension that no ignore
    /// pattern matches.
    pub fn accepts(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if relative.as_os_str().is_empty() {
            return false;
        }
        let extension_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        extension_ok && !self.ignore.is_match(relative)
    }

    /// Lists every accepted file under the root, sorted.
    ///
    /// Ignored directories are not descended into and symlinks are not
    /// followed.
    pub fn scan(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if self.root.is_dir() {
            self.scan_dir(&self.root, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    /// Runs [`scan`](Self::scan) on the blocking pool.
    pub async fn scan_async(&self) -> io::Result<Vec<PathBuf>> {
        let filter = self.clone();
        tokio::task::spawn_blocking(move || filter.scan())
            .await
            .map_err(io::Error::other)?
    }

    fn scan_dir(&self, dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let ignored = path
                    .strip_prefix(&self.root)
                    .map(|rel| self.ignore.is_match(rel))
                    .unwrap_or(true);
                if !ignored {
                    self.scan_dir(&path, files)?;
                }
            } else if file_type.is_file() && self.accepts(&path) {
                files.push(path);
            }
        }
        Ok(())
    }
}
