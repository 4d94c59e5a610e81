//! Filesystem watching for the vault.
//!
//! `notify::RecommendedWatcher` reports raw notifications on its own thread; a
//! callback bridges them into a bounded tokio channel consumed by the
//! [`Debouncer`](debounce::Debouncer) task, which turns bursts into single
//! [`ChangeEvent`]s and pairs deletions with creations into renames.

mod debounce;
mod filter;

pub use filter::PathFilter;

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use debounce::{Debouncer, RawEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Quiet period after the last raw notification for a path.
    pub debounce: Duration,
    /// How long a deletion waits for a matching creation.
    pub rename_window: Duration,
    /// Glob patterns, relative to the root, that are never reported.
    pub ignore: Vec<String>,
    pub extensions: Vec<String>,
    /// Capacity of the notify-to-tokio bridge.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            rename_window: Duration::from_secs(1),
            ignore: vec![
                "**/.*".to_string(),
                "**/*.conflict-*".to_string(),
                "**/*.tmp".to_string(),
                "**/*~".to_string(),
            ],
            extensions: vec!["md".to_string()],
            channel_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { from: PathBuf },
}

/// One debounced change to a file under the vault root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
}

/// What the watcher hands to its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Change(ChangeEvent),
    /// Notifications were lost; the consumer should rescan the whole vault.
    RescanNeeded,
}

/// A running watch over one vault root.
///
/// Dropping the watcher stops it without waiting; [`FileWatcher::stop`] also
/// waits until the debounce task has exited, after which the callback is never
/// invoked again.
pub struct FileWatcher {
    root: PathBuf,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    _watcher: notify::RecommendedWatcher,
}

impl FileWatcher {
    /// Starts watching `root` recursively and calls `callback` for every
    /// debounced event. Must be called inside a tokio runtime.
    pub fn watch<F>(
        root: impl AsRef<Path>,
        config: WatchConfig,
        cancel: &CancellationToken,
        callback: F,
    ) -> Result<Self, WatchError>
    where
        F: FnMut(WatchEvent) + Send + 'static,
    {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(WatchError::NotADirectory(root.to_path_buf()));
        }
        let root = root.canonicalize()?;
        let filter = PathFilter::new(&root, &config)?;

        let (bridge_tx, bridge_rx) = mpsc::channel::<RawEvent>(config.channel_capacity.max(1));
        let rescan_needed = Arc::new(AtomicBool::new(false));

        let mut watcher = {
            let rescan = Arc::clone(&rescan_needed);
            notify::RecommendedWatcher::new(
                move |res: Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        for raw in RawEvent::from_notify(event) {
                            match bridge_tx.try_send(raw) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    if !rescan.swap(true, Ordering::Relaxed) {
                                        warn!("Watcher channel full, falling back to a full rescan");
                                    }
                                }
                                Err(TrySendError::Closed(_)) => return,
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Filesystem watcher error"),
                },
                notify::Config::default(),
            )
            .map_err(|source| WatchError::Notify {
                path: root.clone(),
                source,
            })?
        };
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Notify {
                path: root.clone(),
                source,
            })?;

        let cancel = cancel.child_token();
        let debouncer = Debouncer::new(config, filter, rescan_needed, callback);
        let task = tokio::spawn(debouncer.run(bridge_rx, cancel.clone()));
        info!(root = %root.display(), "Watching vault");

        Ok(Self {
            root,
            cancel,
            task: Some(task),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cancels pending debounce timers and waits for the debounce task.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Watcher task ended abnormally");
            }
        }
        debug!(root = %self.root.display(), "Watcher stopped");
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_watch_rejects_missing_root() {
        let cancel = CancellationToken::new();
        let result = FileWatcher::watch("/no/such/vault", WatchConfig::default(), &cancel, |_| {});
        assert!(matches!(result, Err(WatchError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_watch_reports_new_file() {
        let dir = TempDir::new().unwrap();
        let config = WatchConfig {
            debounce: Duration::from_millis(50),
            ..WatchConfig::default()
        };
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = FileWatcher::watch(dir.path(), config, &cancel, move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(watcher.root().join("hello.md"), "hi\n").unwrap();

        let event = timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(WatchEvent::Change(change)) => break Some(change),
                    Some(WatchEvent::RescanNeeded) => continue,
                    None => break None,
                }
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(event.path, watcher.root().join("hello.md"));
        assert!(matches!(event.kind, ChangeKind::Created | ChangeKind::Modified));

        watcher.stop().await;
    }
}
