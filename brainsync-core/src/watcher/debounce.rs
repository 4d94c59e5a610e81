use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::filter::PathFilter;
use super::{ChangeEvent, ChangeKind, WatchConfig, WatchEvent};
use crate::document::ContentHash;

/// A single notification as reported by the OS watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl RawEvent {
    /// Maps a notify event onto raw events.
    pub(crate) fn from_notify(event: notify::Event) -> Vec<RawEvent> {
        use notify::event::{ModifyKind, RenameMode};
        use notify::EventKind;

        let mut paths = event.paths;
        match event.kind {
            EventKind::Create(_) => paths.into_iter().map(RawEvent::Created).collect(),
            EventKind::Remove(_) => paths.into_iter().map(RawEvent::Removed).collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                let to = paths.pop().unwrap_or_default();
                let from = paths.pop().unwrap_or_default();
                vec![RawEvent::Renamed { from, to }]
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                paths.into_iter().map(RawEvent::Removed).collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                paths.into_iter().map(RawEvent::Created).collect()
            }
            // Backends that cannot tell which side of a rename a path is on.
            EventKind::Modify(ModifyKind::Name(_)) => paths
                .into_iter()
                .map(|p| {
                    if p.exists() {
                        RawEvent::Created(p)
                    } else {
                        RawEvent::Removed(p)
                    }
                })
                .collect(),
            EventKind::Modify(_) | EventKind::Any => {
                paths.into_iter().map(RawEvent::Modified).collect()
            }
            EventKind::Access(_) | EventKind::Other => Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Pending {
    kind: ChangeKind,
    deadline: Instant,
}

#[derive(Debug)]
struct HeldDeletion {
    hash: ContentHash,
    deadline: Instant,
}

/// Coalesces raw notifications per path and pairs deletions with creations
/// into renames.
///
/// Every raw notification for a path pushes that path's deadline out by the
/// debounce window; when the deadline passes one event with the latest kind is
/// emitted. Deletions of files with a known hash are held for the rename
/// window so a matching creation can claim them.
pub(crate) struct Debouncer<F> {
    config: WatchConfig,
    filter: PathFilter,
    pending: HashMap<PathBuf, Pending>,
    held: HashMap<PathBuf, HeldDeletion>,
    hashes: HashMap<PathBuf, ContentHash>,
    rescan_needed: Arc<AtomicBool>,
    emit: F,
}

impl<F> Debouncer<F>
where
    F: FnMut(WatchEvent) + Send + 'static,
{
    pub(crate) fn new(
        config: WatchConfig,
        filter: PathFilter,
        rescan_needed: Arc<AtomicBool>,
        emit: F,
    ) -> Self {
        Self {
            config,
            filter,
            pending: HashMap::new(),
            held: HashMap::new(),
            hashes: HashMap::new(),
            rescan_needed,
            emit,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<RawEvent>, cancel: CancellationToken) {
        self.seed().await;

        loop {
            let wake = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        pending = self.pending.len(),
                        held = self.held.len(),
                        "Watcher stopped, dropping pending events"
                    );
                    break;
                }
                raw = rx.recv() => match raw {
                    Some(raw) => {
                        self.observe(raw, Instant::now());
                        if self.rescan_needed.swap(false, Ordering::Relaxed) {
                            (self.emit)(WatchEvent::RescanNeeded);
                        }
                    }
                    None => break,
                },
                _ = sleep_until(wake) => self.flush_due(Instant::now()).await,
            }
        }
    }

    /// Fills the hash cache from the files currently under the root.
    async fn seed(&mut self) {
        match self.filter.scan_async().await {
            Ok(files) => {
                for path in files {
                    if let Some(hash) = read_hash(&path).await {
                        self.hashes.insert(path, hash);
                    }
                }
                debug!(files = self.hashes.len(), "Seeded watcher hash cache");
            }
            Err(e) => warn!(error = %e, "Failed to scan vault for rename detection"),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.values().map(|p| p.deadline);
        let held = self.held.values().map(|h| h.deadline);
        pending.chain(held).min()
    }

    pub(crate) fn observe(&mut self, raw: RawEvent, now: Instant) {
        match raw {
            RawEvent::Created(path) => self.touch(path, ChangeKind::Created, now),
            RawEvent::Modified(path) => self.touch(path, ChangeKind::Modified, now),
            RawEvent::Removed(path) => self.touch(path, ChangeKind::Deleted, now),
            RawEvent::Renamed { from, to } => {
                match (self.filter.accepts(&from), self.filter.accepts(&to)) {
                    (true, true) => {
                        self.pending.remove(&from);
                        self.held.remove(&from);
                        if let Some(hash) = self.hashes.remove(&from) {
                            self.hashes.insert(to.clone(), hash);
                        }
                        self.touch(to, ChangeKind::Renamed { from }, now);
                    }
                    // An editor saving through a temp file.
                    (false, true) => self.touch(to, ChangeKind::Modified, now),
                    (true, false) => self.touch(from, ChangeKind::Deleted, now),
                    (false, false) => {}
                }
            }
        }
    }

    fn touch(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        if !self.filter.accepts(&path) {
            return;
        }
        let kind = match (self.pending.get(&path).map(|p| &p.kind), kind) {
            // A deleted rename target is resolved against its source at flush.
            (
                Some(ChangeKind::Renamed { from }),
                ChangeKind::Created | ChangeKind::Modified | ChangeKind::Deleted,
            ) => ChangeKind::Renamed { from: from.clone() },
            (_, kind) => kind,
        };
        if kind != ChangeKind::Deleted {
            self.held.remove(&path);
        }
        self.pending.insert(
            path,
            Pending {
                kind,
                deadline: now + self.config.debounce,
            },
        );
    }

    pub(crate) async fn flush_due(&mut self, now: Instant) {
        let mut due: Vec<(PathBuf, ChangeKind, Instant)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, p)| (path.clone(), p.kind.clone(), p.deadline))
            .collect();
        // Deletions first so that a creation in the same batch can pair with them.
        due.sort_by(|a, b| {
            let a_key = (a.1 != ChangeKind::Deleted, a.2, &a.0);
            let b_key = (b.1 != ChangeKind::Deleted, b.2, &b.0);
            a_key.cmp(&b_key)
        });

        for (path, kind, _) in due {
            // A rename partner may already have consumed this entry.
            if self.pending.remove(&path).is_none() {
                continue;
            }
            match kind {
                ChangeKind::Deleted => self.flush_deleted(path, now).await,
                ChangeKind::Created | ChangeKind::Modified => {
                    self.flush_present(path, kind, now).await
                }
                ChangeKind::Renamed { from } => match read_hash(&path).await {
                    Some(hash) => {
                        self.hashes.insert(path.clone(), hash);
                        self.deliver(path, ChangeKind::Renamed { from });
                    }
                    None => {
                        self.hashes.remove(&path);
                        self.deliver(from, ChangeKind::Deleted);
                    }
                },
            }
        }

        let expired: Vec<PathBuf> = self
            .held
            .iter()
            .filter(|(_, h)| h.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in expired {
            self.held.remove(&path);
            self.deliver(path, ChangeKind::Deleted);
        }
    }

    async fn flush_deleted(&mut self, path: PathBuf, now: Instant) {
        if exists(&path).await {
            self.flush_present(path, ChangeKind::Modified, now).await;
        } else {
            self.hold_deletion(path, now);
        }
    }

    /// Holds a deletion for rename pairing when the file's content is known.
    fn hold_deletion(&mut self, path: PathBuf, now: Instant) {
        match self.hashes.remove(&path) {
            Some(hash) => {
                self.held.insert(
                    path,
                    HeldDeletion {
                        hash,
                        deadline: now + self.config.rename_window,
                    },
                );
            }
            None => self.deliver(path, ChangeKind::Deleted),
        }
    }

    async fn flush_present(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        let Some(hash) = read_hash(&path).await else {
            self.hold_deletion(path, now);
            return;
        };
        let previous = self.hashes.insert(path.clone(), hash.clone());
        if kind == ChangeKind::Modified && previous.as_ref() == Some(&hash) {
            debug!(path = %path.display(), "Content unchanged, skipping event");
            return;
        }
        if previous.is_none() {
            if let Some(from) = self.take_rename_source(&hash, &path).await {
                self.deliver(path, ChangeKind::Renamed { from });
                return;
            }
        }
        self.deliver(path, kind);
    }

    /// Finds a deleted path whose last known content matches `hash`.
    async fn take_rename_source(&mut self, hash: &ContentHash, to: &Path) -> Option<PathBuf> {
        let held = self
            .held
            .iter()
            .find(|(_, h)| &h.hash == hash)
            .map(|(path, _)| path.clone());
        if let Some(from) = held {
            self.held.remove(&from);
            return Some(from);
        }

        let candidates: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(path, p)| {
                p.kind == ChangeKind::Deleted
                    && path.as_path() != to
                    && self.hashes.get(path.as_path()) == Some(hash)
            })
            .map(|(path, _)| path.clone())
            .collect();
        for from in candidates {
            if !exists(&from).await {
                self.pending.remove(&from);
                self.hashes.remove(&from);
                return Some(from);
            }
        }
        None
    }

    fn deliver(&mut self, path: PathBuf, kind: ChangeKind) {
        debug!(path = %path.display(), kind = ?kind, "Delivering change event");
        (self.emit)(WatchEvent::Change(ChangeEvent {
            path,
            kind,
            observed_at: Utc::now(),
        }));
    }
}

async fn read_hash(path: &Path) -> Option<ContentHash> {
    tokio::fs::read(path)
        .await
        .ok()
        .map(|bytes| ContentHash::of_file(&bytes))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::sleep;

    struct TestContext {
        _temp_dir: TempDir,
        root: PathBuf,
        raw_tx: mpsc::Sender<RawEvent>,
        events: UnboundedReceiver<WatchEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    async fn setup(files: &[(&str, &str)]) -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        for (name, content) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        let config = WatchConfig::default();
        let filter = PathFilter::new(&root, &config).unwrap();
        let (raw_tx, raw_rx) = mpsc::channel(64);
        let (event_tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let debouncer = Debouncer::new(
            config,
            filter,
            Arc::new(AtomicBool::new(false)),
            move |event| {
                let _ = event_tx.send(event);
            },
        );
        let task = tokio::spawn(debouncer.run(raw_rx, cancel.clone()));

        TestContext {
            _temp_dir: temp_dir,
            root,
            raw_tx,
            events,
            cancel,
            task,
        }
    }

    fn drain(events: &mut UnboundedReceiver<WatchEvent>) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WatchEvent::Change(change) = event {
                out.push(change);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_modifies_yields_one_event() {
        let mut ctx = setup(&[("tasks/task-1.md", "one\n")]).await;
        let path = ctx.root.join("tasks/task-1.md");
        sleep(Duration::from_millis(10)).await;
        fs::write(&path, "two\n").unwrap();

        for _ in 0..5 {
            ctx.raw_tx.send(RawEvent::Modified(path.clone())).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        }
        assert!(drain(&mut ctx.events).is_empty());

        sleep(Duration::from_millis(600)).await;
        let events = drain(&mut ctx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, path);
        assert_eq!(events[0].kind, ChangeKind::Modified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_kind_wins() {
        let mut ctx = setup(&[]).await;
        let path = ctx.root.join("new.md");
        sleep(Duration::from_millis(10)).await;
        fs::write(&path, "hello\n").unwrap();

        ctx.raw_tx.send(RawEvent::Created(path.clone())).await.unwrap();
        ctx.raw_tx.send(RawEvent::Modified(path.clone())).await.unwrap();
        sleep(Duration::from_millis(600)).await;

        let events = drain(&mut ctx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Modified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_content_is_suppressed() {
        let mut ctx = setup(&[("a.md", "same\n")]).await;
        let path = ctx.root.join("a.md");
        sleep(Duration::from_millis(10)).await;

        ctx.raw_tx.send(RawEvent::Modified(path)).await.unwrap();
        sleep(Duration::from_millis(600)).await;
        assert!(drain(&mut ctx.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_create_with_same_content_is_a_rename() {
        let mut ctx = setup(&[("tasks/task-1.md", "content\n")]).await;
        let from = ctx.root.join("tasks/task-1.md");
        let to = ctx.root.join("tasks/renamed.md");
        sleep(Duration::from_millis(10)).await;
        fs::rename(&from, &to).unwrap();

        ctx.raw_tx.send(RawEvent::Removed(from.clone())).await.unwrap();
        ctx.raw_tx.send(RawEvent::Created(to.clone())).await.unwrap();
        sleep(Duration::from_millis(600)).await;

        let events = drain(&mut ctx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, to);
        assert_eq!(events[0].kind, ChangeKind::Renamed { from });

        sleep(Duration::from_secs(2)).await;
        assert!(drain(&mut ctx.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_after_held_deletion_is_a_rename() {
        let mut ctx = setup(&[("a.md", "moved\n")]).await;
        let from = ctx.root.join("a.md");
        let to = ctx.root.join("b.md");
        sleep(Duration::from_millis(10)).await;
        fs::rename(&from, &to).unwrap();

        ctx.raw_tx.send(RawEvent::Removed(from.clone())).await.unwrap();
        sleep(Duration::from_millis(700)).await;
        assert!(drain(&mut ctx.events).is_empty());

        ctx.raw_tx.send(RawEvent::Created(to.clone())).await.unwrap();
        sleep(Duration::from_millis(600)).await;
        let events = drain(&mut ctx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Renamed { from });
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_is_delivered_after_rename_window() {
        let mut ctx = setup(&[("a.md", "gone\n")]).await;
        let path = ctx.root.join("a.md");
        sleep(Duration::from_millis(10)).await;
        fs::remove_file(&path).unwrap();

        ctx.raw_tx.send(RawEvent::Removed(path.clone())).await.unwrap();
        sleep(Duration::from_millis(600)).await;
        assert!(drain(&mut ctx.events).is_empty());

        sleep(Duration::from_millis(1100)).await;
        let events = drain(&mut ctx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, path);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_rename_is_passed_through() {
        let mut ctx = setup(&[("a.md", "x\n")]).await;
        let from = ctx.root.join("a.md");
        let to = ctx.root.join("b.md");
        sleep(Duration::from_millis(10)).await;
        fs::rename(&from, &to).unwrap();

        ctx.raw_tx
            .send(RawEvent::Renamed {
                from: from.clone(),
                to: to.clone(),
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(600)).await;

        let events = drain(&mut ctx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, to);
        assert_eq!(events[0].kind, ChangeKind::Renamed { from });
    }

    #[tokio::test(start_paused = true)]
    async fn test_renamed_then_deleted_reports_the_source() {
        let mut ctx = setup(&[("tasks/task-1.md", "short lived\n")]).await;
        let from = ctx.root.join("tasks/task-1.md");
        let to = ctx.root.join("tasks/moved.md");
        sleep(Duration::from_millis(10)).await;
        fs::rename(&from, &to).unwrap();
        fs::remove_file(&to).unwrap();

        ctx.raw_tx
            .send(RawEvent::Renamed {
                from: from.clone(),
                to: to.clone(),
            })
            .await
            .unwrap();
        ctx.raw_tx.send(RawEvent::Removed(to)).await.unwrap();
        sleep(Duration::from_millis(600)).await;

        let events = drain(&mut ctx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, from);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_paths_produce_nothing() {
        let mut ctx = setup(&[]).await;
        for name in [".hidden.md", "notes.txt", ".task-1.md.abc.tmp"] {
            let path = ctx.root.join(name);
            fs::write(&path, "x").unwrap();
            ctx.raw_tx.send(RawEvent::Created(path)).await.unwrap();
        }
        sleep(Duration::from_millis(600)).await;
        assert!(drain(&mut ctx.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_events_after_stop() {
        let mut ctx = setup(&[]).await;
        let path = ctx.root.join("late.md");
        fs::write(&path, "x").unwrap();
        ctx.raw_tx.send(RawEvent::Created(path)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        ctx.cancel.cancel();
        ctx.task.await.unwrap();

        sleep(Duration::from_secs(2)).await;
        assert!(drain(&mut ctx.events).is_empty());
    }

    #[test]
    fn test_from_notify() {
        use notify::event::{CreateKind, DataChange, ModifyKind, RenameMode};
        use notify::{Event, EventKind};

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/v/a.md".into());
        assert_eq!(
            RawEvent::from_notify(created),
            vec![RawEvent::Created("/v/a.md".into())]
        );

        let modified = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/v/a.md".into());
        assert_eq!(
            RawEvent::from_notify(modified),
            vec![RawEvent::Modified("/v/a.md".into())]
        );

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/v/a.md".into())
            .add_path("/v/b.md".into());
        assert_eq!(
            RawEvent::from_notify(renamed),
            vec![RawEvent::Renamed {
                from: "/v/a.md".into(),
                to: "/v/b.md".into()
            }]
        );

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path("/v/a.md".into());
        assert!(RawEvent::from_notify(access).is_empty());
    }
}
