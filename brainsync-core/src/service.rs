//! Long-running dispatcher feeding the engine.
//!
//! Three bounded queues feed the dispatcher: debounced change events from the
//! watcher, dirty signals from the database side, and full-scan requests.
//! Triggers are keyed (path, entity or full scan). While a key is in flight
//! further triggers for it queue behind it, so one key is never reconciled
//! twice at once and its triggers run in arrival order.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{SyncEngine, SyncFailure, SyncSummary};
use crate::error::{SyncError, WatchError};
use crate::models::EntityRef;
use crate::store::SyncStore;
use crate::watcher::{ChangeEvent, FileWatcher, WatchEvent};

#[derive(Debug, Clone)]
enum Trigger {
    Change(ChangeEvent),
    Dirty(EntityRef),
    FullScan,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TriggerKey {
    Path(PathBuf),
    Entity(EntityRef),
    FullScan,
}

impl Trigger {
    fn key(&self) -> TriggerKey {
        match self {
            Trigger::Change(event) => TriggerKey::Path(event.path.clone()),
            Trigger::Dirty(entity) => TriggerKey::Entity(*entity),
            Trigger::FullScan => TriggerKey::FullScan,
        }
    }

    /// Whether running `other` after `self` would redo the same work.
    fn covers(&self, other: &Trigger) -> bool {
        match (self, other) {
            (Trigger::Change(a), Trigger::Change(b)) => a.path == b.path && a.kind == b.kind,
            (Trigger::Dirty(a), Trigger::Dirty(b)) => a == b,
            (Trigger::FullScan, Trigger::FullScan) => true,
            _ => false,
        }
    }
}

/// Cloneable entry point for producers outside the service.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    changes: mpsc::Sender<ChangeEvent>,
    dirty: mpsc::Sender<EntityRef>,
    scans: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl SyncHandle {
    /// Reports a database-side mutation of `entity`.
    pub async fn mark_dirty(&self, entity: EntityRef) -> Result<(), SyncError> {
        self.dirty
            .send(entity)
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Like [`mark_dirty`](Self::mark_dirty) but fails instead of waiting when
    /// the queue is full.
    pub fn try_mark_dirty(&self, entity: EntityRef) -> bool {
        self.dirty.try_send(entity).is_ok()
    }

    /// Feeds a change event from a source other than the built-in watcher.
    pub async fn notify_change(&self, event: ChangeEvent) -> Result<(), SyncError> {
        self.changes
            .send(event)
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Queues a full scan unless one is already queued.
    pub fn request_full_scan(&self) {
        let _ = self.scans.try_send(());
    }

    /// Stops accepting triggers; queued work is still drained.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct SyncService {
    handle: SyncHandle,
    task: JoinHandle<SyncSummary>,
}

impl SyncService {
    /// Starts the dispatcher and a watcher over the engine's vault root.
    pub fn start<S: SyncStore>(engine: Arc<SyncEngine<S>>) -> Result<Self, WatchError> {
        let (handle, receivers) = channels(&engine);
        let settings = engine.settings();
        let producer = handle.clone();
        let watcher = FileWatcher::watch(
            &settings.vault_root,
            settings.watch.clone(),
            &handle.cancel,
            move |event| match event {
                WatchEvent::Change(change) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = producer.changes.try_send(change)
                    {
                        warn!("Change queue full, scheduling a full scan");
                        producer.request_full_scan();
                    }
                }
                WatchEvent::RescanNeeded => producer.request_full_scan(),
            },
        )?;
        Ok(Self::launch(engine, handle, receivers, Some(watcher)))
    }

    /// Starts the dispatcher without a watcher; changes arrive through
    /// [`SyncHandle::notify_change`] only.
    pub fn start_unwatched<S: SyncStore>(engine: Arc<SyncEngine<S>>) -> Self {
        let (handle, receivers) = channels(&engine);
        Self::launch(engine, handle, receivers, None)
    }

    fn launch<S: SyncStore>(
        engine: Arc<SyncEngine<S>>,
        handle: SyncHandle,
        receivers: Receivers,
        watcher: Option<FileWatcher>,
    ) -> Self {
        let scan_interval = engine.settings().full_scan_interval;
        let dispatcher = Dispatcher {
            engine,
            queues: HashMap::new(),
            tasks: JoinSet::new(),
            total: SyncSummary::new(),
        };
        let task = tokio::spawn(dispatcher.run(
            receivers,
            watcher,
            scan_interval,
            handle.cancel.clone(),
        ));
        Self { handle, task }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Waits for the dispatcher to finish and returns everything it did.
    pub async fn join(self) -> SyncSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Sync dispatcher ended abnormally");
                SyncSummary::new()
            }
        }
    }

    pub async fn shutdown(self) -> SyncSummary {
        self.handle.shutdown();
        self.join().await
    }
}

fn channels<S: SyncStore>(engine: &SyncEngine<S>) -> (SyncHandle, Receivers) {
    let capacity = engine.settings().queue_capacity.max(1);
    let (changes_tx, changes_rx) = mpsc::channel(capacity);
    let (dirty_tx, dirty_rx) = mpsc::channel(capacity);
    let (scans_tx, scans_rx) = mpsc::channel(1);
    let handle = SyncHandle {
        changes: changes_tx,
        dirty: dirty_tx,
        scans: scans_tx,
        cancel: engine.cancel_token().clone(),
    };
    let receivers = Receivers {
        changes: changes_rx,
        dirty: dirty_rx,
        scans: scans_rx,
    };
    (handle, receivers)
}

struct Receivers {
    changes: mpsc::Receiver<ChangeEvent>,
    dirty: mpsc::Receiver<EntityRef>,
    scans: mpsc::Receiver<()>,
}

struct Dispatcher<S> {
    engine: Arc<SyncEngine<S>>,
    /// Keys in flight, with the triggers queued behind them.
    queues: HashMap<TriggerKey, VecDeque<Trigger>>,
    tasks: JoinSet<(TriggerKey, SyncSummary)>,
    total: SyncSummary,
}

impl<S: SyncStore> Dispatcher<S> {
    async fn run(
        mut self,
        mut rx: Receivers,
        watcher: Option<FileWatcher>,
        scan_interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> SyncSummary {
        let mut scan_timer = scan_interval.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });
        info!("Sync dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(done) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.complete(done);
                }
                Some(event) = rx.changes.recv() => self.dispatch(Trigger::Change(event)),
                Some(entity) = rx.dirty.recv() => self.dispatch(Trigger::Dirty(entity)),
                Some(()) = rx.scans.recv() => self.dispatch(Trigger::FullScan),
                _ = tick(&mut scan_timer) => self.dispatch(Trigger::FullScan),
            }
        }

        info!(in_flight = self.tasks.len(), "Sync dispatcher draining");
        rx.changes.close();
        rx.dirty.close();
        rx.scans.close();
        while let Some(event) = rx.changes.recv().await {
            self.dispatch(Trigger::Change(event));
        }
        while let Some(entity) = rx.dirty.recv().await {
            self.dispatch(Trigger::Dirty(entity));
        }
        while let Some(()) = rx.scans.recv().await {
            self.dispatch(Trigger::FullScan);
        }
        while let Some(done) = self.tasks.join_next().await {
            self.complete(done);
        }

        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
        info!(summary = %self.total, "Sync dispatcher stopped");
        self.total
    }

    fn dispatch(&mut self, trigger: Trigger) {
        let key = trigger.key();
        match self.queues.get_mut(&key) {
            Some(queue) => {
                if queue.iter().any(|queued| queued.covers(&trigger)) {
                    debug!(?key, "Trigger already queued, coalescing");
                } else {
                    queue.push_back(trigger);
                }
            }
            None => {
                self.queues.insert(key.clone(), VecDeque::new());
                self.spawn(key, trigger);
            }
        }
    }

    fn spawn(&mut self, key: TriggerKey, trigger: Trigger) {
        let engine = Arc::clone(&self.engine);
        self.tasks.spawn(async move {
            let work = async {
                match &trigger {
                    Trigger::Change(event) => engine.handle_change(event).await,
                    Trigger::Dirty(entity) => engine.trigger_sync(*entity).await,
                    Trigger::FullScan => engine.trigger_full_scan().await,
                }
            };
            let summary = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(summary) => summary,
                Err(_) => {
                    error!(?trigger, "Reconciliation panicked");
                    let mut summary = SyncSummary::new();
                    summary.errored = 1;
                    summary.failures.push(SyncFailure {
                        target: format!("{:?}", trigger.key()),
                        error: "reconciliation panicked".to_string(),
                    });
                    summary
                }
            };
            (key, summary)
        });
    }

    fn complete(&mut self, done: Result<(TriggerKey, SyncSummary), tokio::task::JoinError>) {
        let (key, summary) = match done {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Reconciliation task failed");
                return;
            }
        };
        self.total.absorb(summary);

        let next = self.queues.get_mut(&key).and_then(VecDeque::pop_front);
        match next {
            Some(trigger) => self.spawn(key, trigger),
            None => {
                self.queues.remove(&key);
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
