use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::EntityRef;

/// What a reconciliation is serialized on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum SyncKey {
    Entity(EntityRef),
    /// A vault-relative path not yet linked to any entity.
    Path(PathBuf),
}

/// One async mutex per key, created on demand and dropped when unused.
///
/// Waiters on the same key are served in arrival order.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: DashMap<SyncKey, Arc<Mutex<()>>>,
}

pub(crate) struct KeyGuard<'a> {
    locks: &'a DashMap<SyncKey, Arc<Mutex<()>>>,
    key: SyncKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, key: SyncKey) -> KeyGuard<'_> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let key = SyncKey::Entity(EntityRef::new(EntityKind::Task, 1));
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = Arc::clone(&locks);
            let log = Arc::clone(&log);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(key).await;
                log.lock().unwrap().push(format!("start {}", i));
                tokio::time::sleep(Duration::from_millis(10)).await;
                log.lock().unwrap().push(format!("end {}", i));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = log.lock().unwrap();
        for pair in log.chunks(2) {
            let started = pair[0].strip_prefix("start ").unwrap();
            assert_eq!(pair[1], format!("end {}", started));
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(SyncKey::Path(PathBuf::from("a.md"))).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(SyncKey::Path(PathBuf::from("b.md"))),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
