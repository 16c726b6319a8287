//! In-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{DueTimer, SnapshotStore, UnitOfWork};
use crate::clock::unix_millis;
use crate::error::Result;
use crate::instance::Snapshot;

/// Process-local snapshot store.
///
/// Each run id in use has its own async mutex; a unit of work holds it until
/// commit or drop. Clones share the same storage.
///
/// # Example
///
/// ```
/// use flowstate::{InMemoryStore, SnapshotStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryStore::new();
/// assert!(store.load("missing").await.unwrap().is_none());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    snapshots: Mutex<HashMap<String, Snapshot>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.snapshots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Snapshot>> {
        self.inner
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn lock_run(&self, run_id: &str) -> RunGuard {
        let lock = Arc::clone(self.inner.locks().entry(run_id.to_string()).or_default());
        RunGuard {
            inner: Arc::clone(&self.inner),
            run_id: run_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.inner.locks().len()
    }
}

impl Inner {
    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a run's lock; the run's entry leaves the lock table once nobody
/// holds or waits on it.
struct RunGuard {
    inner: Arc<Inner>,
    run_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut locks = self.inner.locks();
        self.guard.take();
        if locks
            .get(&self.run_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.run_id);
        }
    }
}

impl SnapshotStore for InMemoryStore {
    type UnitOfWork<'a> = MemoryUnitOfWork<'a>;

    async fn begin<'a>(&'a self, run_id: &str) -> Result<Self::UnitOfWork<'a>> {
        let guard = self.lock_run(run_id).await;
        let snapshot = self.snapshots().get(run_id).cloned();

        Ok(MemoryUnitOfWork {
            store: self,
            run_id: run_id.to_string(),
            loaded: snapshot,
            staged: None,
            _guard: guard,
        })
    }

    async fn load(&self, run_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots().get(run_id).cloned())
    }

    async fn list_due(&self, before: OffsetDateTime) -> Result<Vec<DueTimer>> {
        let now = unix_millis(before);
        let snapshots = self.snapshots();
        let mut due: Vec<_> = snapshots
            .iter()
            .flat_map(|(run_id, snapshot)| {
                snapshot.due_timers(now).into_iter().map(|resume_id| DueTimer {
                    run_id: run_id.clone(),
                    resume_id,
                })
            })
            .collect();
        due.sort_by(|a, b| (&a.run_id, &a.resume_id).cmp(&(&b.run_id, &b.resume_id)));
        Ok(due)
    }
}

/// In-memory unit of work, holding the run's lock.
pub struct MemoryUnitOfWork<'a> {
    store: &'a InMemoryStore,
    run_id: String,
    loaded: Option<Snapshot>,
    staged: Option<Snapshot>,
    _guard: RunGuard,
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn snapshot(&self) -> Option<&Snapshot> {
        self.loaded.as_ref()
    }

    fn save(&mut self, snapshot: Snapshot) {
        self.staged = Some(snapshot);
    }

    async fn commit(self) -> Result<()> {
        if let Some(snapshot) = self.staged {
            self.store.snapshots().insert(self.run_id, snapshot);
        }
        Ok(())
    }
}
