//! Snapshot persistence.
//!
//! This module provides the [`SnapshotStore`] and [`UnitOfWork`] traits that
//! abstract over storage backends. Two implementations are provided:
//!
//! - [`InMemoryStore`]: process-local storage for tests and embedded use
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

use time::OffsetDateTime;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::error::Result;
use crate::instance::Snapshot;

/// A timer whose deadline has passed, as found by [`SnapshotStore::list_due`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTimer {
    pub run_id: String,
    pub resume_id: String,
}

/// Storage backend for run snapshots.
///
/// Implementations must serialize writers per run id. [`SnapshotStore::begin`]
/// acquires an exclusive lock on the run, held until the unit of work is
/// committed or dropped. Different run ids never block each other.
///
/// Users typically don't interact with this trait directly; the
/// [`WorkflowRuntime`](crate::WorkflowRuntime) drives it.
pub trait SnapshotStore: Send + Sync + Clone + 'static {
    /// The unit of work type returned by this store.
    type UnitOfWork<'a>: UnitOfWork + Send
    where
        Self: 'a;

    /// Lock `run_id` and load its snapshot, if any.
    fn begin<'a>(&'a self, run_id: &str) -> impl Future<Output = Result<Self::UnitOfWork<'a>>> + Send;

    /// Read the latest committed snapshot without taking the lock.
    fn load(&self, run_id: &str) -> impl Future<Output = Result<Option<Snapshot>>> + Send;

    /// Unresolved timers of suspended runs with a deadline at or before `before`.
    fn list_due(&self, before: OffsetDateTime) -> impl Future<Output = Result<Vec<DueTimer>>> + Send;
}

/// Exclusive access to one run's snapshot.
///
/// Changes are only persisted when [`commit`](Self::commit) is called;
/// dropping the unit of work discards them and releases the lock.
pub trait UnitOfWork: Send {
    /// The snapshot as loaded by `begin`, `None` for a new run id.
    fn snapshot(&self) -> Option<&Snapshot>;

    /// Stage `snapshot` to replace the stored one on commit.
    fn save(&mut self, snapshot: Snapshot);

    /// Persist the staged snapshot (if any) and release the lock.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}
