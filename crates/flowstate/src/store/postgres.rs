//! PostgreSQL store implementation.

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use super::{DueTimer, SnapshotStore, UnitOfWork};
use crate::clock::{from_unix_millis, unix_millis};
use crate::error::Result;
use crate::instance::Snapshot;

const SCHEMA: &str = include_str!("../../migrations/0001_snapshots.sql");

/// PostgreSQL-backed store for production use.
///
/// Each [`begin`](SnapshotStore::begin) opens a transaction and takes a
/// transaction-scoped advisory lock keyed by the run id, so a run id that has
/// no row yet is serialized as well. The lock is released on commit or when
/// the unit of work is dropped (rollback).
///
/// # Database Schema
///
/// One table in the `flowstate` schema, created by [`PgStore::migrate`]:
///
/// | Column          | Purpose                                            |
/// |-----------------|----------------------------------------------------|
/// | `run_id`        | Primary key                                        |
/// | `workflow_type` | Registered workflow the run belongs to             |
/// | `status`        | Run status, for monitoring queries                 |
/// | `snapshot`      | The snapshot document (`JSONB`)                    |
/// | `next_timer_at` | Earliest unresolved timer of a suspended run       |
///
/// # Example
///
/// ```ignore
/// use flowstate::{PgStore, WorkflowRuntime};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let store = PgStore::new(pool);
/// store.migrate().await?;
/// let runtime = WorkflowRuntime::builder(store).register(workflow).build()?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    snapshot: Value,
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema and table if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

impl SnapshotStore for PgStore {
    type UnitOfWork<'a> = PgUnitOfWork<'a>;

    async fn begin<'a>(&'a self, run_id: &str) -> Result<Self::UnitOfWork<'a>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT snapshot FROM flowstate.snapshots WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let loaded = row.map(|row| Snapshot::from_json(row.snapshot)).transpose()?;

        Ok(PgUnitOfWork {
            tx,
            run_id: run_id.to_string(),
            loaded,
            staged: None,
        })
    }

    async fn load(&self, run_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT snapshot FROM flowstate.snapshots WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Snapshot::from_json(row.snapshot)).transpose()
    }

    async fn list_due(&self, before: OffsetDateTime) -> Result<Vec<DueTimer>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"SELECT snapshot FROM flowstate.snapshots
               WHERE next_timer_at IS NOT NULL AND next_timer_at <= $1
               ORDER BY next_timer_at, run_id"#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        let now = unix_millis(before);
        let mut due = Vec::new();
        for row in rows {
            let snapshot = Snapshot::from_json(row.snapshot)?;
            let run_id = snapshot.run_id.clone().unwrap_or_default();
            due.extend(snapshot.due_timers(now).into_iter().map(|resume_id| DueTimer {
                run_id: run_id.clone(),
                resume_id,
            }));
        }
        Ok(due)
    }
}

/// PostgreSQL unit of work.
///
/// Wraps a transaction with the run's advisory lock held until commit.
pub struct PgUnitOfWork<'a> {
    tx: Transaction<'a, Postgres>,
    run_id: String,
    loaded: Option<Snapshot>,
    staged: Option<Snapshot>,
}

impl UnitOfWork for PgUnitOfWork<'_> {
    fn snapshot(&self) -> Option<&Snapshot> {
        self.loaded.as_ref()
    }

    fn save(&mut self, snapshot: Snapshot) {
        self.staged = Some(snapshot);
    }

    async fn commit(mut self) -> Result<()> {
        if let Some(snapshot) = self.staged.take() {
            let next_timer_at = snapshot.next_timer_due().map(from_unix_millis);
            let document = snapshot.to_json()?;

            sqlx::query(
                r#"INSERT INTO flowstate.snapshots
                       (run_id, workflow_type, status, snapshot, next_timer_at)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (run_id) DO UPDATE
                   SET workflow_type = EXCLUDED.workflow_type,
                       status = EXCLUDED.status,
                       snapshot = EXCLUDED.snapshot,
                       next_timer_at = EXCLUDED.next_timer_at,
                       updated_at = now()"#,
            )
            .bind(&self.run_id)
            .bind(&snapshot.workflow_type)
            .bind(snapshot.status.as_str())
            .bind(document)
            .bind(next_timer_at)
            .execute(&mut *self.tx)
            .await?;
        }

        self.tx.commit().await?;
        Ok(())
    }
}
