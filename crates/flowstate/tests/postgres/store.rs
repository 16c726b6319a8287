//! Integration tests for PgStore.

use std::time::Duration;

use flowstate::clock::from_unix_millis;
use flowstate::{PgStore, RunStatus, Snapshot, SnapshotStore, UnitOfWork};
use serde_json::json;
use test_utils::db_test;

use crate::support::helpers::status_column;

fn suspended(run_id: &str, resume_after: i64) -> Snapshot {
    Snapshot::from_json(json!({
        "runId": run_id,
        "workflowType": "test",
        "status": "suspended",
        "currentStep": "wait",
        "state": { "n": 1 },
        "actionMemo": { "charge": { "executed": true, "result": 42 } },
        "pendingResumeEntries": [
            { "type": "timer", "resumeId": "wait:a", "resumeAfter": resume_after },
            { "type": "event", "resumeId": "wait:b", "filterCriteria": null }
        ]
    }))
    .expect("valid snapshot")
}

db_test!(commit_upserts_and_drop_rolls_back, |pool| {
    let store = PgStore::new(pool.clone());

    let mut uow = store.begin("run-1").await?;
    assert!(uow.snapshot().is_none());
    uow.save(suspended("run-1", 100));
    uow.commit().await?;
    assert_eq!(store.load("run-1").await?, Some(suspended("run-1", 100)));
    assert_eq!(status_column(pool, "run-1").await?.as_deref(), Some("suspended"));

    let mut uow = store.begin("run-1").await?;
    assert_eq!(uow.snapshot(), Some(&suspended("run-1", 100)));
    let mut changed = suspended("run-1", 100);
    changed.status = RunStatus::Finished;
    uow.save(changed);
    drop(uow);
    assert_eq!(store.load("run-1").await?, Some(suspended("run-1", 100)));

    let mut uow = store.begin("run-1").await?;
    let mut changed = suspended("run-1", 100);
    changed.status = RunStatus::Finished;
    uow.save(changed.clone());
    uow.commit().await?;
    assert_eq!(store.load("run-1").await?, Some(changed));
    assert_eq!(status_column(pool, "run-1").await?.as_deref(), Some("finished"));
    Ok(())
});

db_test!(begin_serializes_units_of_work_per_run, |pool| {
    let store = PgStore::new(pool.clone());
    let mut uow = store.begin("run-1").await?;

    let contender = tokio::spawn({
        let store = store.clone();
        async move {
            let uow = store.begin("run-1").await?;
            let seen = uow.snapshot().cloned();
            uow.commit().await?;
            Ok::<_, flowstate::Error>(seen)
        }
    });

    let other = store.begin("run-2").await?;
    other.commit().await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!contender.is_finished(), "second begin must wait for the advisory lock");

    uow.save(suspended("run-1", 100));
    uow.commit().await?;

    let seen = contender.await??;
    assert_eq!(seen, Some(suspended("run-1", 100)));
    Ok(())
});

db_test!(list_due_follows_next_timer_at, |pool| {
    let store = PgStore::new(pool.clone());
    for (run_id, resume_after) in [("run-1", 100), ("run-2", 500)] {
        let mut uow = store.begin(run_id).await?;
        uow.save(suspended(run_id, resume_after));
        uow.commit().await?;
    }

    assert!(store.list_due(from_unix_millis(99)).await?.is_empty());

    let due = store.list_due(from_unix_millis(500)).await?;
    let ids: Vec<_> = due.iter().map(|t| (t.run_id.as_str(), t.resume_id.as_str())).collect();
    assert_eq!(ids, [("run-1", "wait:a"), ("run-2", "wait:a")]);

    let mut uow = store.begin("run-2").await?;
    let mut finished = suspended("run-2", 500);
    finished.status = RunStatus::Finished;
    uow.save(finished);
    uow.commit().await?;

    let due = store.list_due(from_unix_millis(1_000)).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].run_id, "run-1");
    Ok(())
});

db_test!(migrate_is_idempotent, |pool| {
    let store = PgStore::new(pool.clone());
    store.migrate().await?;
    store.migrate().await?;
    assert!(store.load("missing").await?.is_none());
    Ok(())
});
