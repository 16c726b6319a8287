//! Snapshots as persisted through the store.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use anyhow::Result;
use flowstate::{
    InMemoryStore, ManualClock, ResumeEntry, RuntimeConfig, Snapshot, SnapshotStore, UnitOfWork,
    WorkflowInstance, WorkflowRuntime,
};
use serde_json::json;

use crate::support::helpers::{EPOCH_MILLIS, test_runtime, test_runtime_config};
use crate::support::workflows::{onboarding, trial_conversion};

#[tokio::test]
async fn suspended_snapshot_document_shape() -> Result<()> {
    let (runtime, _clock) = test_runtime(vec![trial_conversion::workflow(Arc::new(AtomicUsize::new(0)))])?;
    runtime
        .run(runtime.instance(trial_conversion::TYPE)?, Some("doc-1".into()))
        .await?;

    let snapshot = runtime.load("doc-1").await?.expect("snapshot stored");
    let document = snapshot.to_json()?;

    assert_eq!(
        document,
        json!({
            "runId": "doc-1",
            "workflowType": "trial-conversion",
            "status": "suspended",
            "currentStep": "nurture",
            "state": { "userId": "user-1" },
            "actionMemo": {},
            "pendingResumeEntries": [
                {
                    "type": "event",
                    "resumeId": "nurture:plan-activated",
                    "filterCriteria": { "event": "plan.activated" }
                },
                {
                    "type": "timer",
                    "resumeId": "nurture:delay-0",
                    "resumeAfter": EPOCH_MILLIS + 300
                }
            ],
            "auditLog": []
        })
    );
    assert_eq!(Snapshot::from_json(document)?, snapshot);
    Ok(())
}

#[tokio::test]
async fn restored_instance_continues_where_it_stopped() -> Result<()> {
    let (runtime, _clock) = test_runtime(vec![trial_conversion::workflow(Arc::new(AtomicUsize::new(0)))])?;
    runtime
        .run(runtime.instance(trial_conversion::TYPE)?, Some("doc-2".into()))
        .await?;
    let snapshot = runtime.load("doc-2").await?.expect("snapshot stored");

    let instance = WorkflowInstance::from_snapshot(snapshot.clone());
    assert_eq!(instance.run_id(), Some("doc-2"));
    assert_eq!(instance.current_step(), "nurture");
    let pending: Vec<_> = instance
        .list_pending_resume()
        .into_iter()
        .map(ResumeEntry::resume_id)
        .collect();
    assert_eq!(pending, [trial_conversion::ACTIVATION, "nurture:delay-0"]);
    assert_eq!(instance.snapshot(), snapshot);
    Ok(())
}

#[tokio::test]
async fn audit_log_can_be_disabled() -> Result<()> {
    let clock = ManualClock::at_unix_millis(EPOCH_MILLIS);
    let runtime = WorkflowRuntime::builder(InMemoryStore::new())
        .register(onboarding::workflow(Arc::new(AtomicUsize::new(0))))
        .config(RuntimeConfig {
            audit_log: false,
            ..test_runtime_config()
        })
        .clock(clock)
        .build()?;

    runtime
        .run(runtime.instance(onboarding::TYPE)?, Some("quiet".into()))
        .await?;

    let snapshot = runtime.load("quiet").await?.expect("snapshot stored");
    assert!(snapshot.action_memo.contains("send-reminder"));
    assert_eq!(snapshot.audit_log, None);
    assert!(snapshot.to_json()?.get("auditLog").is_none());
    Ok(())
}

#[tokio::test]
async fn runs_share_a_store_handle() -> Result<()> {
    let (runtime, _clock) = test_runtime(vec![onboarding::workflow(Arc::new(AtomicUsize::new(0)))])?;
    let store = runtime.store().clone();

    for run_id in ["a", "b", "c"] {
        runtime
            .run(runtime.instance(onboarding::TYPE)?, Some(run_id.into()))
            .await?;
    }
    assert_eq!(store.len(), 3);

    let uow = store.begin("b").await?;
    let snapshot = uow.snapshot().cloned().expect("snapshot stored");
    drop(uow);
    assert_eq!(snapshot.run_id.as_deref(), Some("b"));
    assert_eq!(store.load("b").await?, Some(snapshot));
    Ok(())
}
