//! End-to-end scenarios: complete run lifecycles through the runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use flowstate::{
    AuditOutcome, Error, FlowDefinition, ResumeRequest, RunResult, RunStatus, Tasks, Workflow,
};
use serde_json::json;

use crate::support::helpers::test_runtime;
use crate::support::workflows::fork_join::{self, JobTracker};
use crate::support::workflows::ticket_routing::{self, Pager};
use crate::support::workflows::{onboarding, trial_conversion};

// ============================================================================
// Onboarding (JSON flow)
// ============================================================================

#[tokio::test]
async fn onboarding_complete_profile_skips_reminder() -> Result<()> {
    let reminders = Arc::new(AtomicUsize::new(0));
    let (runtime, _clock) = test_runtime(vec![onboarding::workflow(Arc::clone(&reminders))])?;

    let instance = runtime
        .instance(onboarding::TYPE)?
        .with_state(json!({ "profileIsComplete": true }));
    let result = runtime.run(instance, Some("onboard-1".into())).await?;

    match result {
        RunResult::Finished { state, .. } => {
            assert_eq!(state, json!({ "profileIsComplete": true }));
        }
        other => panic!("expected finished, got {other:?}"),
    }
    assert_eq!(reminders.load(Ordering::SeqCst), 0);

    let snapshot = runtime.load("onboard-1").await?.expect("snapshot stored");
    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.current_step, "end-flow");
    assert!(snapshot.action_memo.is_empty());
    Ok(())
}

#[tokio::test]
async fn onboarding_incomplete_profile_sends_one_reminder() -> Result<()> {
    let reminders = Arc::new(AtomicUsize::new(0));
    let (runtime, _clock) = test_runtime(vec![onboarding::workflow(Arc::clone(&reminders))])?;

    let result = runtime
        .run(runtime.instance(onboarding::TYPE)?, Some("onboard-2".into()))
        .await?;

    match result {
        RunResult::Finished { state, .. } => {
            assert_eq!(state["reminderSent"], true);
            assert_eq!(state["reminderChannel"], "email");
        }
        other => panic!("expected finished, got {other:?}"),
    }
    assert_eq!(reminders.load(Ordering::SeqCst), 1);

    let snapshot = runtime.load("onboard-2").await?.expect("snapshot stored");
    assert!(snapshot.action_memo.contains("send-reminder"));
    let audit = snapshot.audit_log.expect("audit log enabled");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].step, "send-reminder");
    assert_eq!(audit[0].action, "send-reminder");
    assert_eq!(audit[0].outcome, AuditOutcome::Success);
    Ok(())
}

#[tokio::test]
async fn same_input_reaches_same_terminal_state() -> Result<()> {
    let reminders = Arc::new(AtomicUsize::new(0));
    let (runtime, _clock) = test_runtime(vec![onboarding::workflow(Arc::clone(&reminders))])?;

    let mut finals = Vec::new();
    for run_id in ["det-1", "det-2"] {
        let instance = runtime
            .instance(onboarding::TYPE)?
            .with_state(json!({ "profileIsComplete": false, "userId": 7 }));
        runtime.run(instance, Some(run_id.into())).await?;
        let snapshot = runtime.load(run_id).await?.expect("snapshot stored");
        finals.push((snapshot.current_step, snapshot.state, snapshot.action_memo));
    }

    assert_eq!(finals[0], finals[1]);
    Ok(())
}

// ============================================================================
// Timers
// ============================================================================

fn cool_down_flow() -> Workflow {
    let flow: FlowDefinition = serde_json::from_value(json!({
        "id": "cool-down",
        "name": "Cool Down",
        "version": "1",
        "steps": [
            { "id": "begin", "name": "Begin", "type": "begin" },
            { "id": "pause", "name": "Pause", "type": "resumeAfter", "duration": "500ms" },
            { "id": "end", "name": "End", "type": "end" }
        ],
        "connections": [
            { "id": "c1", "sourceStepId": "begin", "targetStepId": "pause" },
            { "id": "c2", "sourceStepId": "pause", "targetStepId": "end" }
        ]
    }))
    .expect("cool-down flow is valid JSON");
    Workflow::from_flow(&flow, &Tasks::new()).expect("cool-down workflow builds")
}

#[tokio::test]
async fn early_resume_keeps_waiting_on_same_timer() -> Result<()> {
    let (runtime, clock) = test_runtime(vec![cool_down_flow()])?;

    let result = runtime
        .run(runtime.instance("cool-down")?, Some("cool-1".into()))
        .await?;
    let timer = result.resume_entry().cloned().expect("suspended on timer");
    assert_eq!(timer.resume_id(), "pause:pause");
    assert!(timer.is_timer());

    clock.advance(Duration::from_millis(499));
    let result = runtime
        .resume("cool-1", ResumeRequest::new(timer.resume_id()))
        .await?;
    assert_eq!(result.resume_entry(), Some(&timer));

    clock.advance(Duration::from_millis(1));
    let result = runtime
        .resume("cool-1", ResumeRequest::new(timer.resume_id()))
        .await?;
    assert!(result.is_finished());

    let snapshot = runtime.load("cool-1").await?.expect("snapshot stored");
    assert_eq!(snapshot.current_step, "end");
    assert!(snapshot.pending_resume_entries.is_empty());
    Ok(())
}

// ============================================================================
// Trial conversion (events and reminder schedule)
// ============================================================================

#[tokio::test]
async fn activation_payload_reaches_handler() -> Result<()> {
    let reminders = Arc::new(AtomicUsize::new(0));
    let (runtime, _clock) = test_runtime(vec![trial_conversion::workflow(Arc::clone(&reminders))])?;

    let result = runtime
        .run(runtime.instance(trial_conversion::TYPE)?, Some("trial-1".into()))
        .await?;
    assert_eq!(
        result.resume_entry().map(|e| e.resume_id()),
        Some("nurture:delay-0")
    );

    let pending = runtime.load("trial-1").await?.expect("snapshot stored");
    let ids: Vec<_> = pending
        .pending_resume_entries
        .iter()
        .map(|e| e.resume_id())
        .collect();
    assert_eq!(ids, [trial_conversion::ACTIVATION, "nurture:delay-0"]);

    let result = runtime
        .resume(
            "trial-1",
            ResumeRequest::new(trial_conversion::ACTIVATION)
                .with_payload(json!({ "planType": "paid" })),
        )
        .await?;

    match result {
        RunResult::Finished { state, .. } => {
            assert_eq!(state["planType"], "paid");
            assert_eq!(state["converted"], true);
            assert_eq!(state["userId"], "user-1");
        }
        other => panic!("expected finished, got {other:?}"),
    }
    assert_eq!(reminders.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn reminders_follow_schedule_until_activation() -> Result<()> {
    let reminders = Arc::new(AtomicUsize::new(0));
    let (runtime, clock) = test_runtime(vec![trial_conversion::workflow(Arc::clone(&reminders))])?;

    runtime
        .run(runtime.instance(trial_conversion::TYPE)?, Some("trial-2".into()))
        .await?;

    for (sent, delay) in trial_conversion::REMINDER_DELAYS_MS.iter().enumerate() {
        assert_eq!(runtime.fire_due_timers().await?, 0, "nothing due yet");
        clock.advance(Duration::from_millis(*delay));
        assert_eq!(runtime.fire_due_timers().await?, 1);
        assert_eq!(reminders.load(Ordering::SeqCst), sent + 1);
    }

    let snapshot = runtime.load("trial-2").await?.expect("snapshot stored");
    assert_eq!(snapshot.status, RunStatus::Suspended);
    assert_eq!(snapshot.next_timer_due(), None);
    assert_eq!(snapshot.action_memo.len(), 3);

    let result = runtime
        .resume(
            "trial-2",
            ResumeRequest::new(trial_conversion::ACTIVATION)
                .with_payload(json!({ "planType": "free" })),
        )
        .await?;
    match result {
        RunResult::Finished { state, .. } => assert_eq!(state["converted"], false),
        other => panic!("expected finished, got {other:?}"),
    }
    assert_eq!(reminders.load(Ordering::SeqCst), 3);
    Ok(())
}

// ============================================================================
// Fork-join polling
// ============================================================================

#[tokio::test]
async fn polling_loop_rechecks_after_each_backoff() -> Result<()> {
    let tracker = JobTracker::scripted([
        json!({ "resize": "running", "transcode": "running" }),
        json!({ "resize": "done", "transcode": "running" }),
        json!({ "resize": "done", "transcode": "failed" }),
    ]);
    let (runtime, clock) = test_runtime(vec![fork_join::workflow(Arc::clone(&tracker))])?;

    let result = runtime
        .run(runtime.instance(fork_join::TYPE)?, Some("fj-1".into()))
        .await?;
    assert_eq!(
        result.resume_entry().map(|e| e.resume_id()),
        Some("poll:backoff")
    );
    assert_eq!(tracker.checks(), 1);

    clock.advance(Duration::from_millis(fork_join::BACKOFF_MS));
    assert_eq!(runtime.fire_due_timers().await?, 1);
    assert_eq!(tracker.checks(), 2);

    let snapshot = runtime.load("fj-1").await?.expect("snapshot stored");
    assert_eq!(snapshot.status, RunStatus::Suspended);
    assert_eq!(snapshot.state["attempts"], 1);

    clock.advance(Duration::from_millis(fork_join::BACKOFF_MS));
    assert_eq!(runtime.fire_due_timers().await?, 1);
    assert_eq!(tracker.checks(), 3);

    let snapshot = runtime.load("fj-1").await?.expect("snapshot stored");
    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.state["failedJobs"], json!(["transcode"]));
    assert_eq!(
        snapshot.action_memo.keys().collect::<Vec<_>>(),
        ["check-0", "check-1", "check-2", "start-jobs"]
    );
    Ok(())
}

// ============================================================================
// Ticket routing (failure and retry)
// ============================================================================

#[tokio::test]
async fn failed_run_is_retried_without_repeating_actions() -> Result<()> {
    let pager = Pager::failing(1);
    let (runtime, _clock) = test_runtime(vec![ticket_routing::workflow(Arc::clone(&pager))])?;

    let instance = runtime
        .instance(ticket_routing::TYPE)?
        .with_state(json!({ "priority": "high" }));
    let result = runtime.run(instance, Some("ticket-1".into())).await?;

    match &result {
        RunResult::Error { error, .. } => {
            assert!(matches!(error, Error::ActionFailed { key, .. } if key == "page-oncall"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    let snapshot = runtime.load("ticket-1").await?.expect("snapshot stored");
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.current_step, "escalate");
    assert!(snapshot.error.as_deref().is_some_and(|e| e.contains("pager unavailable")));
    assert!(snapshot.action_memo.contains("notify-customer"));
    assert!(!snapshot.action_memo.contains("page-oncall"));
    let outcomes: Vec<_> = snapshot
        .audit_log
        .iter()
        .flatten()
        .map(|entry| (entry.action.as_str(), entry.outcome))
        .collect();
    assert_eq!(
        outcomes,
        [
            ("create-ticket", AuditOutcome::Success),
            ("notify-customer", AuditOutcome::Success),
            ("page-oncall", AuditOutcome::Failure),
        ]
    );

    let result = runtime.retry("ticket-1").await?;
    match result {
        RunResult::Finished { state, .. } => {
            assert_eq!(state["ticketId"], "T-1");
            assert_eq!(state["page"], 1);
        }
        other => panic!("expected finished, got {other:?}"),
    }
    assert_eq!(pager.tickets(), 1);
    assert_eq!(pager.notices(), 1);
    assert_eq!(pager.pages(), 1);

    let snapshot = runtime.load("ticket-1").await?.expect("snapshot stored");
    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.error, None);
    Ok(())
}

#[tokio::test]
async fn low_priority_tickets_are_queued() -> Result<()> {
    let pager = Pager::failing(0);
    let (runtime, _clock) = test_runtime(vec![ticket_routing::workflow(Arc::clone(&pager))])?;

    let instance = runtime
        .instance(ticket_routing::TYPE)?
        .with_state(json!({ "priority": "low" }));
    let result = runtime.run(instance, Some("ticket-2".into())).await?;

    assert!(result.is_finished());
    assert_eq!(pager.pages(), 0);
    let snapshot = runtime.load("ticket-2").await?.expect("snapshot stored");
    assert_eq!(snapshot.current_step, "queue");
    Ok(())
}
