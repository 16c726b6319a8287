//! End-to-end scenarios against PostgreSQL.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flowstate::{Clock, Error, ResumeRequest, RunResult, SnapshotStore};
use serde_json::json;
use test_utils::db_test;

use crate::support::helpers::{pg_runtime, status_column};
use crate::support::workflows::ticket_routing::{self, Pager};
use crate::support::workflows::trial_conversion;

db_test!(trial_conversion_survives_store_round_trips, |pool| {
    let reminders = Arc::new(AtomicUsize::new(0));
    let (runtime, clock) = pg_runtime(pool, vec![trial_conversion::workflow(Arc::clone(&reminders))])?;

    let result = runtime
        .run(runtime.instance(trial_conversion::TYPE)?, Some("trial-pg".into()))
        .await?;
    assert!(matches!(result, RunResult::NeedResume { .. }));

    clock.advance(Duration::from_millis(300));
    assert_eq!(runtime.fire_due_timers().await?, 1);
    assert_eq!(reminders.load(Ordering::SeqCst), 1);

    let result = runtime
        .resume(
            "trial-pg",
            ResumeRequest::new(trial_conversion::ACTIVATION)
                .with_payload(json!({ "planType": "paid" })),
        )
        .await?;
    match result {
        RunResult::Finished { state, .. } => assert_eq!(state["converted"], true),
        other => panic!("expected finished, got {other:?}"),
    }
    assert_eq!(status_column(pool, "trial-pg").await?.as_deref(), Some("finished"));
    assert!(runtime.store().list_due(clock.now() + Duration::from_secs(3600)).await?.is_empty());
    Ok(())
});

db_test!(concurrent_resumes_are_serialized, |pool| {
    let (runtime, _clock) = pg_runtime(pool, vec![trial_conversion::workflow(Arc::new(AtomicUsize::new(0)))])?;
    runtime
        .run(runtime.instance(trial_conversion::TYPE)?, Some("race".into()))
        .await?;

    let request =
        ResumeRequest::new(trial_conversion::ACTIVATION).with_payload(json!({ "planType": "paid" }));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let runtime = runtime.clone();
            let request = request.clone();
            tokio::spawn(async move { runtime.resume("race", request).await })
        })
        .collect();

    let mut finished = 0;
    for handle in handles {
        match handle.await? {
            Ok(result) if result.is_finished() => finished += 1,
            Err(Error::UnknownResume { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(finished, 1);
    Ok(())
});

db_test!(failed_run_retries_from_failing_step, |pool| {
    let pager = Pager::failing(1);
    let (runtime, _clock) = pg_runtime(pool, vec![ticket_routing::workflow(Arc::clone(&pager))])?;

    let instance = runtime
        .instance(ticket_routing::TYPE)?
        .with_state(json!({ "priority": "high" }));
    let result = runtime.run(instance, Some("ticket-pg".into())).await?;
    assert!(result.is_error());
    assert_eq!(status_column(pool, "ticket-pg").await?.as_deref(), Some("failed"));

    assert!(runtime.retry("ticket-pg").await?.is_finished());
    assert_eq!((pager.tickets(), pager.notices(), pager.pages()), (1, 1, 1));
    Ok(())
});
