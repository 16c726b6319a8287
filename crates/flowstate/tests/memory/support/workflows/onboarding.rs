//! User onboarding flow, defined as JSON.
//!
//! `start-flow` → `check-profile` (decision) → `send-reminder` (task) → `end-flow`.
//! Complete profiles skip the reminder.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flowstate::{FlowDefinition, Tasks, Workflow};
use serde_json::{Value, json};

pub const TYPE: &str = "user-onboarding";

pub fn definition() -> FlowDefinition {
    serde_json::from_value(json!({
        "id": TYPE,
        "name": "User Onboarding",
        "version": "1.0.0",
        "state": { "profileIsComplete": false },
        "steps": [
            { "id": "start-flow", "name": "Start", "type": "begin" },
            { "id": "check-profile", "name": "Check Profile", "type": "decision" },
            {
                "id": "send-reminder",
                "name": "Send Reminder",
                "type": "task",
                "params": { "channel": "email" }
            },
            { "id": "end-flow", "name": "End", "type": "end" }
        ],
        "connections": [
            { "id": "c1", "sourceStepId": "start-flow", "targetStepId": "check-profile" },
            {
                "id": "c2",
                "sourceStepId": "check-profile",
                "targetStepId": "end-flow",
                "condition": "state.profileIsComplete == true"
            },
            {
                "id": "c3",
                "sourceStepId": "check-profile",
                "targetStepId": "send-reminder",
                "condition": "state.profileIsComplete == false"
            },
            { "id": "c4", "sourceStepId": "send-reminder", "targetStepId": "end-flow" }
        ]
    }))
    .expect("onboarding flow is valid JSON")
}

/// The onboarding workflow; `reminders` counts task invocations.
pub fn workflow(reminders: Arc<AtomicUsize>) -> Workflow {
    let tasks = Tasks::new().with(
        "send-reminder",
        move |mut state: Value, params: Option<Value>| {
            let reminders = Arc::clone(&reminders);
            async move {
                reminders.fetch_add(1, Ordering::SeqCst);
                state["reminderSent"] = json!(true);
                state["reminderChannel"] = params.map(|p| p["channel"].clone()).unwrap_or(Value::Null);
                Ok::<_, String>(state)
            }
        },
    );
    Workflow::from_flow(&definition(), &tasks).expect("onboarding workflow builds")
}
