//! The durable state machine instance.
//!
//! A [`WorkflowInstance`] is the whole persisted state of one run: where it
//! is positioned, the user state, which actions already ran and what the run
//! is waiting on. Step handlers receive `&mut WorkflowInstance` and use
//! [`with_action`](WorkflowInstance::with_action),
//! [`wait_for_ms`](WorkflowInstance::wait_for_ms) and
//! [`wait_for_event`](WorkflowInstance::wait_for_event) to make re-entry safe.
//!
//! # Re-entry
//!
//! A suspending step is not advanced past. When the run is resumed the same
//! handler runs again from the top:
//!
//! - actions already recorded in the memo return their stored result,
//! - waits find the entry they registered last time (same resume id) and
//!   only suspend again while it is unresolved.
//!
//! When a step advances, the resume entries it registered are dropped, so a
//! later visit to the same step (a loop) waits afresh.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock, unix_millis};
use crate::error::{Error, Result};
use crate::suspend::{EventWait, ResumeEntry, deserialize_some, resume_id};
use crate::workflow::Workflow;

// ============================================================================
// Persisted types
// ============================================================================

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    /// Created or being driven; not yet persisted at a resting point.
    #[default]
    Running,
    /// Parked on at least one resume entry.
    Suspended,
    /// Reached a step with no successor.
    Finished,
    /// A handler failed. The run can be retried.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Finished and cancelled runs never execute again.
    pub fn is_closed(self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One memoized action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoEntry {
    pub executed: bool,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
}

/// Action results keyed by the caller-chosen action key.
///
/// Append-only: a key, once recorded, is never removed or overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionMemo(BTreeMap<String, MemoEntry>);

impl ActionMemo {
    /// The recorded result for `key`, if the action already ran.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .get(key)
            .filter(|entry| entry.executed)
            .map(|entry| entry.result.as_ref().unwrap_or(&Value::Null))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|entry| entry.executed)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    fn record(&mut self, key: &str, result: Value) {
        self.0.entry(key.to_string()).or_insert(MemoEntry {
            executed: true,
            result: Some(result),
        });
    }
}

/// Outcome recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// An executed action, as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Step the instance was positioned at.
    pub step: String,
    /// The action key.
    pub action: String,
    /// Unix millis.
    pub timestamp: i64,
    pub outcome: AuditOutcome,
}

/// The persisted form of a [`WorkflowInstance`].
///
/// Serializes to the camelCase snapshot document stored per run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub workflow_type: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub current_step: String,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub action_memo: ActionMemo,
    #[serde(default)]
    pub pending_resume_entries: Vec<ResumeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<Vec<AuditEntry>>,
}

impl Snapshot {
    /// Parse a snapshot document.
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Render the snapshot document.
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Earliest deadline among unresolved timers of a suspended run.
    pub fn next_timer_due(&self) -> Option<i64> {
        if self.status != RunStatus::Suspended {
            return None;
        }
        self.pending_resume_entries
            .iter()
            .filter(|entry| !entry.is_resolved())
            .filter_map(ResumeEntry::resume_after)
            .min()
    }

    /// Resume ids of unresolved timers due at or before `now_millis`.
    pub fn due_timers(&self, now_millis: i64) -> Vec<String> {
        if self.status != RunStatus::Suspended {
            return Vec::new();
        }
        self.pending_resume_entries
            .iter()
            .filter(|entry| !entry.is_resolved())
            .filter(|entry| entry.resume_after().is_some_and(|at| at <= now_millis))
            .map(|entry| entry.resume_id().to_string())
            .collect()
    }
}

// ============================================================================
// Instance
// ============================================================================

/// Result of [`WorkflowInstance::with_action`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput<T> {
    pub value: T,
    /// `true` when the thunk ran in this call and an audit entry was appended.
    pub recorded: bool,
}

impl<T> ActionOutput<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

/// One unit of progress from [`WorkflowInstance::step_once`].
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// The handler moved the instance to this step.
    Advanced(String),
    /// The handler is waiting on this entry.
    Suspended(ResumeEntry),
    /// The run reached its end.
    Finished,
}

/// How [`WorkflowInstance::execute`] stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Finished,
    Suspended(ResumeEntry),
}

/// A resumable workflow run.
pub struct WorkflowInstance {
    run_id: Option<String>,
    workflow_type: String,
    status: RunStatus,
    error: Option<String>,
    current_step: String,
    state: Value,
    action_memo: ActionMemo,
    pending: Vec<ResumeEntry>,
    audit_log: Option<Vec<AuditEntry>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("run_id", &self.run_id)
            .field("workflow_type", &self.workflow_type)
            .field("status", &self.status)
            .field("current_step", &self.current_step)
            .field("state", &self.state)
            .field("action_memo", &self.action_memo)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl WorkflowInstance {
    /// Create a fresh instance positioned at `start_step`, with `null` state
    /// and the audit log enabled.
    pub fn new(workflow_type: impl Into<String>, start_step: impl Into<String>) -> Self {
        Self {
            run_id: None,
            workflow_type: workflow_type.into(),
            status: RunStatus::Running,
            error: None,
            current_step: start_step.into(),
            state: Value::Null,
            action_memo: ActionMemo::default(),
            pending: Vec::new(),
            audit_log: Some(Vec::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Rebuild an instance from its persisted form.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            run_id: snapshot.run_id,
            workflow_type: snapshot.workflow_type,
            status: snapshot.status,
            error: snapshot.error,
            current_step: snapshot.current_step,
            state: snapshot.state,
            action_memo: snapshot.action_memo,
            pending: snapshot.pending_resume_entries,
            audit_log: snapshot.audit_log,
            clock: Arc::new(SystemClock),
        }
    }

    /// The persisted form of this instance.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            run_id: self.run_id.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            error: self.error.clone(),
            current_step: self.current_step.clone(),
            state: self.state.clone(),
            action_memo: self.action_memo.clone(),
            pending_resume_entries: self.pending.clone(),
            audit_log: self.audit_log.clone(),
        }
    }

    /// Use `clock` for timer deadlines and audit timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the initial state.
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    /// Enable or disable the audit log. Disabling drops recorded entries.
    pub fn with_audit_log(mut self, enabled: bool) -> Self {
        self.set_audit_log(enabled);
        self
    }

    pub(crate) fn set_audit_log(&mut self, enabled: bool) {
        match (enabled, self.audit_log.is_some()) {
            (true, false) => self.audit_log = Some(Vec::new()),
            (false, true) => self.audit_log = None,
            _ => {}
        }
    }

    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub(crate) fn assign_run_id(&mut self, run_id: String) {
        self.run_id = Some(run_id);
    }

    #[cfg(test)]
    pub(crate) fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    /// Close the run and forget what it was waiting on.
    pub(crate) fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        self.pending.retain(ResumeEntry::is_resolved);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// The failure message of a failed run.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn current_step(&self) -> &str {
        &self.current_step
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Mutable access for handlers.
    pub fn state_mut(&mut self) -> &mut Value {
        &mut self.state
    }

    /// Deserialize the state into a typed shape.
    pub fn state_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.state.clone())?)
    }

    /// Replace the state. Rejected once the run is finished or cancelled.
    pub fn set_state(&mut self, state: Value) -> Result<()> {
        if self.status.is_closed() {
            return Err(self.closed_error());
        }
        self.state = state;
        Ok(())
    }

    pub fn action_memo(&self) -> &ActionMemo {
        &self.action_memo
    }

    pub fn audit_log(&self) -> Option<&[AuditEntry]> {
        self.audit_log.as_deref()
    }

    /// Every registered resume entry, resolved or not.
    pub fn resume_entries(&self) -> &[ResumeEntry] {
        &self.pending
    }

    /// The entries the run is still waiting on.
    pub fn list_pending_resume(&self) -> Vec<&ResumeEntry> {
        self.pending.iter().filter(|entry| !entry.is_resolved()).collect()
    }

    // ------------------------------------------------------------------------
    // Handler primitives
    // ------------------------------------------------------------------------

    /// Run `thunk` at most once per `key` over the lifetime of the run.
    ///
    /// On a memo hit the stored result is returned and `thunk` is dropped
    /// unused. On a miss the thunk runs, its value is stored and an audit
    /// entry is appended. A failing thunk stores nothing, appends a
    /// `failure` audit entry and surfaces [`Error::ActionFailed`].
    pub async fn with_action<T, F, Fut, E>(&mut self, key: &str, thunk: F) -> Result<ActionOutput<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        if let Some(result) = self.action_memo.get(key) {
            debug!(
                run_id = self.run_id.as_deref().unwrap_or_default(),
                step = %self.current_step,
                action = key,
                "Action memo hit"
            );
            let value = serde_json::from_value(result.clone())?;
            return Ok(ActionOutput {
                value,
                recorded: false,
            });
        }

        match thunk().await {
            Ok(value) => {
                let result = serde_json::to_value(&value)?;
                self.action_memo.record(key, result);
                self.audit(key, AuditOutcome::Success);
                Ok(ActionOutput {
                    value,
                    recorded: true,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    run_id = self.run_id.as_deref().unwrap_or_default(),
                    step = %self.current_step,
                    action = key,
                    error = %message,
                    "Action failed"
                );
                self.audit(key, AuditOutcome::Failure);
                Err(Error::ActionFailed {
                    key: key.to_string(),
                    message,
                })
            }
        }
    }

    /// Wait `millis` from the first call for this key in the current step.
    ///
    /// Returns the timer entry to suspend on while the deadline is in the
    /// future and `None` once it has passed. Fails if the key is already
    /// waiting on an event in this step.
    pub fn wait_for_ms(&mut self, key: &str, millis: u64) -> Result<Option<ResumeEntry>> {
        let id = resume_id(&self.current_step, key);
        let now = unix_millis(self.clock.now());

        let index = match self.position(&id, ResumeEntry::is_timer)? {
            Some(index) => index,
            None => {
                let deadline = now.saturating_add(i64::try_from(millis).unwrap_or(i64::MAX));
                self.pending.push(ResumeEntry::timer(id, deadline));
                self.pending.len() - 1
            }
        };

        if let ResumeEntry::Timer {
            resume_after,
            fired,
            ..
        } = &mut self.pending[index]
        {
            if !*fired && now >= *resume_after {
                *fired = true;
            }
            if *fired {
                return Ok(None);
            }
        }
        Ok(Some(self.pending[index].clone()))
    }

    /// [`wait_for_ms`](Self::wait_for_ms) taking a [`Duration`].
    pub fn wait_for(&mut self, key: &str, duration: Duration) -> Result<Option<ResumeEntry>> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.wait_for_ms(key, millis)
    }

    /// Register interest in an external event matching `filter_criteria`.
    ///
    /// Fails if the key is already waiting on a timer in this step.
    pub fn wait_for_event(&mut self, key: &str, filter_criteria: Value) -> Result<EventWait> {
        let id = resume_id(&self.current_step, key);
        let index = match self.position(&id, ResumeEntry::is_event)? {
            Some(index) => index,
            None => {
                self.pending.push(ResumeEntry::event(id, filter_criteria));
                self.pending.len() - 1
            }
        };
        Ok(EventWait::new(self.pending[index].clone()))
    }

    /// Resolve an outstanding entry.
    ///
    /// Events take `payload` (`null` when absent) as their delivered value.
    /// Timers are marked fired only when their deadline has passed; an early
    /// resume leaves the timer pending and returns `Ok(false)`.
    pub fn resolve(&mut self, resume_id: &str, payload: Option<Value>) -> Result<bool> {
        let now = unix_millis(self.clock.now());
        let run_id = self.run_id.clone().unwrap_or_default();
        let entry = self
            .pending
            .iter_mut()
            .find(|entry| entry.resume_id() == resume_id && !entry.is_resolved())
            .ok_or_else(|| Error::unknown_resume(&run_id, resume_id))?;

        match entry {
            ResumeEntry::Event { resumed_value, .. } => {
                *resumed_value = Some(payload.unwrap_or(Value::Null));
                Ok(true)
            }
            ResumeEntry::Timer {
                resume_after,
                fired,
                ..
            } => {
                if now >= *resume_after {
                    *fired = true;
                    Ok(true)
                } else {
                    warn!(
                        run_id = %run_id,
                        resume_id,
                        remaining_ms = *resume_after - now,
                        "Timer resumed before its deadline"
                    );
                    Ok(false)
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Run the handler for the current step once.
    pub async fn step_once(&mut self, workflow: &Workflow) -> Result<Progress> {
        if self.status.is_closed() {
            return Err(self.closed_error());
        }
        let step = self.current_step.clone();
        let handler = workflow
            .handler(&step)
            .ok_or_else(|| Error::MissingHandler(step.clone()))?;

        match handler.handle(self).await? {
            crate::step::StepOutcome::Advance(next) => {
                self.leave_step(&step);
                debug!(
                    run_id = self.run_id.as_deref().unwrap_or_default(),
                    from = %step,
                    to = %next,
                    "Step advanced"
                );
                self.current_step = next.clone();
                Ok(Progress::Advanced(next))
            }
            crate::step::StepOutcome::Suspend(entry) => {
                self.status = RunStatus::Suspended;
                Ok(Progress::Suspended(entry))
            }
            crate::step::StepOutcome::Done => {
                self.leave_step(&step);
                self.status = RunStatus::Finished;
                Ok(Progress::Finished)
            }
        }
    }

    /// Drive the instance from its current step until it suspends, finishes
    /// or fails.
    ///
    /// `max_steps` bounds the number of handler invocations. On error the
    /// instance is marked failed and stays at the failing step; actions
    /// recorded before the failure stay in the memo.
    pub async fn execute(&mut self, workflow: &Workflow, max_steps: Option<usize>) -> Result<Execution> {
        if self.status.is_closed() {
            return Err(self.closed_error());
        }
        self.status = RunStatus::Running;
        self.error = None;

        let mut steps = 0usize;
        loop {
            if max_steps.is_some_and(|limit| steps >= limit) {
                let err = Error::StepLimitExceeded {
                    limit: steps,
                    step: self.current_step.clone(),
                };
                return Err(self.fail(err));
            }
            steps += 1;

            match self.step_once(workflow).await {
                Ok(Progress::Advanced(_)) => {}
                Ok(Progress::Suspended(entry)) => return Ok(Execution::Suspended(entry)),
                Ok(Progress::Finished) => return Ok(Execution::Finished),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.status = RunStatus::Failed;
        self.error = Some(err.to_string());
        err
    }

    fn closed_error(&self) -> Error {
        Error::RunClosed {
            run_id: self.run_id.clone().unwrap_or_default(),
            status: self.status.to_string(),
        }
    }

    fn position(&self, id: &str, kind: fn(&ResumeEntry) -> bool) -> Result<Option<usize>> {
        match self.pending.iter().position(|entry| entry.resume_id() == id) {
            Some(index) if !kind(&self.pending[index]) => Err(Error::ResumeIdConflict {
                step: self.current_step.clone(),
                resume_id: id.to_string(),
            }),
            found => Ok(found),
        }
    }

    fn leave_step(&mut self, step: &str) {
        self.pending.retain(|entry| !entry.belongs_to(step));
    }

    fn audit(&mut self, action: &str, outcome: AuditOutcome) {
        let timestamp = unix_millis(self.clock.now());
        if let Some(log) = self.audit_log.as_mut() {
            log.push(AuditEntry {
                step: self.current_step.clone(),
                action: action.to_string(),
                timestamp,
                outcome,
            });
        }
    }
}
