//! Step handlers and task functions.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::instance::WorkflowInstance;
use crate::suspend::ResumeEntry;

/// What a handler decided for the current step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Move to the named step.
    Advance(String),
    /// Stay at the current step until the entry is resolved.
    Suspend(ResumeEntry),
    /// The run is complete.
    Done,
}

impl StepOutcome {
    pub fn advance(next: impl Into<String>) -> Self {
        StepOutcome::Advance(next.into())
    }
}

/// Logic for one step.
///
/// A handler is re-run from the top every time the instance is driven at its
/// step, so anything with side effects belongs inside
/// [`WorkflowInstance::with_action`] and any wait goes through
/// [`WorkflowInstance::wait_for_ms`] or [`WorkflowInstance::wait_for_event`].
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use flowstate::{Result, StepHandler, StepOutcome, WorkflowInstance};
///
/// struct Cooldown;
///
/// #[async_trait]
/// impl StepHandler for Cooldown {
///     async fn handle(&self, instance: &mut WorkflowInstance) -> Result<StepOutcome> {
///         if let Some(timer) = instance.wait_for_ms("cooldown", 500)? {
///             return Ok(StepOutcome::Suspend(timer));
///         }
///         Ok(StepOutcome::advance("next"))
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, instance: &mut WorkflowInstance) -> Result<StepOutcome>;
}

/// Error returned by a [`Task`], rendered to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError(pub String);

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TaskError {}

/// A user function run by a flow `task` step: `(state, params) -> state`.
///
/// Any async closure of that shape whose error type implements `Display`
/// is a task.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, state: Value, params: Option<Value>) -> std::result::Result<Value, TaskError>;
}

#[async_trait]
impl<F, Fut, E> Task for F
where
    F: Fn(Value, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, E>> + Send,
    E: fmt::Display + Send,
{
    async fn run(&self, state: Value, params: Option<Value>) -> std::result::Result<Value, TaskError> {
        (self)(state, params)
            .await
            .map_err(|e| TaskError(e.to_string()))
    }
}

/// Task functions by step id.
#[derive(Clone, Default)]
pub struct Tasks {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl Tasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the task run by step `step_id`.
    pub fn with(mut self, step_id: impl Into<String>, task: impl Task + 'static) -> Self {
        self.tasks.insert(step_id.into(), Arc::new(task));
        self
    }

    pub fn get(&self, step_id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(step_id).cloned()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.tasks.contains_key(step_id)
    }
}

impl fmt::Debug for Tasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.tasks.keys().collect();
        names.sort();
        f.debug_struct("Tasks").field("steps", &names).finish()
    }
}
