//! Workflows: a start step plus the handler for every step id.
//!
//! Build one by hand with [`Workflow::builder`], or from a JSON flow with
//! [`Workflow::from_flow`], which derives a handler from each step's type:
//!
//! | Step type      | Behaviour                                                    |
//! |----------------|--------------------------------------------------------------|
//! | `begin`        | advance to the successor                                     |
//! | `end`          | finish the run                                               |
//! | `task`         | run the step's task once (memoized by step id), replace state unless it returns `null` |
//! | `decision`     | first connection whose condition holds, else the unconditioned one, else finish |
//! | `resumeAfter`  | wait the declared duration, then advance                     |
//! | `waitForEvent` | wait for the event, merge an object payload into state, advance |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::condition::Condition;
use crate::duration::parse_duration;
use crate::error::{Error, Result};
use crate::flow::{FlowDefinition, StepKind};
use crate::instance::WorkflowInstance;
use crate::step::{StepHandler, StepOutcome, Task, Tasks};

/// A registered workflow type.
#[derive(Clone)]
pub struct Workflow {
    workflow_type: String,
    start_step: String,
    initial_state: Value,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<_> = self.handlers.keys().collect();
        steps.sort();
        f.debug_struct("Workflow")
            .field("workflow_type", &self.workflow_type)
            .field("start_step", &self.start_step)
            .field("steps", &steps)
            .finish()
    }
}

impl Workflow {
    /// Start building a workflow by hand.
    pub fn builder(workflow_type: impl Into<String>, start_step: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            workflow_type: workflow_type.into(),
            start_step: start_step.into(),
            initial_state: Value::Object(Map::new()),
            handlers: HashMap::new(),
        }
    }

    /// Derive a workflow from a flow definition.
    ///
    /// The flow's `id` becomes the workflow type. Every `task` step needs a
    /// task registered under its step id in `tasks`. Fails with
    /// [`Error::InvalidFlow`] if the flow does not validate.
    pub fn from_flow(flow: &FlowDefinition, tasks: &Tasks) -> Result<Self> {
        let errors = flow.validate();
        if !errors.is_empty() {
            let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
            return Err(Error::InvalidFlow(messages.join(" ")));
        }
        let begin = flow
            .begin_step()
            .ok_or_else(|| Error::InvalidFlow("flow has no begin step".into()))?;

        let mut builder = Workflow::builder(&flow.id, &begin.id)
            .initial_state(flow.state.clone().unwrap_or_else(|| Value::Object(Map::new())));

        for step in &flow.steps {
            let next = flow
                .outgoing(&step.id)
                .next()
                .map(|conn| conn.target_step_id.clone());

            builder = match &step.kind {
                StepKind::Begin => builder.step(&step.id, Pass { next }),
                StepKind::End => builder.step(&step.id, Pass { next: None }),
                StepKind::Task { params, .. } => {
                    let task = tasks.get(&step.id).ok_or_else(|| {
                        Error::InvalidFlow(format!("no task registered for step '{}'", step.id))
                    })?;
                    builder.step(
                        &step.id,
                        RunTask {
                            step_id: step.id.clone(),
                            task,
                            params: params.clone(),
                            next,
                        },
                    )
                }
                StepKind::Decision => {
                    let mut branches = Vec::new();
                    let mut fallback = None;
                    for conn in flow.outgoing(&step.id) {
                        match &conn.condition {
                            Some(source) => {
                                branches.push((Condition::parse(source)?, conn.target_step_id.clone()))
                            }
                            None => {
                                fallback.get_or_insert_with(|| conn.target_step_id.clone());
                            }
                        }
                    }
                    builder.step(
                        &step.id,
                        Decide {
                            step_id: step.id.clone(),
                            branches,
                            fallback,
                        },
                    )
                }
                StepKind::ResumeAfter { duration } => builder.step(
                    &step.id,
                    Delay {
                        step_id: step.id.clone(),
                        duration: parse_duration(duration)?,
                        next,
                    },
                ),
                StepKind::WaitForEvent { event_input, .. } => builder.step(
                    &step.id,
                    AwaitEvent {
                        step_id: step.id.clone(),
                        filter: event_input
                            .as_ref()
                            .map(|input| input.value.clone())
                            .unwrap_or(Value::Null),
                        next,
                    },
                ),
            };
        }

        builder.build()
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn start_step(&self) -> &str {
        &self.start_step
    }

    /// The handler registered for `step`.
    pub fn handler(&self, step: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step).cloned()
    }

    /// Registered step ids, sorted.
    pub fn step_ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// A new instance at the start step with the initial state.
    pub fn instance(&self) -> WorkflowInstance {
        WorkflowInstance::new(&self.workflow_type, &self.start_step)
            .with_state(self.initial_state.clone())
    }
}

/// Builder returned by [`Workflow::builder`].
pub struct WorkflowBuilder {
    workflow_type: String,
    start_step: String,
    initial_state: Value,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl WorkflowBuilder {
    /// Register the handler for `step_id`, replacing any earlier one.
    pub fn step(self, step_id: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        self.shared_step(step_id, Arc::new(handler))
    }

    /// Register a shared handler, e.g. one value dispatching several steps
    /// on [`WorkflowInstance::current_step`].
    pub fn shared_step(mut self, step_id: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(step_id.into(), handler);
        self
    }

    /// State given to instances created by [`Workflow::instance`].
    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }

    /// Fails with [`Error::MissingHandler`] if the start step has no handler.
    pub fn build(self) -> Result<Workflow> {
        if !self.handlers.contains_key(&self.start_step) {
            return Err(Error::MissingHandler(self.start_step));
        }
        Ok(Workflow {
            workflow_type: self.workflow_type,
            start_step: self.start_step,
            initial_state: self.initial_state,
            handlers: self.handlers,
        })
    }
}

fn advance_or_done(next: &Option<String>) -> StepOutcome {
    match next {
        Some(next) => StepOutcome::Advance(next.clone()),
        None => StepOutcome::Done,
    }
}

// ============================================================================
// Flow step handlers
// ============================================================================

/// `begin` and `end`.
struct Pass {
    next: Option<String>,
}

#[async_trait]
impl StepHandler for Pass {
    async fn handle(&self, _instance: &mut WorkflowInstance) -> Result<StepOutcome> {
        Ok(advance_or_done(&self.next))
    }
}

struct RunTask {
    step_id: String,
    task: Arc<dyn Task>,
    params: Option<Value>,
    next: Option<String>,
}

#[async_trait]
impl StepHandler for RunTask {
    async fn handle(&self, instance: &mut WorkflowInstance) -> Result<StepOutcome> {
        let state = instance.state().clone();
        let params = self.params.clone();
        let task = Arc::clone(&self.task);

        let output = instance
            .with_action(&self.step_id, move || async move { task.run(state, params).await })
            .await?;
        if !output.value.is_null() {
            instance.set_state(output.value)?;
        }

        Ok(advance_or_done(&self.next))
    }
}

struct Decide {
    step_id: String,
    branches: Vec<(Condition, String)>,
    fallback: Option<String>,
}

#[async_trait]
impl StepHandler for Decide {
    async fn handle(&self, instance: &mut WorkflowInstance) -> Result<StepOutcome> {
        let state = instance.state();
        let target = self
            .branches
            .iter()
            .find(|(condition, _)| condition.evaluate(state))
            .map(|(_, target)| target)
            .or(self.fallback.as_ref());

        let Some(target) = target else {
            warn!(step = %self.step_id, "No connection matched, finishing run");
            return Ok(StepOutcome::Done);
        };

        debug!(step = %self.step_id, target = %target, "Decision taken");
        Ok(StepOutcome::Advance(target.clone()))
    }
}

struct Delay {
    step_id: String,
    duration: Duration,
    next: Option<String>,
}

#[async_trait]
impl StepHandler for Delay {
    async fn handle(&self, instance: &mut WorkflowInstance) -> Result<StepOutcome> {
        if let Some(timer) = instance.wait_for(&self.step_id, self.duration)? {
            return Ok(StepOutcome::Suspend(timer));
        }
        Ok(advance_or_done(&self.next))
    }
}

struct AwaitEvent {
    step_id: String,
    filter: Value,
    next: Option<String>,
}

#[async_trait]
impl StepHandler for AwaitEvent {
    async fn handle(&self, instance: &mut WorkflowInstance) -> Result<StepOutcome> {
        let wait = instance.wait_for_event(&self.step_id, self.filter.clone())?;
        if let Some(token) = wait.suspension() {
            return Ok(StepOutcome::Suspend(token));
        }

        if let (Some(Value::Object(payload)), Value::Object(state)) =
            (wait.value(), instance.state_mut())
        {
            for (key, value) in payload {
                state.insert(key.clone(), value.clone());
            }
        }
        Ok(advance_or_done(&self.next))
    }
}
