//! JSON flow definitions.
//!
//! A flow is a graph of typed steps joined by optionally conditioned
//! connections. It is the input of [`Workflow::from_flow`](crate::Workflow::from_flow).
//!
//! ```json
//! {
//!   "id": "user-onboarding",
//!   "name": "User Onboarding",
//!   "version": "1.0.0",
//!   "steps": [
//!     { "id": "start-flow", "name": "Start", "type": "begin" },
//!     { "id": "check-profile", "name": "Check", "type": "decision" },
//!     { "id": "end-flow", "name": "End", "type": "end" }
//!   ],
//!   "connections": [
//!     { "id": "c1", "sourceStepId": "start-flow", "targetStepId": "check-profile" },
//!     { "id": "c2", "sourceStepId": "check-profile", "targetStepId": "end-flow",
//!       "condition": "state.profileIsComplete == true" }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::Condition;
use crate::duration::parse_duration;
use crate::error::Result;

/// A parsed flow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_state_schema: Option<Value>,
    /// Initial state for new runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    pub steps: Vec<Step>,
    pub connections: Vec<Connection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// A node of the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Step type and its type-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepKind {
    Begin,
    End,
    #[serde(rename_all = "camelCase")]
    Task {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params_schema: Option<Value>,
    },
    Decision,
    ResumeAfter {
        /// e.g. `"10 minutes"`.
        duration: String,
    },
    #[serde(rename_all = "camelCase")]
    WaitForEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_input: Option<EventInput>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_output: Option<EventOutput>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Begin => "begin",
            StepKind::End => "end",
            StepKind::Task { .. } => "task",
            StepKind::Decision => "decision",
            StepKind::ResumeAfter { .. } => "resumeAfter",
            StepKind::WaitForEvent { .. } => "waitForEvent",
        }
    }
}

/// Filter criteria of a `waitForEvent` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_input_schema: Option<Value>,
}

/// Expected payload of a `waitForEvent` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutput {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_output_schema: Option<Value>,
}

/// A directed edge, optionally guarded by a condition over the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_step_id: String,
    pub target_step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Validation problem category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowErrorCode {
    ConnectionError,
    BeginStepError,
    DuplicateStepError,
    DurationError,
    ConditionError,
    GlobalStateValidationError,
    StepParamsValidationError,
    StepEventInputValidationError,
    StepEventOutputValidationError,
}

/// One validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowError {
    pub code: FlowErrorCode,
    pub message: String,
}

impl FlowError {
    fn new(code: FlowErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Checks a value against a JSON Schema.
///
/// Schema compilation lives outside this crate; plug a validator in to have
/// [`FlowDefinition::validate_with`] check state, params and event payloads.
pub trait SchemaValidator {
    /// `Ok(())` if `value` satisfies `schema`, otherwise the reasons it does not.
    fn validate(&self, schema: &Value, value: &Value) -> std::result::Result<(), Vec<String>>;
}

impl FlowDefinition {
    /// Parse a flow document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// The single `begin` step, if the flow has exactly one.
    pub fn begin_step(&self) -> Option<&Step> {
        let mut begins = self
            .steps
            .iter()
            .filter(|step| matches!(step.kind, StepKind::Begin));
        match (begins.next(), begins.next()) {
            (Some(step), None) => Some(step),
            _ => None,
        }
    }

    /// Outgoing connections of `step_id` in declaration order.
    pub fn outgoing<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .iter()
            .filter(move |conn| conn.source_step_id == step_id)
    }

    /// Structural checks. Returns every problem found.
    pub fn validate(&self) -> Vec<FlowError> {
        let mut errors = Vec::new();
        let mut ids = HashSet::new();

        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                errors.push(FlowError::new(
                    FlowErrorCode::DuplicateStepError,
                    format!("Step id '{}' is used more than once.", step.id),
                ));
            }
        }

        let begins = self
            .steps
            .iter()
            .filter(|step| matches!(step.kind, StepKind::Begin))
            .count();
        if begins != 1 {
            errors.push(FlowError::new(
                FlowErrorCode::BeginStepError,
                format!("Flow must have exactly one begin step, found {begins}."),
            ));
        }

        for conn in &self.connections {
            for (role, id) in [("Source", &conn.source_step_id), ("Target", &conn.target_step_id)] {
                if !ids.contains(id.as_str()) {
                    errors.push(FlowError::new(
                        FlowErrorCode::ConnectionError,
                        format!(
                            "Connection error on id={}: {role} step with ID '{id}' not found.",
                            conn.id
                        ),
                    ));
                }
            }
            if let Some(condition) = &conn.condition {
                if let Err(e) = Condition::parse(condition) {
                    errors.push(FlowError::new(
                        FlowErrorCode::ConditionError,
                        format!("Connection error on id={}: {e}", conn.id),
                    ));
                }
            }
        }

        for step in &self.steps {
            if let StepKind::ResumeAfter { duration } = &step.kind {
                if let Err(e) = parse_duration(duration) {
                    errors.push(FlowError::new(
                        FlowErrorCode::DurationError,
                        format!("Step '{}': {e}", step.id),
                    ));
                }
            }
        }

        errors
    }

    /// [`validate`](Self::validate) plus schema checks of the initial state,
    /// task params and event payloads.
    pub fn validate_with(&self, validator: &dyn SchemaValidator) -> Vec<FlowError> {
        let mut errors = self.validate();

        if let (Some(schema), Some(state)) = (&self.global_state_schema, &self.state) {
            if let Err(reasons) = validator.validate(schema, state) {
                errors.push(FlowError::new(
                    FlowErrorCode::GlobalStateValidationError,
                    format!("Global state validation error: {}", reasons.join("; ")),
                ));
            }
        }

        for step in &self.steps {
            match &step.kind {
                StepKind::Task {
                    params: Some(params),
                    params_schema: Some(schema),
                } => {
                    if let Err(reasons) = validator.validate(schema, params) {
                        errors.push(FlowError::new(
                            FlowErrorCode::StepParamsValidationError,
                            format!(
                                "Step '{}' parameters validation error: {}",
                                step.id,
                                reasons.join("; ")
                            ),
                        ));
                    }
                }
                StepKind::WaitForEvent {
                    event_input,
                    event_output,
                } => {
                    if let Some(EventInput {
                        value,
                        event_input_schema: Some(schema),
                    }) = event_input
                    {
                        if let Err(reasons) = validator.validate(schema, value) {
                            errors.push(FlowError::new(
                                FlowErrorCode::StepEventInputValidationError,
                                format!(
                                    "Step '{}' eventInput validation error: {}",
                                    step.id,
                                    reasons.join("; ")
                                ),
                            ));
                        }
                    }
                    if let Some(EventOutput {
                        value,
                        event_output_schema: Some(schema),
                    }) = event_output
                    {
                        if let Err(reasons) = validator.validate(schema, value) {
                            errors.push(FlowError::new(
                                FlowErrorCode::StepEventOutputValidationError,
                                format!(
                                    "Step '{}' eventOutput validation error: {}",
                                    step.id,
                                    reasons.join("; ")
                                ),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        errors
    }
}
