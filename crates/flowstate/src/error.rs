//! Error types for flowstate.

use thiserror::Error;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in flowstate operations.
///
/// Expected run outcomes (a handler failing, a run suspending) are reported
/// through [`RunResult`](crate::RunResult), not through this type. The
/// runtime only returns `Err` for caller mistakes such as an unknown run id
/// and for store failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize state, action results or snapshots.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Workflow type was not registered with the runtime.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Workflow type was registered more than once.
    #[error("duplicate workflow type registration: {0}")]
    DuplicateWorkflowType(String),

    /// No snapshot exists for the run id.
    #[error("unknown run: {0}")]
    UnknownRun(String),

    /// The run has no unresolved suspension with this resume id.
    #[error("run {run_id} has no pending resume entry {resume_id}")]
    UnknownResume {
        /// The run that was addressed.
        run_id: String,
        /// The resume id that did not match.
        resume_id: String,
    },

    /// `run` was called with a run id that already has a snapshot.
    #[error("run already exists: {0}")]
    RunAlreadyExists(String),

    /// The run reached a terminal status and cannot be driven further.
    #[error("run {run_id} is {status}")]
    RunClosed {
        /// The run that was addressed.
        run_id: String,
        /// The terminal status it is in.
        status: String,
    },

    /// `retry` was called on a run that has not failed.
    #[error("run {0} has not failed")]
    RunNotFailed(String),

    /// The instance is positioned at a step with no registered handler.
    #[error("no handler registered for step {0}")]
    MissingHandler(String),

    /// A memoized action returned an error. Nothing was stored for the key.
    #[error("action {key} failed: {message}")]
    ActionFailed {
        /// The memo key of the action.
        key: String,
        /// The thunk's error rendered with `Display`.
        message: String,
    },

    /// A step handler gave up (permanent external failure and the like).
    #[error("step {step} failed: {message}")]
    Handler {
        /// The step whose handler failed.
        step: String,
        /// Human readable reason.
        message: String,
    },

    /// A step registered a timer and an event wait under the same key.
    #[error("resume id {resume_id} in step {step} is already registered as a different kind of wait")]
    ResumeIdConflict {
        /// The step that registered both waits.
        step: String,
        /// The shared resume id.
        resume_id: String,
    },

    /// A single run/resume pass invoked more handlers than allowed.
    #[error("step limit of {limit} exceeded at step {step}")]
    StepLimitExceeded {
        /// The configured budget.
        limit: usize,
        /// The step the instance was positioned at when the budget ran out.
        step: String,
    },

    /// A connection condition could not be parsed.
    #[error("invalid condition {expression:?}: {message}")]
    InvalidCondition {
        /// The source text of the condition.
        expression: String,
        /// What the parser rejected.
        message: String,
    },

    /// A `resumeAfter` duration could not be parsed.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    /// The flow definition cannot be turned into a workflow.
    #[error("invalid flow: {0}")]
    InvalidFlow(String),
}

impl Error {
    /// Create a handler error for the given step.
    pub fn handler(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Handler {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create an unknown resume error with context.
    pub fn unknown_resume(run_id: impl Into<String>, resume_id: impl Into<String>) -> Self {
        Error::UnknownResume {
            run_id: run_id.into(),
            resume_id: resume_id.into(),
        }
    }

    /// Create an invalid condition error with context.
    pub fn invalid_condition(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidCondition {
            expression: expression.into(),
            message: message.into(),
        }
    }
}
