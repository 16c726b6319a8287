//! Durable workflow execution for JSON-defined step graphs.
//!
//! A workflow is a graph of steps (`begin`, `end`, `task`, `decision`,
//! `resumeAfter`, `waitForEvent`). flowstate runs it as a resumable state
//! machine:
//!
//! - **At-most-once actions**: side effects go through
//!   [`WorkflowInstance::with_action`], memoized by key for the life of the run
//! - **Suspension as data**: handlers return [`StepOutcome::Suspend`] with a
//!   timer or event [`ResumeEntry`]; nothing is held in a coroutine frame
//! - **Snapshots**: the whole run state is one JSON document, persisted by a
//!   [`SnapshotStore`] after every pass
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         WorkflowRuntime<S>                              │
//! │                                                                         │
//! │   1. Begin unit of work (locks the run id, loads the snapshot)          │
//! │   2. Resolve the addressed resume entry (resume only)                   │
//! │   3. Call the handler of the current step until it suspends,            │
//! │      finishes or fails                                                  │
//! │   4. Save the snapshot, commit the unit of work                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use flowstate::{FlowDefinition, InMemoryStore, RunResult, Tasks, Workflow, WorkflowRuntime};
//! use serde_json::{Value, json};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> flowstate::Result<()> {
//! let flow = FlowDefinition::from_json(r#"{
//!     "id": "greeting", "name": "Greeting", "version": "1",
//!     "steps": [
//!         { "id": "start", "name": "Start", "type": "begin" },
//!         { "id": "greet", "name": "Greet", "type": "task" },
//!         { "id": "end", "name": "End", "type": "end" }
//!     ],
//!     "connections": [
//!         { "id": "c1", "sourceStepId": "start", "targetStepId": "greet" },
//!         { "id": "c2", "sourceStepId": "greet", "targetStepId": "end" }
//!     ]
//! }"#)?;
//!
//! let tasks = Tasks::new().with("greet", |mut state: Value, _params: Option<Value>| async move {
//!     state["greeted"] = json!(true);
//!     Ok::<_, String>(state)
//! });
//!
//! let runtime = WorkflowRuntime::builder(InMemoryStore::new())
//!     .register(Workflow::from_flow(&flow, &tasks)?)
//!     .build()?;
//!
//! let result = runtime.run(runtime.instance("greeting")?, None).await?;
//! assert!(matches!(result, RunResult::Finished { ref state, .. } if state["greeted"] == true));
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

pub mod clock;
mod condition;
pub mod duration;
mod error;
pub mod flow;
mod instance;
pub mod runtime;
mod step;
pub mod store;
pub mod suspend;
mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::Condition;
pub use error::{Error, Result};
pub use flow::{FlowDefinition, FlowError, FlowErrorCode, SchemaValidator};
pub use instance::{
    ActionMemo, ActionOutput, AuditEntry, AuditOutcome, Execution, MemoEntry, Progress, RunStatus,
    Snapshot, WorkflowInstance,
};
pub use runtime::{ResumeRequest, RunResult, RuntimeBuilder, RuntimeConfig, WorkflowRuntime};
pub use step::{StepHandler, StepOutcome, Task, TaskError, Tasks};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{DueTimer, InMemoryStore, SnapshotStore, UnitOfWork};
pub use suspend::{EventWait, ResumeEntry};
pub use workflow::{Workflow, WorkflowBuilder};
