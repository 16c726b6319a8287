//! Runtime for driving workflow runs.
//!
//! - [`WorkflowRuntime`]: starts, resumes, retries and cancels runs, persisting
//!   a snapshot after every pass, and runs the timer worker
//! - [`RuntimeBuilder`]: registers workflows and configures the runtime
//! - [`RuntimeConfig`]: timer polling, shutdown, step budget, audit log
//!
//! # Example
//!
//! ```ignore
//! use flowstate::{InMemoryStore, ResumeRequest, RunResult, WorkflowRuntime};
//!
//! let runtime = WorkflowRuntime::builder(InMemoryStore::new())
//!     .register(trial_conversion)
//!     .build()?;
//!
//! let result = runtime.run(runtime.instance("trial-conversion")?, None).await?;
//! if let RunResult::NeedResume { run_id, resume_entry } = result {
//!     runtime.resume(&run_id, ResumeRequest::new(resume_entry.resume_id())).await?;
//! }
//!
//! // Fire timers in the background until Ctrl+C
//! runtime.run_timers(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

mod config;
pub(crate) mod registry;
mod timer_worker;

pub use config::RuntimeConfig;
pub use registry::{ResumeRequest, RunResult, RuntimeBuilder, WorkflowRuntime};
