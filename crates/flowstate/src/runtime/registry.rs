//! Workflow registry, runtime builder and the run driver.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::RuntimeConfig;
use super::timer_worker::TimerWorker;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::instance::{Execution, RunStatus, Snapshot, WorkflowInstance};
use crate::store::{SnapshotStore, UnitOfWork};
use crate::suspend::ResumeEntry;
use crate::workflow::Workflow;

/// Registry mapping workflow types to workflows.
pub(crate) struct WorkflowRegistry {
    entries: HashMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn register(&mut self, workflow: Workflow) {
        self.entries
            .insert(workflow.workflow_type().to_string(), Arc::new(workflow));
    }

    /// Look up a workflow by type.
    pub(crate) fn get(&self, workflow_type: &str) -> Result<Arc<Workflow>> {
        self.entries
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| Error::UnknownWorkflowType(workflow_type.to_string()))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Builder for constructing a [`WorkflowRuntime`].
///
/// # Example
///
/// ```ignore
/// let runtime = WorkflowRuntime::builder(InMemoryStore::new())
///     .register(onboarding)
///     .register(trial_conversion)
///     .config(RuntimeConfig {
///         timer_poll_interval: Duration::from_millis(200),
///         ..Default::default()
///     })
///     .build()?;
/// ```
pub struct RuntimeBuilder<S>
where
    S: SnapshotStore,
{
    store: S,
    registry: WorkflowRegistry,
    duplicate_workflow_type: Option<String>,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
}

impl<S> RuntimeBuilder<S>
where
    S: SnapshotStore,
{
    fn new(store: S) -> Self {
        Self {
            store,
            registry: WorkflowRegistry::new(),
            duplicate_workflow_type: None,
            config: RuntimeConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Register a workflow under its workflow type.
    ///
    /// Each workflow type can only be registered once. Duplicate checks are
    /// deferred until build time.
    pub fn register(mut self, workflow: Workflow) -> Self {
        if self.registry.entries.contains_key(workflow.workflow_type()) {
            if self.duplicate_workflow_type.is_none() {
                self.duplicate_workflow_type = Some(workflow.workflow_type().to_string());
            }
            return self;
        }
        self.registry.register(workflow);
        self
    }

    /// Set the runtime configuration.
    ///
    /// If not called, uses [`RuntimeConfig::default()`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the clock used for timers and audit timestamps.
    ///
    /// If not called, uses the system clock.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<WorkflowRuntime<S>> {
        if let Some(workflow_type) = self.duplicate_workflow_type {
            return Err(Error::DuplicateWorkflowType(workflow_type));
        }
        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(WorkflowRuntime {
            store: self.store,
            registry: Arc::new(self.registry),
            config: self.config,
            clock: self.clock,
            worker_id,
        })
    }
}

/// Outcome of a `run`, `resume` or `retry` pass.
#[derive(Debug)]
pub enum RunResult {
    /// The run reached its end.
    Finished { run_id: String, state: Value },
    /// A handler failed. The snapshot is stored with status `failed`.
    Error { run_id: String, error: Error },
    /// The run is parked; `resume_entry` is what it is waiting on.
    NeedResume {
        run_id: String,
        resume_entry: ResumeEntry,
    },
}

impl RunResult {
    pub fn run_id(&self) -> &str {
        match self {
            RunResult::Finished { run_id, .. }
            | RunResult::Error { run_id, .. }
            | RunResult::NeedResume { run_id, .. } => run_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RunResult::Finished { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RunResult::Error { .. })
    }

    /// The entry a suspended run waits on.
    pub fn resume_entry(&self) -> Option<&ResumeEntry> {
        match self {
            RunResult::NeedResume { resume_entry, .. } => Some(resume_entry),
            _ => None,
        }
    }
}

/// Addresses one pending resume entry of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeRequest {
    pub resume_id: String,
    /// Delivered event payload. Ignored for timers.
    pub resume_payload: Option<Value>,
}

impl ResumeRequest {
    pub fn new(resume_id: impl Into<String>) -> Self {
        Self {
            resume_id: resume_id.into(),
            resume_payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.resume_payload = Some(payload);
        self
    }
}

/// Drives workflow instances and persists their snapshots.
///
/// Every operation on an existing run goes through the store's unit of work,
/// so concurrent calls for the same run id are serialized while distinct run
/// ids proceed in parallel.
///
/// # Lifecycle
///
/// 1. Create with [`WorkflowRuntime::builder()`]
/// 2. Register workflows with [`RuntimeBuilder::register()`]
/// 3. Build with [`RuntimeBuilder::build()`]
/// 4. Start runs with [`WorkflowRuntime::run()`], continue them with
///    [`WorkflowRuntime::resume()`]
/// 5. Optionally fire timers in the background with [`WorkflowRuntime::run_timers()`]
#[derive(Clone)]
pub struct WorkflowRuntime<S>
where
    S: SnapshotStore,
{
    store: S,
    registry: Arc<WorkflowRegistry>,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl<S> WorkflowRuntime<S>
where
    S: SnapshotStore,
{
    /// Create a new runtime builder.
    pub fn builder(store: S) -> RuntimeBuilder<S> {
        RuntimeBuilder::new(store)
    }

    /// Returns the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the worker identifier.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns the number of registered workflows.
    pub fn workflow_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns the store handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// A new instance of a registered workflow.
    pub fn instance(&self, workflow_type: &str) -> Result<WorkflowInstance> {
        Ok(self.registry.get(workflow_type)?.instance())
    }

    /// Start a run.
    ///
    /// Uses `run_id` if given, else the instance's own run id, else a fresh
    /// UUID. The snapshot is persisted whatever the outcome.
    pub async fn run(&self, mut instance: WorkflowInstance, run_id: Option<String>) -> Result<RunResult> {
        let workflow = self.registry.get(instance.workflow_type())?;
        let run_id = run_id
            .or_else(|| instance.run_id().map(str::to_string))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut uow = self.store.begin(&run_id).await?;
        if uow.snapshot().is_some() {
            return Err(Error::RunAlreadyExists(run_id));
        }

        instance.assign_run_id(run_id.clone());
        instance.set_clock(Arc::clone(&self.clock));
        instance.set_audit_log(self.config.audit_log);

        info!(
            run_id = %run_id,
            workflow_type = %workflow.workflow_type(),
            step = %instance.current_step(),
            "Run started"
        );

        let result = self.drive(&workflow, &mut instance).await;
        uow.save(instance.snapshot());
        uow.commit().await?;
        Ok(result)
    }

    /// Resolve a pending entry of a run and drive it on.
    ///
    /// Fails with [`Error::UnknownRun`] or [`Error::UnknownResume`] when the run
    /// or an unresolved entry with that id does not exist; the snapshot is
    /// left untouched in that case. A timer resumed before its deadline stays
    /// pending and the run suspends on it again.
    pub async fn resume(&self, run_id: &str, request: ResumeRequest) -> Result<RunResult> {
        let mut uow = self.store.begin(run_id).await?;
        let snapshot = uow
            .snapshot()
            .cloned()
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;
        let (workflow, mut instance) = self.restore(snapshot)?;

        let resolved = instance.resolve(&request.resume_id, request.resume_payload)?;
        if instance.status().is_closed() {
            return Err(Error::RunClosed {
                run_id: run_id.to_string(),
                status: instance.status().to_string(),
            });
        }

        debug!(
            run_id = %run_id,
            resume_id = %request.resume_id,
            resolved,
            "Resuming run"
        );

        let result = self.drive(&workflow, &mut instance).await;
        uow.save(instance.snapshot());
        uow.commit().await?;
        Ok(result)
    }

    /// Drive a failed run again from the step it failed at.
    ///
    /// Actions memoized before the failure are not re-run.
    pub async fn retry(&self, run_id: &str) -> Result<RunResult> {
        let mut uow = self.store.begin(run_id).await?;
        let snapshot = uow
            .snapshot()
            .cloned()
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;
        if snapshot.status != RunStatus::Failed {
            return Err(Error::RunNotFailed(run_id.to_string()));
        }
        let (workflow, mut instance) = self.restore(snapshot)?;

        info!(run_id = %run_id, step = %instance.current_step(), "Retrying failed run");

        let result = self.drive(&workflow, &mut instance).await;
        uow.save(instance.snapshot());
        uow.commit().await?;
        Ok(result)
    }

    /// Cancel a run. Its pending entries are dropped, so later resumes fail
    /// with [`Error::UnknownResume`]. Cancelling a cancelled run is a no-op.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let mut uow = self.store.begin(run_id).await?;
        let snapshot = uow
            .snapshot()
            .cloned()
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;

        match snapshot.status {
            RunStatus::Cancelled => return Ok(()),
            RunStatus::Finished => {
                return Err(Error::RunClosed {
                    run_id: run_id.to_string(),
                    status: snapshot.status.to_string(),
                });
            }
            _ => {}
        }

        let mut instance = WorkflowInstance::from_snapshot(snapshot);
        instance.cancel();
        uow.save(instance.snapshot());
        uow.commit().await?;

        info!(run_id = %run_id, "Run cancelled");
        Ok(())
    }

    /// The latest committed snapshot of a run.
    pub async fn load(&self, run_id: &str) -> Result<Option<Snapshot>> {
        self.store.load(run_id).await
    }

    /// Resume every timer that is due now. Returns how many were resumed.
    ///
    /// Failures of individual runs are logged and do not stop the sweep.
    pub async fn fire_due_timers(&self) -> Result<usize> {
        let due = self.store.list_due(self.clock.now()).await?;
        let mut fired = 0;

        for timer in due {
            match self
                .resume(&timer.run_id, ResumeRequest::new(timer.resume_id.clone()))
                .await
            {
                Ok(result) => {
                    fired += 1;
                    debug!(
                        run_id = %timer.run_id,
                        resume_id = %timer.resume_id,
                        finished = result.is_finished(),
                        "Timer fired"
                    );
                }
                Err(Error::UnknownResume { .. }) => {
                    debug!(
                        run_id = %timer.run_id,
                        resume_id = %timer.resume_id,
                        "Timer already resolved"
                    );
                }
                Err(e) => {
                    error!(
                        run_id = %timer.run_id,
                        resume_id = %timer.resume_id,
                        error = %e,
                        "Failed to fire timer"
                    );
                }
            }
        }

        Ok(fired)
    }

    /// Run the timer worker until `shutdown` completes.
    ///
    /// # Shutdown Behavior
    ///
    /// When the shutdown future completes:
    /// 1. The worker stops polling
    /// 2. The sweep in progress (if any) completes
    /// 3. Returns after at most `shutdown_timeout`
    pub async fn run_timers<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            worker_id = %self.worker_id,
            workflows = self.workflow_count(),
            "Runtime starting"
        );

        let runtime = Arc::new(self.clone());
        let worker = TimerWorker::new(
            Arc::clone(&runtime),
            self.config.clone(),
            format!("{}-timer", self.worker_id),
        );
        let handle = tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        });

        shutdown.await;
        let _ = shutdown_tx.send(true);

        let shutdown_timeout = self.config.shutdown_timeout;
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(_) => {
                info!(worker_id = %self.worker_id, "Runtime stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }

        Ok(())
    }

    fn restore(&self, snapshot: Snapshot) -> Result<(Arc<Workflow>, WorkflowInstance)> {
        let workflow = self.registry.get(&snapshot.workflow_type)?;
        let instance = WorkflowInstance::from_snapshot(snapshot).with_clock(Arc::clone(&self.clock));
        Ok((workflow, instance))
    }

    async fn drive(&self, workflow: &Workflow, instance: &mut WorkflowInstance) -> RunResult {
        let run_id = instance.run_id().unwrap_or_default().to_string();

        match instance.execute(workflow, self.config.max_steps_per_pass).await {
            Ok(Execution::Finished) => {
                info!(run_id = %run_id, step = %instance.current_step(), "Run finished");
                RunResult::Finished {
                    run_id,
                    state: instance.state().clone(),
                }
            }
            Ok(Execution::Suspended(resume_entry)) => {
                info!(
                    run_id = %run_id,
                    step = %instance.current_step(),
                    resume_id = %resume_entry.resume_id(),
                    "Run suspended"
                );
                RunResult::NeedResume {
                    run_id,
                    resume_entry,
                }
            }
            Err(error) => {
                warn!(
                    run_id = %run_id,
                    step = %instance.current_step(),
                    error = %error,
                    "Run failed"
                );
                RunResult::Error { run_id, error }
            }
        }
    }
}
