//! Timer worker that resumes runs whose timers are due.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::RuntimeConfig;
use super::registry::WorkflowRuntime;
use crate::store::SnapshotStore;

/// Polls the store for due timers and resumes them.
///
/// # Lifecycle
///
/// 1. Poll `list_due(now)` at `timer_poll_interval`
/// 2. Resume each due timer through the runtime (takes the run's lock)
/// 3. Repeat until shutdown signal
///
/// A timer that was already resolved by another caller in the meantime is
/// skipped by the runtime, so overlapping workers only cost a lookup.
pub(crate) struct TimerWorker<S>
where
    S: SnapshotStore,
{
    runtime: Arc<WorkflowRuntime<S>>,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S> TimerWorker<S>
where
    S: SnapshotStore,
{
    pub fn new(runtime: Arc<WorkflowRuntime<S>>, config: RuntimeConfig, worker_id: String) -> Self {
        Self {
            runtime,
            config,
            worker_id,
        }
    }

    /// Run the timer worker until shutdown signal.
    ///
    /// When the shutdown receiver signals, the worker finishes the current
    /// poll (if any) and exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.timer_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Timer worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.runtime.fire_due_timers().await {
                        Ok(0) => {}
                        Ok(fired) => debug!(worker_id = %self.worker_id, fired, "Fired due timers"),
                        Err(e) => error!(worker_id = %self.worker_id, error = %e, "Error processing timers"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Timer worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
