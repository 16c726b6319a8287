//! Runtime configuration.

use std::time::Duration;

/// Configuration for the workflow runtime.
///
/// Controls the timer worker, shutdown, the per-pass step budget and whether
/// new runs keep an audit log.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use flowstate::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     timer_poll_interval: Duration::from_millis(250),
///     max_steps_per_pass: Some(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often the timer worker polls for due timers.
    ///
    /// Timer precision is limited by this interval.
    /// Default: 1 second.
    pub timer_poll_interval: Duration,

    /// Maximum time to wait for the timer worker during shutdown.
    ///
    /// After this timeout, the runtime will force stop.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Maximum handler invocations in one `run`, `resume` or `retry` pass.
    ///
    /// Guards against steps that keep looping without suspending. A pass that
    /// exceeds it fails the run. `None` disables the guard.
    /// Default: 10 000.
    pub max_steps_per_pass: Option<usize>,

    /// Whether runs started by the runtime record an audit log.
    /// Default: true.
    pub audit_log: bool,

    /// Worker identifier used in logs.
    ///
    /// If `None`, a UUID is generated when the runtime is built.
    pub worker_id: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timer_poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            max_steps_per_pass: Some(10_000),
            audit_log: true,
            worker_id: None,
        }
    }
}
