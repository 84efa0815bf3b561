//! Runtime and engine configuration.

use std::time::Duration;

use crate::job::RetryPolicy;
use crate::projection::ProjectionConfig;

/// Configuration for the job and timer runtime.
///
/// Controls polling intervals, lock durations, retry behavior, and worker
/// concurrency.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::runtime::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     job_poll_interval: Duration::from_millis(50),
///     timer_poll_interval: Duration::from_millis(500),
///     job_workers: 4,  // Up to 4 handlers in parallel
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often to poll for activatable jobs.
    ///
    /// Lower values reduce latency but increase store load.
    /// Default: 100ms.
    pub job_poll_interval: Duration,

    /// How often to poll for due timers.
    ///
    /// Timer precision is limited by this interval.
    /// Default: 1 second.
    pub timer_poll_interval: Duration,

    /// How long to hold a lock on a job while its handler runs.
    ///
    /// Should be longer than the slowest expected handler. If a worker
    /// crashes, the job becomes activatable again after this duration.
    /// Default: 5 minutes.
    pub job_lock_duration: Duration,

    /// How long to hold a lock on a timer while it is delivered.
    ///
    /// Default: 5 minutes.
    pub timer_lock_duration: Duration,

    /// Maximum time to wait for in-flight work during shutdown.
    ///
    /// After this timeout, the runtime will force stop.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Retry policy for handlers registered without their own.
    ///
    /// Also paces redelivery of timers whose transition failed.
    pub retry_policy: RetryPolicy,

    /// Worker identifier recorded in logs and lock diagnostics.
    ///
    /// If `None`, a UUID is generated when the engine is built.
    pub worker_id: Option<String>,

    /// Number of job workers to spawn.
    ///
    /// Each worker claims jobs independently; claims are exclusive, so a job
    /// is handed to one worker at a time. Default: 1.
    pub job_workers: usize,

    /// Number of timer workers to spawn.
    ///
    /// Default: 1.
    pub timer_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            job_poll_interval: Duration::from_millis(100),
            timer_poll_interval: Duration::from_secs(1),
            job_lock_duration: Duration::from_secs(300), // 5 minutes
            timer_lock_duration: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            worker_id: None,
            job_workers: 1,
            timer_workers: 1,
        }
    }
}

/// Configuration for the gateway side of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long `send_message` waits for an instance to bind the key.
    ///
    /// Messages are never buffered beyond this. Default: 10 seconds.
    pub message_ttl: Duration,

    /// Instance-summary projection settings.
    pub projection: ProjectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(10),
            projection: ProjectionConfig::default(),
        }
    }
}
