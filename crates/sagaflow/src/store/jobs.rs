//! Job and timer queue operations used by the runtime workers.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::variables::Variables;
use crate::workflow::{InstanceKey, InstanceRef};

/// A claimed task activation, ready for a job handler.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Job key (UUID v7). Also the completion token.
    pub key: Uuid,
    /// The instance that activated the task.
    pub instance: InstanceRef,
    /// Task type routed to a job handler.
    pub task_type: String,
    /// Variables snapshot taken when the activation was created.
    pub variables: Variables,
    /// Number of previous failed attempts (0 for first try).
    pub attempts: u32,
    /// Error recorded by the last failed attempt.
    pub last_error: Option<String>,
    /// When the activation was created.
    pub created_at: OffsetDateTime,
}

/// A job whose failure needs operator attention.
///
/// Raised when retries are exhausted or a handler reports a non-retryable
/// failure. Incidents stay in the store until resolved; the job is not
/// delivered again in the meantime.
#[derive(Debug, Clone)]
pub struct Incident {
    /// The failed job.
    pub job_key: Uuid,
    /// The instance the job belongs to.
    pub instance: InstanceRef,
    /// Task type of the failed job.
    pub task_type: String,
    /// Number of failed attempts.
    pub attempts: u32,
    /// The last error message.
    pub error: String,
    /// When the incident was raised.
    pub raised_at: OffsetDateTime,
}

/// Query parameters for fetching incidents.
///
/// Use the builder methods to filter by process, instance or task type.
#[derive(Debug, Clone, Default)]
pub struct IncidentQuery {
    /// Filter by process definition id.
    pub process_id: Option<String>,
    /// Filter by instance.
    pub instance: Option<InstanceKey>,
    /// Filter by task type.
    pub task_type: Option<String>,
    /// Maximum number of results to return.
    pub limit: Option<u32>,
}

impl IncidentQuery {
    /// Create a new empty query (matches all incidents).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by process definition id.
    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    /// Filter by instance.
    pub fn instance(mut self, instance: InstanceKey) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Filter by task type.
    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if the incident passes every filter.
    pub(crate) fn matches(&self, incident: &Incident) -> bool {
        self.process_id
            .as_deref()
            .is_none_or(|p| incident.instance.process_id() == p)
            && self.instance.is_none_or(|k| incident.instance.key() == k)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| incident.task_type == t)
    }
}

/// A claimed due timer.
#[derive(Debug, Clone)]
pub struct TimerRecord {
    /// Timer id (UUID v7).
    pub id: Uuid,
    /// The instance the timer belongs to.
    pub instance: InstanceRef,
    /// Timer key, if scheduled with one.
    pub key: Option<String>,
    /// The payload to deliver as JSON.
    pub payload: Value,
    /// When the timer was due.
    pub fire_at: OffsetDateTime,
    /// Number of previous failed deliveries.
    pub attempts: u32,
}

/// A pending (not yet delivered) timer, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTimer {
    /// Timer key, if scheduled with one.
    pub key: Option<String>,
    /// When the timer fires.
    pub fire_at: OffsetDateTime,
    /// The payload as JSON.
    pub payload: Value,
}

/// Storage operations for job and timer processing.
///
/// # Locking Protocol
///
/// Jobs and timers are claimed using lease-style locking:
/// 1. `claim_*` atomically selects and locks one item
/// 2. The item is locked for `lock_duration` on the store clock
/// 3. Completion or failure must be recorded before the lock expires
/// 4. If a worker crashes, the lock expires and another worker can claim it
pub trait JobStore: Send + Sync + Clone + 'static {
    /// Claim the next activatable job of one of `task_types`.
    ///
    /// Returns `None` if nothing is available. Jobs in backoff, locked by
    /// another worker, completed or carrying an incident are skipped.
    fn claim_job(
        &self,
        worker_id: &str,
        task_types: &[String],
        lock_duration: Duration,
    ) -> impl Future<Output = crate::Result<Option<JobRecord>>> + Send;

    /// Mark a job as completed.
    ///
    /// Fails with [`Error::JobNotFound`](crate::Error::JobNotFound) if the
    /// job is unknown or was already completed.
    fn complete_job(&self, job_key: Uuid) -> impl Future<Output = crate::Result<()>> + Send;

    /// Record a retryable failure and delay the next delivery by `backoff`.
    ///
    /// Increments `attempts` and records the error message.
    fn record_job_failure(
        &self,
        job_key: Uuid,
        error: &str,
        backoff: Duration,
    ) -> impl Future<Output = crate::Result<()>> + Send;

    /// Record a final failure and raise an incident for the job.
    fn raise_incident(
        &self,
        job_key: Uuid,
        error: &str,
    ) -> impl Future<Output = crate::Result<Incident>> + Send;

    /// Fetch open incidents matching the query, oldest first.
    fn fetch_incidents(
        &self,
        query: &IncidentQuery,
    ) -> impl Future<Output = crate::Result<Vec<Incident>>> + Send;

    /// Resolve an incident, making the job activatable again.
    ///
    /// Resets the job's attempts to 0. Returns `Ok(true)` if an open
    /// incident was found, `Ok(false)` otherwise.
    fn resolve_incident(&self, job_key: Uuid) -> impl Future<Output = crate::Result<bool>> + Send;

    /// Claim the next due timer.
    ///
    /// A timer is due when `fire_at <= now` on the store clock.
    fn claim_timer(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> impl Future<Output = crate::Result<Option<TimerRecord>>> + Send;

    /// Mark a timer as delivered.
    fn mark_timer_processed(&self, timer_id: Uuid) -> impl Future<Output = crate::Result<()>> + Send;

    /// Record a timer delivery failure and delay the next attempt by `backoff`.
    fn record_timer_failure(
        &self,
        timer_id: Uuid,
        error: &str,
        backoff: Duration,
    ) -> impl Future<Output = crate::Result<()>> + Send;
}
