//! Job worker for processing task activations.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::registry::WorkflowRuntime;
use crate::error::Result;
use crate::job::{ActivatedJob, HandlerFailure, RetryPolicy};
use crate::store::{EngineStore, JobRecord};
use crate::workflow::Signal;

/// Job worker that polls the store for activatable jobs.
///
/// The worker runs in a loop, claiming jobs one at a time and processing
/// them sequentially. Handler output is routed back to the owning instance
/// as a `TaskCompleted` signal.
///
/// # Lifecycle
///
/// 1. Poll for an activatable job at `job_poll_interval`
/// 2. Claim job (atomic lock with timeout)
/// 3. Look up handler by `task_type`
/// 4. Call handler with the job's declared input variables
/// 5. Deliver `TaskCompleted` with the output variables to the instance
/// 6. Complete the job, or record the failure with backoff or an incident
/// 7. Repeat until shutdown signal
pub(crate) struct JobWorker<S>
where
    S: EngineStore,
{
    runtime: Arc<WorkflowRuntime<S>>,
    task_types: Vec<String>,
    worker_id: String,
}

impl<S> JobWorker<S>
where
    S: EngineStore,
{
    /// Create a new job worker for every registered task type.
    pub(crate) fn new(runtime: Arc<WorkflowRuntime<S>>, worker_id: String) -> Self {
        let task_types = runtime.handlers.task_types();
        Self {
            runtime,
            task_types,
            worker_id,
        }
    }

    /// Run the job worker until shutdown signal.
    ///
    /// When the shutdown receiver signals, the worker finishes processing
    /// the current job (if any) and exits.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.runtime.config.job_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            worker_id = %self.worker_id,
            task_types = ?self.task_types,
            "Job worker started"
        );

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.process_one().await {
                        error!(worker_id = %self.worker_id, error = %e, "Error processing job");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Job worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Try to claim and process one job.
    ///
    /// Returns `Ok(true)` if a job was claimed, whatever its outcome.
    pub(crate) async fn process_one(&self) -> Result<bool> {
        if self.task_types.is_empty() {
            return Ok(false);
        }

        let store = &self.runtime.store;
        let Some(job) = store
            .claim_job(
                &self.worker_id,
                &self.task_types,
                self.runtime.config.job_lock_duration,
            )
            .await?
        else {
            return Ok(false); // No jobs available
        };

        let Some(registered) = self.runtime.handlers.get(&job.task_type) else {
            // Claims only cover registered task types
            let incident = store
                .raise_incident(job.key, &format!("no handler for task type '{}'", job.task_type))
                .await?;
            warn!(job_key = %incident.job_key, task_type = %incident.task_type, "Incident raised: no handler");
            return Ok(true);
        };

        let attempt = job.attempts + 1;
        let variables = match registered.handler.fetch_variables() {
            Some(names) => job.variables.select(names),
            None => job.variables.clone(),
        };
        let activated = ActivatedJob {
            key: job.key,
            task_type: job.task_type.clone(),
            instance: job.instance.clone(),
            variables,
            attempt,
            retries_remaining: registered.retry_policy.retries_remaining(attempt),
            created_at: job.created_at,
        };

        debug!(
            job_key = %job.key,
            instance = %job.instance,
            task_type = %job.task_type,
            attempt,
            "Processing job"
        );

        let output = match registered.handler.handle(&activated).await {
            Ok(output) => output,
            Err(failure) => {
                self.record_failure(&job, &registered.retry_policy, failure)
                    .await?;
                return Ok(true);
            }
        };

        let signal = Signal::TaskCompleted {
            task_type: job.task_type.clone(),
            job_key: job.key,
            variables: output,
        };

        // NOTE: Not atomic with `complete_job`; a crash in between redelivers the job.
        match self.runtime.deliver(&job.instance, signal).await {
            Ok(_) => {
                store.complete_job(job.key).await?;
                debug!(job_key = %job.key, task_type = %job.task_type, "Job completed");
            }
            Err(e) => {
                let failure = HandlerFailure {
                    message: format!("failed to report completion: {e}"),
                    retryable: e.is_retryable(),
                };
                self.record_failure(&job, &registered.retry_policy, failure)
                    .await?;
            }
        }

        Ok(true)
    }

    /// Retry with backoff, or raise an incident once retries are exhausted.
    async fn record_failure(
        &self,
        job: &JobRecord,
        policy: &RetryPolicy,
        failure: HandlerFailure,
    ) -> Result<()> {
        let attempt = job.attempts + 1;
        let store = &self.runtime.store;

        if failure.retryable && policy.should_retry(attempt) {
            let backoff = policy.backoff_duration(attempt);
            warn!(
                job_key = %job.key,
                task_type = %job.task_type,
                error = %failure,
                attempt,
                backoff_ms = backoff.as_millis(),
                "Job failed, will retry"
            );
            store
                .record_job_failure(job.key, &failure.message, backoff)
                .await
        } else {
            let incident = store.raise_incident(job.key, &failure.message).await?;
            warn!(
                job_key = %incident.job_key,
                instance = %incident.instance,
                task_type = %incident.task_type,
                error = %incident.error,
                attempts = incident.attempts,
                retryable = failure.retryable,
                "Incident raised"
            );
            Ok(())
        }
    }
}
