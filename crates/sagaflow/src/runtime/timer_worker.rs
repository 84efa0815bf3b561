//! Timer worker for delivering due timers to their instances.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::registry::WorkflowRuntime;
use crate::error::Result;
use crate::store::EngineStore;
use crate::workflow::Signal;

/// Timer worker that polls the store for due timers.
///
/// The worker runs in a loop, claiming timers one at a time in fire-time
/// order and delivering each as a `Timer` signal to the owning instance.
/// A timer whose instance already completed, or that the workflow ignores,
/// is still marked processed.
///
/// # Lifecycle
///
/// 1. Poll for due timers at `timer_poll_interval`
/// 2. Claim timer (atomic lock with timeout)
/// 3. Deliver the payload to the instance's definition
/// 4. Mark processed or record failure with backoff
/// 5. Repeat until shutdown signal
pub(crate) struct TimerWorker<S>
where
    S: EngineStore,
{
    runtime: Arc<WorkflowRuntime<S>>,
    worker_id: String,
}

impl<S> TimerWorker<S>
where
    S: EngineStore,
{
    /// Create a new timer worker.
    pub(crate) fn new(runtime: Arc<WorkflowRuntime<S>>, worker_id: String) -> Self {
        Self { runtime, worker_id }
    }

    /// Run the timer worker until shutdown signal.
    ///
    /// When the shutdown receiver signals, the worker finishes delivering
    /// the current timer (if any) and exits.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.runtime.config.timer_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Timer worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.process_one().await {
                        error!(worker_id = %self.worker_id, error = %e, "Error processing timer");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Timer worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Try to claim and deliver one timer.
    ///
    /// Returns `Ok(true)` if a timer was claimed.
    pub(crate) async fn process_one(&self) -> Result<bool> {
        let store = &self.runtime.store;
        let Some(timer) = store
            .claim_timer(&self.worker_id, self.runtime.config.timer_lock_duration)
            .await?
        else {
            return Ok(false); // No timers due
        };

        debug!(
            timer_id = %timer.id,
            instance = %timer.instance,
            key = timer.key.as_deref().unwrap_or("-"),
            attempt = timer.attempts + 1,
            "Timer fired"
        );

        let signal = Signal::Timer {
            key: timer.key.clone(),
            payload: timer.payload.clone(),
        };

        match self.runtime.deliver(&timer.instance, signal).await {
            Ok(_) => {
                // Delivered, or skipped because the instance completed
                store.mark_timer_processed(timer.id).await?;
            }
            Err(e) => {
                let backoff = self
                    .runtime
                    .config
                    .retry_policy
                    .backoff_duration(timer.attempts + 1);
                warn!(
                    timer_id = %timer.id,
                    instance = %timer.instance,
                    error = %e,
                    backoff_ms = backoff.as_millis(),
                    "Timer delivery failed"
                );
                store
                    .record_timer_failure(timer.id, &e.to_string(), backoff)
                    .await?;
            }
        }

        Ok(true)
    }
}
