//! Job handler trait for executing workflow tasks.

use async_trait::async_trait;

use super::activated::ActivatedJob;
use crate::variables::Variables;

/// Failure reported by a [`JobHandler`].
///
/// Retryable failures are redelivered with backoff until the retry policy is
/// exhausted; non-retryable failures raise an incident immediately. Either
/// way the message is recorded on the job and never dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerFailure {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the job should be redelivered.
    pub retryable: bool,
}

impl HandlerFailure {
    /// A transient failure (network blip, downstream unavailable).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that redelivery cannot fix (malformed input, unknown entity).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<anyhow::Error> for HandlerFailure {
    fn from(error: anyhow::Error) -> Self {
        // Alternate formatting keeps the context chain in the message.
        Self::retryable(format!("{error:#}"))
    }
}

impl From<crate::Error> for HandlerFailure {
    fn from(error: crate::Error) -> Self {
        Self {
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }
}

/// Handler for one task type.
///
/// Register a handler per task type with
/// [`EngineBuilder::register_handler`](crate::runtime::EngineBuilder::register_handler).
/// The job worker claims activations, hands them to the handler and reports
/// the outcome back to the owning instance.
///
/// # Results
///
/// | Result | Meaning |
/// |--------|---------|
/// | `Ok(Variables::new())` | Task completed, no output |
/// | `Ok(vars)` | Task completed, `vars` merged into the instance |
/// | `Err(f)` with `f.retryable` | Redelivered with backoff, then incident |
/// | `Err(f)` otherwise | Incident raised immediately |
///
/// Expected business outcomes (address rejected, already confirmed) belong
/// in the output variables so the workflow can react to them.
///
/// # Idempotency
///
/// Jobs have **at-least-once** delivery semantics. A handler may run more
/// than once for the same activation, for example when completion reporting
/// fails after the side effect happened. Use
/// [`ActivatedJob::idempotency_key()`] or a ledger of processed business
/// keys to make repeated delivery harmless.
///
/// # Example
///
/// ```ignore
/// struct WelcomeMailHandler {
///     mailer: Mailer,
/// }
///
/// #[async_trait]
/// impl JobHandler for WelcomeMailHandler {
///     fn fetch_variables(&self) -> Option<&'static [&'static str]> {
///         Some(&["subscriptionId"])
///     }
///
///     async fn handle(&self, job: &ActivatedJob) -> Result<Variables, HandlerFailure> {
///         let id = job.variables.require_str("subscriptionId")?;
///         self.mailer.send_welcome(id, job.idempotency_key()).await?;
///         Ok(Variables::new().with("welcomeMailSent", true))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Variables the handler reads.
    ///
    /// The activation's variables are filtered to these names before
    /// delivery. `None` delivers every variable.
    fn fetch_variables(&self) -> Option<&'static [&'static str]> {
        None
    }

    /// Execute the task and return output variables.
    async fn handle(&self, job: &ActivatedJob) -> Result<Variables, HandlerFailure>;
}
