//! Task activation handed to job handlers.

use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::variables::Variables;
use crate::workflow::InstanceRef;

/// A task activation delivered to a [`JobHandler`](super::JobHandler).
///
/// Carries the input variables (filtered to the handler's declared
/// variables) and metadata for idempotency and retry awareness.
///
/// # Idempotency
///
/// Use [`idempotency_key()`](Self::idempotency_key) when calling external
/// services. The key is stable across redeliveries of the same activation
/// but unique per activation.
///
/// # Example
///
/// ```ignore
/// async fn handle(&self, job: &ActivatedJob) -> Result<Variables, HandlerFailure> {
///     let input: WelcomeInput = job.input()?;
///     self.mailer.send(input.subscription_id, job.idempotency_key()).await?;
///     Ok(Variables::new().with("welcomeMailSent", true))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivatedJob {
    /// Job key (UUID v7), also the completion token.
    pub key: Uuid,

    /// The task type this activation was routed by.
    pub task_type: String,

    /// The instance that activated the task.
    pub instance: InstanceRef,

    /// Input variables.
    pub variables: Variables,

    /// Current attempt number (1-based).
    ///
    /// First delivery is attempt 1, first retry is attempt 2, etc.
    pub attempt: u32,

    /// Deliveries left if this attempt fails.
    pub retries_remaining: u32,

    /// When the activation was created.
    pub created_at: OffsetDateTime,
}

impl ActivatedJob {
    /// Deserialize the input variables into a typed struct.
    ///
    /// Variable names map to field names, so input structs typically use
    /// `#[serde(rename_all = "camelCase")]`.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T> {
        self.variables.to_typed()
    }

    /// Get the idempotency key for external service calls.
    ///
    /// Format: `{process_id}:{instance_key}:{job_key}`
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.instance, self.key)
    }

    /// Returns `true` if this is a redelivery (attempt > 1).
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::workflow::InstanceKey;

    fn test_job() -> ActivatedJob {
        ActivatedJob {
            key: Uuid::nil(),
            task_type: "newsletter.sendWelcomeMail".into(),
            instance: InstanceRef::new("newsletterSubscription", InstanceKey::from_uuid(Uuid::nil())),
            variables: Variables::new().with("subscriptionId", "5f1c0c4e-3a8e-4b5e-9f0e-2d3c4b5a6f70"),
            attempt: 1,
            retries_remaining: 4,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn idempotency_key_format() {
        let job = test_job();
        let key = job.idempotency_key();

        assert!(key.starts_with("newsletterSubscription:"));
        assert!(key.ends_with(&Uuid::nil().to_string()));
    }

    #[test]
    fn is_retry() {
        let mut job = test_job();

        assert!(!job.is_retry());

        job.attempt = 2;
        assert!(job.is_retry());
    }

    #[test]
    fn typed_input() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Input {
            subscription_id: String,
        }

        let input: Input = test_job().input().unwrap();
        assert_eq!(input.subscription_id, "5f1c0c4e-3a8e-4b5e-9f0e-2d3c4b5a6f70");

        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Missing {
            email: String,
        }
        assert!(test_job().input::<Missing>().is_err());
    }
}
