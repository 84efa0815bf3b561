//! Retry policy configuration for job execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for job retry behavior with exponential backoff.
///
/// When a handler reports a retryable failure, the job is redelivered
/// according to this policy. After `max_attempts` failures an incident is
/// raised and the job waits for resolution.
///
/// # Backoff Calculation
///
/// The delay before retry N is: `min(base_delay * 2^(N-1), max_delay)`
///
/// With defaults (base=1s, max=300s):
/// - Attempt 2: 1s delay
/// - Attempt 3: 2s delay
/// - Attempt 4: 4s delay
/// - Attempt 5: 8s delay (then incident)
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::job::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 5);
///
/// // Mail delivery can afford a longer tail
/// let patient = RetryPolicy {
///     max_attempts: 10,
///     base_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(60),
/// };
/// assert!(patient.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts before raising an incident.
    ///
    /// Includes the initial attempt. Default: 5 (1 initial + 4 retries).
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    ///
    /// The delay doubles with each retry. Default: 1 second.
    pub base_delay: Duration,

    /// Maximum delay between retries.
    ///
    /// Caps the exponential growth. Default: 5 minutes (300 seconds).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// A policy that raises an incident on the first failure.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Check that the policy allows at least one attempt.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidPolicy(
                "retry policy needs at least one attempt".into(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::InvalidPolicy(
                "retry base delay exceeds max delay".into(),
            ));
        }
        Ok(())
    }

    /// Returns `true` if another retry should be attempted.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Number of deliveries left after `attempt` (1-based) fails.
    pub fn retries_remaining(&self, attempt: u32) -> u32 {
        self.max_attempts.saturating_sub(attempt)
    }

    /// Calculate the backoff duration for a given attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        // Exponential backoff: base * 2^(attempt-1), capped at max
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }
}
