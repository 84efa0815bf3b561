use std::sync::Arc;

use tracing::info;

use super::{PROCESS_ID, SubscriptionId, messages, variables};
use crate::correlation::CorrelationKey;
use crate::error::Result;
use crate::gateway::ProcessEngine;
use crate::variables::Variables;
use crate::workflow::InstanceKey;

/// Application-side port onto the subscription process.
///
/// Translates subscription use cases into engine commands. Both calls are
/// strongly consistent: they return once the engine committed the transition.
#[derive(Clone)]
pub struct NewsletterSubscriptionProcess {
    engine: Arc<dyn ProcessEngine>,
}

impl NewsletterSubscriptionProcess {
    pub fn new(engine: Arc<dyn ProcessEngine>) -> Self {
        Self { engine }
    }

    /// Start the subscription process for a submitted form.
    pub async fn submit_form(&self, id: SubscriptionId) -> Result<InstanceKey> {
        let variables = Variables::new().with(variables::SUBSCRIPTION_ID, id.to_string());
        let key = self
            .engine
            .start_instance(PROCESS_ID, variables)
            .await?
            .into_inner();

        info!(subscription_id = %id, instance = %key, "Subscription process started");
        Ok(key)
    }

    /// Report that the subscriber confirmed the registration.
    ///
    /// Fails with [`Error::NoWaitingInstance`](crate::Error::NoWaitingInstance)
    /// when no instance for `id` is waiting for the confirmation (never
    /// started, already confirmed, or aborted).
    pub async fn confirm(&self, id: SubscriptionId) -> Result<()> {
        let correlation_key = CorrelationKey::new(id.to_string());
        self.engine
            .send_message(
                messages::SUBSCRIPTION_CONFIRMED,
                &correlation_key,
                Variables::new(),
            )
            .await?;

        info!(subscription_id = %id, "Subscription confirmed");
        Ok(())
    }
}
