//! Job handlers for the subscription task types.
//!
//! Each worker reads the subscription id from the activation and calls one
//! business use case. Use cases report failures as `anyhow::Error`; those are
//! retried with backoff. An activation without a readable subscription id
//! raises an incident right away.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{SubscriptionId, variables};
use crate::job::{ActivatedJob, HandlerFailure, JobHandler};
use crate::variables::Variables;

const INPUT_VARIABLES: &[&str] = &[variables::SUBSCRIPTION_ID];

/// Sends the mail with the confirmation link.
#[async_trait]
pub trait SendConfirmationMail: Send + Sync + 'static {
    async fn send_confirmation_mail(&self, id: SubscriptionId) -> anyhow::Result<()>;
}

/// Sends the welcome mail after a confirmed registration.
#[async_trait]
pub trait SendWelcomeMail: Send + Sync + 'static {
    async fn send_welcome_mail(&self, id: SubscriptionId) -> anyhow::Result<()>;
}

/// Removes an unconfirmed registration.
#[async_trait]
pub trait AbortRegistration: Send + Sync + 'static {
    async fn abort(&self, id: SubscriptionId) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionInput {
    subscription_id: SubscriptionId,
}

fn subscription_id(job: &ActivatedJob) -> Result<SubscriptionId, HandlerFailure> {
    job.input::<SubscriptionInput>()
        .map(|input| input.subscription_id)
        .map_err(|e| HandlerFailure::permanent(format!("unreadable subscription id: {e}")))
}

/// Handler for [`SEND_CONFIRMATION_MAIL`](super::task_types::SEND_CONFIRMATION_MAIL).
pub struct ConfirmationMailWorker {
    use_case: Arc<dyn SendConfirmationMail>,
}

impl ConfirmationMailWorker {
    pub fn new(use_case: Arc<dyn SendConfirmationMail>) -> Self {
        Self { use_case }
    }
}

#[async_trait]
impl JobHandler for ConfirmationMailWorker {
    fn fetch_variables(&self) -> Option<&'static [&'static str]> {
        Some(INPUT_VARIABLES)
    }

    async fn handle(&self, job: &ActivatedJob) -> Result<Variables, HandlerFailure> {
        let id = subscription_id(job)?;
        self.use_case.send_confirmation_mail(id).await?;
        debug!(subscription_id = %id, attempt = job.attempt, "Confirmation mail sent");
        Ok(Variables::new())
    }
}

/// Handler for [`SEND_WELCOME_MAIL`](super::task_types::SEND_WELCOME_MAIL).
///
/// Keeps a ledger of subscriptions already welcomed, so a redelivered job
/// does not mail the subscriber twice. The id is reserved before the mail
/// goes out; a delivery overlapping an in-flight send fails as retryable and
/// is settled by the next attempt. Reports `welcomeMailSent = true`.
pub struct WelcomeMailWorker {
    use_case: Arc<dyn SendWelcomeMail>,
    ledger: Mutex<HashMap<SubscriptionId, Delivery>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sending,
    Sent,
}

impl WelcomeMailWorker {
    pub fn new(use_case: Arc<dyn SendWelcomeMail>) -> Self {
        Self {
            use_case,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Delivery>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `id` for sending. Returns the existing entry if there is one.
    fn reserve(&self, id: SubscriptionId) -> Option<Delivery> {
        match self.ledger().entry(id) {
            Entry::Occupied(entry) => Some(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(Delivery::Sending);
                None
            }
        }
    }

    fn settle(&self, id: SubscriptionId, sent: bool) {
        let mut ledger = self.ledger();
        if sent {
            ledger.insert(id, Delivery::Sent);
        } else {
            ledger.remove(&id);
        }
    }
}

#[async_trait]
impl JobHandler for WelcomeMailWorker {
    fn fetch_variables(&self) -> Option<&'static [&'static str]> {
        Some(INPUT_VARIABLES)
    }

    async fn handle(&self, job: &ActivatedJob) -> Result<Variables, HandlerFailure> {
        let id = subscription_id(job)?;

        match self.reserve(id) {
            Some(Delivery::Sent) => {
                debug!(subscription_id = %id, "Welcome mail already sent, skipping");
            }
            Some(Delivery::Sending) => {
                warn!(subscription_id = %id, job_key = %job.key, "Welcome mail in flight");
                return Err(HandlerFailure::retryable(format!(
                    "welcome mail for {id} is already being sent"
                )));
            }
            None => {
                let result = self.use_case.send_welcome_mail(id).await;
                self.settle(id, result.is_ok());
                result?;
                info!(subscription_id = %id, "Welcome mail sent");
            }
        }

        Ok(Variables::new().with(variables::WELCOME_MAIL_SENT, true))
    }
}

/// Handler for [`ABORT_REGISTRATION`](super::task_types::ABORT_REGISTRATION).
pub struct AbortRegistrationWorker {
    use_case: Arc<dyn AbortRegistration>,
}

impl AbortRegistrationWorker {
    pub fn new(use_case: Arc<dyn AbortRegistration>) -> Self {
        Self { use_case }
    }
}

#[async_trait]
impl JobHandler for AbortRegistrationWorker {
    fn fetch_variables(&self) -> Option<&'static [&'static str]> {
        Some(INPUT_VARIABLES)
    }

    async fn handle(&self, job: &ActivatedJob) -> Result<Variables, HandlerFailure> {
        let id = subscription_id(job)?;
        self.use_case.abort(id).await?;
        info!(subscription_id = %id, "Registration aborted");
        Ok(Variables::new())
    }
}
