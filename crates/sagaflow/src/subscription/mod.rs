//! Newsletter subscription saga.
//!
//! A subscriber submits a form, receives a confirmation mail (and reminders),
//! and either confirms in time and gets a welcome mail, or the registration
//! is aborted once the final timeout passes.
//!
//! ```text
//! Started ──► AwaitingConfirmation ──(SubscriptionConfirmed)──► Confirmed ──► welcome mail
//!                 │   ▲
//!                 │   └── reminder: confirmation mail again
//!                 └──(final timeout)──► Aborted ──► abort registration
//! ```
//!
//! - [`SubscriptionWorkflow`]: the process definition
//! - [`NewsletterSubscriptionProcess`]: outbound port used by the application
//! - [`workers`]: job handlers over the business use cases

mod process;
mod workflow;
pub mod workers;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use process::NewsletterSubscriptionProcess;
pub use workflow::{
    EscalationPolicy, MAX_FINAL_TIMEOUT, Phase, SubscriptionEvent, SubscriptionState,
    SubscriptionTimer, SubscriptionWorkflow,
};

/// Process definition id.
pub const PROCESS_ID: &str = "newsletterSubscription";

/// Message names.
pub mod messages {
    /// Sent when the subscriber clicks the confirmation link.
    pub const SUBSCRIPTION_CONFIRMED: &str = "SubscriptionConfirmed";
}

/// Task types handled by job workers.
pub mod task_types {
    pub const SEND_CONFIRMATION_MAIL: &str = "newsletter.sendConfirmationMail";
    pub const SEND_WELCOME_MAIL: &str = "newsletter.sendWelcomeMail";
    pub const ABORT_REGISTRATION: &str = "newsletter.abortRegistration";
}

/// Element ids an instance can be started before.
pub mod elements {
    /// Normal entry: the first confirmation mail is sent.
    pub const SEND_CONFIRMATION_MAIL: &str = "Activity_SendConfirmationMail";
    /// Entry at the confirmation wait, without the first mail.
    pub const CONFIRM_REGISTRATION: &str = "Activity_ConfirmRegistration";
}

/// Process variable names.
pub mod variables {
    /// Stringified [`SubscriptionId`](super::SubscriptionId); the correlation key.
    pub const SUBSCRIPTION_ID: &str = "subscriptionId";
    /// Set to `true` by the welcome-mail worker.
    pub const WELCOME_MAIL_SENT: &str = "welcomeMailSent";
}

/// Identifier of a newsletter subscription.
///
/// # Example
///
/// ```
/// use sagaflow::subscription::SubscriptionId;
///
/// let id: SubscriptionId = "4a607799-804b-43d1-8aa2-bdcc4dfd9b86".parse().unwrap();
/// assert_eq!(id.to_string(), "4a607799-804b-43d1-8aa2-bdcc4dfd9b86");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generate a fresh random id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SubscriptionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
