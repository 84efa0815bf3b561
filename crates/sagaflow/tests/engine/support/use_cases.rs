//! Recording implementations of the subscription use cases.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use sagaflow::subscription::SubscriptionId;
use sagaflow::subscription::workers::{AbortRegistration, SendConfirmationMail, SendWelcomeMail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    ConfirmationMail(SubscriptionId),
    WelcomeMail(SubscriptionId),
    Abort(SubscriptionId),
}

/// Records every use-case call in order.
///
/// `fail_welcome_mails` makes the next N welcome-mail calls fail with a
/// transient error.
#[derive(Default)]
pub struct RecordingUseCases {
    calls: Mutex<Vec<Call>>,
    fail_welcome_mails: AtomicU32,
}

impl RecordingUseCases {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls made for one subscription.
    pub fn calls_for(&self, id: SubscriptionId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                Call::ConfirmationMail(c) | Call::WelcomeMail(c) | Call::Abort(c) => *c == id,
            })
            .collect()
    }

    pub fn fail_welcome_mails(&self, times: u32) {
        self.fail_welcome_mails.store(times, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SendConfirmationMail for RecordingUseCases {
    async fn send_confirmation_mail(&self, id: SubscriptionId) -> anyhow::Result<()> {
        self.record(Call::ConfirmationMail(id));
        Ok(())
    }
}

#[async_trait]
impl SendWelcomeMail for RecordingUseCases {
    async fn send_welcome_mail(&self, id: SubscriptionId) -> anyhow::Result<()> {
        let failing = self
            .fail_welcome_mails
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("mail server unavailable");
        }
        self.record(Call::WelcomeMail(id));
        Ok(())
    }
}

#[async_trait]
impl AbortRegistration for RecordingUseCases {
    async fn abort(&self, id: SubscriptionId) -> anyhow::Result<()> {
        self.record(Call::Abort(id));
        Ok(())
    }
}
