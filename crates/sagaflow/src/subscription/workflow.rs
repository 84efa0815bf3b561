//! Subscription saga definition.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use super::{PROCESS_ID, elements, messages, task_types, variables};
use crate::clock::to_time_duration;
use crate::error::{Error, Result};
use crate::timer::Timer;
use crate::workflow::{Decision, Signal, Workflow};

const REMINDER_TIMER: &str = "reminder";
const FINAL_TIMEOUT_TIMER: &str = "final-timeout";

/// Time-based escalation of an unconfirmed subscription.
///
/// Recorded in the instance's `Started` event, so changing the policy of a
/// registered definition only affects instances started afterwards.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::subscription::EscalationPolicy;
///
/// let policy = EscalationPolicy::default();
/// assert_eq!(policy.reminder_interval, Duration::from_secs(60));
/// assert_eq!(policy.confirmation_mails, 2);
/// assert_eq!(policy.final_timeout, Duration::from_secs(150));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Delay between confirmation mails.
    pub reminder_interval: Duration,
    /// Total confirmation mails, the first one included.
    pub confirmation_mails: u32,
    /// Delay after which an unconfirmed registration is aborted.
    pub final_timeout: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            reminder_interval: Duration::from_secs(60),
            confirmation_mails: 2,
            final_timeout: Duration::from_secs(150),
        }
    }
}

/// Longest wait for a confirmation an [`EscalationPolicy`] may configure.
pub const MAX_FINAL_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl EscalationPolicy {
    /// Check that every reminder fires before the final timeout and that the
    /// final timeout stays within [`MAX_FINAL_TIMEOUT`].
    pub fn validate(&self) -> Result<()> {
        if self.reminder_interval.is_zero() {
            return Err(Error::InvalidPolicy("reminder interval must be positive".into()));
        }
        if self.confirmation_mails == 0 {
            return Err(Error::InvalidPolicy(
                "at least one confirmation mail is required".into(),
            ));
        }
        if self.final_timeout.is_zero() {
            return Err(Error::InvalidPolicy("final timeout must be positive".into()));
        }
        if self.final_timeout > MAX_FINAL_TIMEOUT {
            return Err(Error::InvalidPolicy(format!(
                "final timeout of {:?} exceeds the maximum of {MAX_FINAL_TIMEOUT:?}",
                self.final_timeout
            )));
        }
        let last_reminder = self
            .reminder_interval
            .saturating_mul(self.confirmation_mails - 1);
        if last_reminder >= self.final_timeout {
            return Err(Error::InvalidPolicy(format!(
                "last reminder at {last_reminder:?} does not precede the final timeout of {:?}",
                self.final_timeout
            )));
        }
        Ok(())
    }
}

/// Lifecycle phase of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Started,
    AwaitingConfirmation,
    Confirmed {
        welcome_sent: bool,
    },
    Aborted {
        cleaned_up: bool,
    },
}

/// Replayed state of one subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionState {
    pub phase: Phase,
    pub policy: EscalationPolicy,
    /// When the instance started waiting for the confirmation.
    pub awaiting_since: Option<OffsetDateTime>,
    pub confirmation_mails_requested: u32,
    pub confirmation_mails_delivered: u32,
    pub reminders_fired: u32,
    /// Output of the welcome-mail worker.
    pub welcome_mail_sent: bool,
}

impl SubscriptionState {
    fn reminder_due_at(&self, reminder: u32) -> Option<OffsetDateTime> {
        let since = self.awaiting_since?;
        let offset = self.policy.reminder_interval.saturating_mul(reminder);
        Some(since.saturating_add(to_time_duration(offset)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    Started {
        policy: EscalationPolicy,
        skip_initial_mail: bool,
    },
    AwaitingConfirmation {
        since: OffsetDateTime,
    },
    ConfirmationMailRequested {
        mail: u32,
    },
    ConfirmationMailDelivered,
    ReminderFired {
        reminder: u32,
    },
    Confirmed,
    WelcomeMailSent {
        welcome_mail_sent: bool,
    },
    TimedOut,
    RegistrationAborted,
    SignalIgnored {
        signal: String,
        state: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTimer {
    Reminder,
    FinalTimeout,
}

/// The newsletter subscription process definition.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionWorkflow {
    policy: EscalationPolicy,
}

impl SubscriptionWorkflow {
    /// Create a definition with a validated escalation policy.
    pub fn new(policy: EscalationPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    fn start(
        &self,
        now: OffsetDateTime,
        start_before: Option<&str>,
    ) -> Decision<SubscriptionEvent, SubscriptionTimer> {
        let skip_initial_mail = start_before == Some(elements::CONFIRM_REGISTRATION);
        let policy = &self.policy;

        let mut decision = Decision::event(SubscriptionEvent::Started {
            policy: policy.clone(),
            skip_initial_mail,
        })
        .and_event(SubscriptionEvent::AwaitingConfirmation { since: now })
        .with_timer(
            Timer::after(now, policy.final_timeout, SubscriptionTimer::FinalTimeout)
                .with_key(FINAL_TIMEOUT_TIMER),
        );

        let mails_sent = if skip_initial_mail {
            0
        } else {
            decision = decision
                .and_event(SubscriptionEvent::ConfirmationMailRequested { mail: 1 })
                .with_task(task_types::SEND_CONFIRMATION_MAIL);
            1
        };

        if mails_sent < policy.confirmation_mails {
            decision = decision.with_timer(
                Timer::after(now, policy.reminder_interval, SubscriptionTimer::Reminder)
                    .with_key(REMINDER_TIMER),
            );
        }
        decision
    }

    fn remind(
        state: &SubscriptionState,
    ) -> Option<Decision<SubscriptionEvent, SubscriptionTimer>> {
        if state.confirmation_mails_requested >= state.policy.confirmation_mails {
            return None;
        }

        let reminder = state.reminders_fired + 1;
        let mail = state.confirmation_mails_requested + 1;
        let mut decision = Decision::event(SubscriptionEvent::ReminderFired { reminder })
            .and_event(SubscriptionEvent::ConfirmationMailRequested { mail })
            .with_task(task_types::SEND_CONFIRMATION_MAIL);

        if mail < state.policy.confirmation_mails {
            // Reminders keep the cadence of the wait, not of their delivery.
            let next = state.reminder_due_at(reminder + 1)?;
            decision = decision
                .with_timer(Timer::at(next, SubscriptionTimer::Reminder).with_key(REMINDER_TIMER));
        }
        Some(decision)
    }

    fn ignore(
        state: &SubscriptionState,
        signal: &Signal<SubscriptionTimer>,
    ) -> Decision<SubscriptionEvent, SubscriptionTimer> {
        let state_name = Self::state_name(state);
        warn!(
            process_id = PROCESS_ID,
            state = state_name,
            signal = signal.kind(),
            "Signal ignored"
        );
        Decision::event(SubscriptionEvent::SignalIgnored {
            signal: signal.kind().to_string(),
            state: state_name.to_string(),
        })
    }
}

impl Workflow for SubscriptionWorkflow {
    type State = SubscriptionState;
    type Event = SubscriptionEvent;
    type Timer = SubscriptionTimer;

    const PROCESS_ID: &'static str = PROCESS_ID;
    const CORRELATION_VARIABLE: &'static str = variables::SUBSCRIPTION_ID;

    fn evolve(mut state: Self::State, event: Self::Event) -> Self::State {
        match event {
            SubscriptionEvent::Started { policy, .. } => {
                state.policy = policy;
            }
            SubscriptionEvent::AwaitingConfirmation { since } => {
                state.phase = Phase::AwaitingConfirmation;
                state.awaiting_since = Some(since);
            }
            SubscriptionEvent::ConfirmationMailRequested { mail } => {
                state.confirmation_mails_requested = mail;
            }
            SubscriptionEvent::ConfirmationMailDelivered => {
                state.confirmation_mails_delivered += 1;
            }
            SubscriptionEvent::ReminderFired { reminder } => {
                state.reminders_fired = reminder;
            }
            SubscriptionEvent::Confirmed => {
                state.phase = Phase::Confirmed {
                    welcome_sent: false,
                };
            }
            SubscriptionEvent::WelcomeMailSent { welcome_mail_sent } => {
                state.phase = Phase::Confirmed { welcome_sent: true };
                state.welcome_mail_sent = welcome_mail_sent;
            }
            SubscriptionEvent::TimedOut => {
                state.phase = Phase::Aborted { cleaned_up: false };
            }
            SubscriptionEvent::RegistrationAborted => {
                state.phase = Phase::Aborted { cleaned_up: true };
            }
            SubscriptionEvent::SignalIgnored { .. } => {}
        }
        state
    }

    fn decide(
        &self,
        now: OffsetDateTime,
        state: &Self::State,
        signal: &Signal<Self::Timer>,
    ) -> Decision<Self::Event, Self::Timer> {
        let decision = match (state.phase, signal) {
            (Phase::Started, Signal::Start { start_before, .. }) => {
                Some(self.start(now, start_before.as_deref()))
            }
            (Phase::AwaitingConfirmation, Signal::Message { .. }) => Some(
                Decision::event(SubscriptionEvent::Confirmed)
                    .with_task(task_types::SEND_WELCOME_MAIL)
                    .cancel_all_timers(),
            ),
            (
                Phase::AwaitingConfirmation,
                Signal::Timer {
                    payload: SubscriptionTimer::Reminder,
                    ..
                },
            ) => Self::remind(state),
            (
                Phase::AwaitingConfirmation,
                Signal::Timer {
                    payload: SubscriptionTimer::FinalTimeout,
                    ..
                },
            ) => Some(
                Decision::event(SubscriptionEvent::TimedOut)
                    .with_task(task_types::ABORT_REGISTRATION)
                    .cancel_all_timers(),
            ),
            (_, Signal::TaskCompleted { task_type, .. })
                if task_type == task_types::SEND_CONFIRMATION_MAIL =>
            {
                Some(Decision::event(SubscriptionEvent::ConfirmationMailDelivered))
            }
            (
                Phase::Confirmed {
                    welcome_sent: false,
                },
                Signal::TaskCompleted {
                    task_type,
                    variables: output,
                    ..
                },
            ) if task_type == task_types::SEND_WELCOME_MAIL => {
                let welcome_mail_sent = output
                    .get(variables::WELCOME_MAIL_SENT)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Some(Decision::event(SubscriptionEvent::WelcomeMailSent {
                    welcome_mail_sent,
                }))
            }
            (Phase::Aborted { cleaned_up: false }, Signal::TaskCompleted { task_type, .. })
                if task_type == task_types::ABORT_REGISTRATION =>
            {
                Some(Decision::event(SubscriptionEvent::RegistrationAborted))
            }
            _ => None,
        };

        decision.unwrap_or_else(|| Self::ignore(state, signal))
    }

    fn state_name(state: &Self::State) -> &'static str {
        match state.phase {
            Phase::Started => "Started",
            Phase::AwaitingConfirmation => "AwaitingConfirmation",
            Phase::Confirmed { .. } => "Confirmed",
            Phase::Aborted { .. } => "Aborted",
        }
    }

    fn awaited_message(state: &Self::State) -> Option<&'static str> {
        (state.phase == Phase::AwaitingConfirmation).then_some(messages::SUBSCRIPTION_CONFIRMED)
    }

    fn supports_start_before(element: &str) -> bool {
        element == elements::SEND_CONFIRMATION_MAIL || element == elements::CONFIRM_REGISTRATION
    }

    fn is_terminal(state: &Self::State) -> bool {
        matches!(
            state.phase,
            Phase::Confirmed { welcome_sent: true } | Phase::Aborted { cleaned_up: true }
        )
    }
}
