//! Timer types for scheduling delayed workflow signals.
//!
//! Timers deliver a payload back to the workflow's `decide` function as a
//! [`Signal::Timer`](crate::Signal::Timer) once their fire time has passed on
//! the engine clock. Unlike task activations they run no side effects.
//!
//! # Ordering Guarantees
//!
//! A due timer is routed through the decider like any other signal, under the
//! instance's lock. Timers firing for the same instance are therefore
//! serialized with each other and with messages, and a timer that fires after
//! the instance left the state that armed it sees the new state. Workflows
//! record such late deliveries as ignored.
//!
//! # Example
//!
//! ```ignore
//! fn decide(&self, now: OffsetDateTime, state: &State, signal: &Signal<Reminder>)
//!     -> Decision<Event, Reminder>
//! {
//!     match signal {
//!         Signal::Start { .. } => Decision::event(Event::Waiting)
//!             .with_timer(Timer::after(now, self.interval, Reminder).with_key("reminder")),
//!         Signal::Timer { .. } if state.is_waiting() => Decision::event(Event::Reminded),
//!         Signal::Timer { .. } => Decision::event(Event::TimerIgnored),
//!         // ...
//!     }
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::to_time_duration;

/// A scheduled timer that delivers a payload to the workflow at a future time.
///
/// # Timer Keys
///
/// Timers can optionally have a `key`. Scheduling a timer with the same key
/// for the same instance replaces the pending one, and keyed timers can be
/// cancelled individually with
/// [`Decision::cancel_timer`](crate::Decision::cancel_timer).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::Timer;
///
/// let now = time::OffsetDateTime::UNIX_EPOCH;
///
/// // Timer that fires in 60 seconds
/// let timer = Timer::after(now, Duration::from_secs(60), "Reminder");
///
/// // Timer with a key for replacement and cancellation
/// let timer = Timer::after(now, Duration::from_secs(150), "FinalTimeout")
///     .with_key("final-timeout");
/// assert_eq!(timer.key(), Some("final-timeout"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer<T> {
    /// When the timer should fire (UTC, engine clock).
    pub fire_at: OffsetDateTime,

    /// The payload delivered when the timer fires.
    pub payload: T,

    /// Optional key for replacement and cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl<T> Timer<T> {
    /// Create a timer that fires at a specific time.
    pub fn at(fire_at: OffsetDateTime, payload: T) -> Self {
        Self {
            fire_at,
            payload,
            key: None,
        }
    }

    /// Create a timer that fires `delay` after `now`.
    ///
    /// Pass the `now` given to `decide` so that timers follow the engine
    /// clock. Fire times past the representable range saturate.
    pub fn after(now: OffsetDateTime, delay: Duration, payload: T) -> Self {
        Self::at(now.saturating_add(to_time_duration(delay)), payload)
    }

    /// Set a key for replacement and cancellation.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Returns the timer key, if set.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Convert the payload, keeping fire time and key.
    pub(crate) fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Timer<U>, E> {
        Ok(Timer {
            fire_at: self.fire_at,
            payload: f(self.payload)?,
            key: self.key,
        })
    }
}
