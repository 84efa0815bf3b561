//! Time sources for timer scheduling and retry backoff.
//!
//! All time-dependent decisions in the engine (timer fire times, due-timer
//! claims, job backoff) read the engine's [`Clock`] instead of the system
//! time directly, so tests can drive escalation deterministically with a
//! [`ManualClock`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;

/// A source of the current time (UTC).
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same elapsed time, so the clone handed to the engine
/// moves forward whenever the test advances its copy.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::{Clock, ManualClock};
///
/// let clock = ManualClock::deterministic();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(clock.now() - start, time::Duration::seconds(60));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: OffsetDateTime,
    elapsed_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock starting at `base`.
    pub fn new(base: OffsetDateTime) -> Self {
        Self {
            base,
            elapsed_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a clock anchored at the Unix epoch.
    pub fn deterministic() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }

    /// Advance the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms.fetch_add(millis, Ordering::SeqCst);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::deterministic()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        let elapsed = self.elapsed_ms.load(Ordering::SeqCst);
        self.base + time::Duration::milliseconds(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }
}

/// Convert a `std` duration to a `time` duration, saturating on overflow.
pub(crate) fn to_time_duration(duration: Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MAX)
}
