//! Core workflow traits and types.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::Timer;
use crate::correlation::CorrelationKey;
use crate::variables::Variables;

/// Process definition logic: state reconstruction via `evolve`, transitions
/// via `decide`.
///
/// `evolve` and `decide` must be deterministic with no side effects. Work is
/// requested as [`TaskRequest`]s (executed by registered job handlers) and
/// delayed inputs as [`Timer`]s; both are committed atomically with the
/// events of the transition.
///
/// # Correlation
///
/// An instance's correlation key is read from the start variable named
/// [`Self::CORRELATION_VARIABLE`]. Whenever [`awaited_message`](Self::awaited_message)
/// returns `Some`, the engine keeps the instance bound under that key in the
/// correlation index; when it returns `None` the binding is removed in the
/// same commit.
///
/// # Configuration
///
/// `decide` takes `&self`, so a definition can carry configuration (timer
/// durations, counts). Definitions should copy that configuration into the
/// state when an instance starts, so that registering a changed definition
/// does not alter running instances.
///
/// # Example
///
/// ```ignore
/// impl Workflow for ApprovalWorkflow {
///     type State = ApprovalState;
///     type Event = ApprovalEvent;
///     type Timer = ApprovalTimer;
///
///     const PROCESS_ID: &'static str = "approval";
///     const CORRELATION_VARIABLE: &'static str = "requestId";
///
///     fn evolve(mut state: Self::State, event: Self::Event) -> Self::State {
///         match event {
///             ApprovalEvent::Requested { deadline } => state.status = Status::Waiting { deadline },
///             ApprovalEvent::Approved => state.status = Status::Approved,
///             ApprovalEvent::Expired => state.status = Status::Expired,
///         }
///         state
///     }
///
///     fn decide(&self, now: OffsetDateTime, state: &Self::State, signal: &Signal<Self::Timer>)
///         -> Decision<Self::Event, Self::Timer>
///     {
///         match signal {
///             Signal::Start { .. } => {
///                 let deadline = now + self.timeout;
///                 Decision::event(ApprovalEvent::Requested { deadline })
///                     .with_task("approval.notifyApprover")
///                     .with_timer_at(deadline, ApprovalTimer::Expire)
///             }
///             Signal::Message { .. } => Decision::event(ApprovalEvent::Approved).cancel_all_timers(),
///             Signal::Timer { .. } => Decision::event(ApprovalEvent::Expired),
///             Signal::TaskCompleted { .. } => Decision::event(ApprovalEvent::Noted),
///         }
///     }
///
///     fn state_name(state: &Self::State) -> &'static str { state.status.name() }
///
///     fn awaited_message(state: &Self::State) -> Option<&'static str> {
///         matches!(state.status, Status::Waiting { .. }).then_some("Approved")
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// The workflow state, reconstructed by replaying events.
    type State: Default + Clone + Send + Sync;

    /// Facts recorded to the instance stream. Must be serializable for persistence.
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Payload carried by timers. Must be serializable for timer storage.
    type Timer: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Process definition id. Must be stable across deployments: changing it
    /// orphans in-flight instances.
    const PROCESS_ID: &'static str;

    /// Name of the start variable holding the business correlation key.
    const CORRELATION_VARIABLE: &'static str;

    /// Reconstruct state from an event.
    ///
    /// Called during replay to rebuild the current state from historical events.
    /// Must be deterministic: the same events produce the same state.
    fn evolve(state: Self::State, event: Self::Event) -> Self::State;

    /// Decide what to do given the current state and an incoming signal.
    ///
    /// Must be deterministic and side-effect free. `now` is the engine
    /// clock's current time and should be the base for timer fire times.
    /// Every signal must produce at least one event.
    fn decide(
        &self,
        now: OffsetDateTime,
        state: &Self::State,
        signal: &Signal<Self::Timer>,
    ) -> Decision<Self::Event, Self::Timer>;

    /// Short name of the current state, used in summaries and logs.
    fn state_name(state: &Self::State) -> &'static str;

    /// The message this state waits for, if any.
    ///
    /// Default implementation returns `None` (never waits for messages).
    fn awaited_message(_state: &Self::State) -> Option<&'static str> {
        None
    }

    /// Whether an instance may be started before `element`.
    ///
    /// Checked before a [`Signal::Start`] with `start_before` is delivered;
    /// unsupported elements are rejected without creating an instance.
    ///
    /// Default implementation returns `false` (only regular starts).
    fn supports_start_before(_element: &str) -> bool {
        false
    }

    /// Check if the state represents a terminal (completed) workflow.
    ///
    /// Terminal instances are marked completed in the store: their timers
    /// are cancelled, their correlation entry is removed, and later signals
    /// are ignored.
    ///
    /// Default implementation returns `false` (workflow never terminates).
    fn is_terminal(_state: &Self::State) -> bool {
        false
    }
}

/// Input delivered to [`Workflow::decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    /// The instance is being created.
    Start {
        /// Start variables (already merged into the instance).
        variables: Variables,
        /// Element to start before, if the caller requested a mid-flow start.
        start_before: Option<String>,
    },
    /// A correlated message was delivered.
    Message {
        /// Message name.
        name: String,
        /// Message variables (already merged into the instance).
        variables: Variables,
    },
    /// A scheduled timer fired.
    Timer {
        /// The timer's key, if it was scheduled with one.
        key: Option<String>,
        /// The timer payload.
        payload: T,
    },
    /// A job handler completed an activated task.
    TaskCompleted {
        /// The task type that completed.
        task_type: String,
        /// The completed job.
        job_key: Uuid,
        /// Output variables (already merged into the instance).
        variables: Variables,
    },
}

impl<T> Signal<T> {
    /// Short description for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Start { .. } => "start",
            Signal::Message { .. } => "message",
            Signal::Timer { .. } => "timer",
            Signal::TaskCompleted { .. } => "task_completed",
        }
    }

    /// Variables carried by the signal, merged into the instance before deciding.
    pub(crate) fn variables(&self) -> Option<&Variables> {
        match self {
            Signal::Start { variables, .. }
            | Signal::Message { variables, .. }
            | Signal::TaskCompleted { variables, .. } => Some(variables),
            Signal::Timer { .. } => None,
        }
    }

    /// Convert the timer payload type.
    pub(crate) fn try_map_timer<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<Signal<U>, E> {
        Ok(match self {
            Signal::Start {
                variables,
                start_before,
            } => Signal::Start {
                variables,
                start_before,
            },
            Signal::Message { name, variables } => Signal::Message { name, variables },
            Signal::Timer { key, payload } => Signal::Timer {
                key,
                payload: f(payload)?,
            },
            Signal::TaskCompleted {
                task_type,
                job_key,
                variables,
            } => Signal::TaskCompleted {
                task_type,
                job_key,
                variables,
            },
        })
    }
}

/// Engine-assigned instance key (opaque, unique, time-ordered).
///
/// # Example
///
/// ```
/// use sagaflow::InstanceKey;
///
/// let a = InstanceKey::generate();
/// let b = InstanceKey::generate();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(Uuid);

impl InstanceKey {
    /// Generate a fresh key (UUID v7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Reference to a specific process instance.
///
/// Combines the process definition id and instance key.
///
/// # Example
///
/// ```
/// use sagaflow::{InstanceKey, InstanceRef};
///
/// let key = InstanceKey::generate();
/// let instance = InstanceRef::new("newsletterSubscription", key);
/// assert_eq!(instance.process_id(), "newsletterSubscription");
/// assert_eq!(format!("{}", instance), format!("newsletterSubscription:{key}"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    process_id: String,
    key: InstanceKey,
}

impl InstanceRef {
    /// Create a new instance reference.
    pub fn new(process_id: impl Into<String>, key: InstanceKey) -> Self {
        Self {
            process_id: process_id.into(),
            key,
        }
    }

    /// The process definition id.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The instance key.
    pub fn key(&self) -> InstanceKey {
        self.key
    }
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.process_id, self.key)
    }
}

/// A task activation requested by a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    /// The task type routed to a registered job handler.
    pub task_type: String,
}

impl TaskRequest {
    /// Request a task of the given type.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
        }
    }
}

/// Actions to execute as a result of a workflow decision.
///
/// Every decision must produce at least one event (enforced by [`NonEmpty`]).
/// This ensures a complete audit trail: every signal results in a recorded
/// event, even if it's an "ignored" event for a stale timer.
///
/// # Structure
///
/// - **Events**: Facts about what happened (at least one required)
/// - **Tasks**: Task activations for job handlers (optional)
/// - **Timers**: Signals to deliver at a future time (optional)
/// - **Timer cancellations**: Remove pending timers by key, or all of them (optional)
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::Decision;
///
/// let now = time::OffsetDateTime::UNIX_EPOCH;
/// let decision = Decision::<&str, &str>::event("entered")
///     .with_task("newsletter.sendConfirmationMail")
///     .with_timer_after(now, Duration::from_secs(60), "reminder");
///
/// assert_eq!(decision.tasks().len(), 1);
/// assert_eq!(decision.timers().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Decision<E, T> {
    events: NonEmpty<E>,
    tasks: Vec<TaskRequest>,
    timers: Vec<Timer<T>>,
    cancel_timers: Vec<String>,
    cancel_all_timers: bool,
}

impl<E, T> Decision<E, T> {
    /// Create a decision with a single event.
    pub fn event(event: E) -> Self {
        Self::from_events(NonEmpty::new(event))
    }

    /// Create a decision from a non-empty collection of events.
    pub fn from_events(events: NonEmpty<E>) -> Self {
        Self {
            events,
            tasks: vec![],
            timers: vec![],
            cancel_timers: vec![],
            cancel_all_timers: false,
        }
    }

    /// Try to create a decision from an iterator of events.
    ///
    /// Returns `None` if the iterator is empty.
    pub fn try_from_iter(events: impl IntoIterator<Item = E>) -> Option<Self> {
        Some(Self::from_events(NonEmpty::collect(events)?))
    }

    /// Append another event.
    pub fn and_event(mut self, event: E) -> Self {
        self.events.push(event);
        self
    }

    /// Activate a task of the given type.
    pub fn with_task(mut self, task_type: impl Into<String>) -> Self {
        self.tasks.push(TaskRequest::new(task_type));
        self
    }

    /// Add a timer to this decision.
    ///
    /// When the timer fires, its payload is delivered to `decide` as a
    /// [`Signal::Timer`].
    pub fn with_timer(mut self, timer: Timer<T>) -> Self {
        self.timers.push(timer);
        self
    }

    /// Add a timer that fires at a specific time.
    pub fn with_timer_at(self, fire_at: OffsetDateTime, payload: T) -> Self {
        self.with_timer(Timer::at(fire_at, payload))
    }

    /// Add a timer that fires `delay` after `now`.
    pub fn with_timer_after(self, now: OffsetDateTime, delay: std::time::Duration, payload: T) -> Self {
        self.with_timer(Timer::after(now, delay, payload))
    }

    /// Cancel a pending timer by key.
    pub fn cancel_timer(mut self, key: impl Into<String>) -> Self {
        self.cancel_timers.push(key.into());
        self
    }

    /// Cancel every pending timer of the instance.
    ///
    /// Applied before this decision's own timers are scheduled.
    pub fn cancel_all_timers(mut self) -> Self {
        self.cancel_all_timers = true;
        self
    }

    /// Borrow the events produced by this decision.
    pub fn events(&self) -> &NonEmpty<E> {
        &self.events
    }

    /// Borrow the task activations produced by this decision.
    pub fn tasks(&self) -> &[TaskRequest] {
        &self.tasks
    }

    /// Borrow the timers produced by this decision.
    pub fn timers(&self) -> &[Timer<T>] {
        &self.timers
    }

    /// Borrow the timer cancellation keys.
    pub fn canceled_timers(&self) -> &[String] {
        &self.cancel_timers
    }

    /// Returns `true` if the decision cancels all pending timers.
    pub fn cancels_all_timers(&self) -> bool {
        self.cancel_all_timers
    }

    /// Consume the decision into its parts.
    pub(crate) fn into_parts(self) -> DecisionParts<E, T> {
        DecisionParts {
            events: self.events,
            tasks: self.tasks,
            timers: self.timers,
            cancel_timers: self.cancel_timers,
            cancel_all_timers: self.cancel_all_timers,
        }
    }
}

/// Destructured [`Decision`].
pub(crate) struct DecisionParts<E, T> {
    pub events: NonEmpty<E>,
    pub tasks: Vec<TaskRequest>,
    pub timers: Vec<Timer<T>>,
    pub cancel_timers: Vec<String>,
    pub cancel_all_timers: bool,
}

/// A process instance as reconstructed from its event stream.
#[derive(Debug, Clone)]
pub struct ProcessInstance<S> {
    /// Engine-assigned key.
    pub key: InstanceKey,
    /// Process definition id.
    pub process_id: String,
    /// Business correlation key.
    pub correlation_key: CorrelationKey,
    /// Current workflow state.
    pub state: S,
    /// Current variable set.
    pub variables: Variables,
    /// Whether the instance reached a terminal state.
    pub terminal: bool,
    /// Number of recorded events.
    pub version: usize,
}
