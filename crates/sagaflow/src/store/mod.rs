//! Storage abstraction for instance streams, task activations and timers.
//!
//! This module provides the [`Store`] and [`UnitOfWork`] traits that abstract
//! over storage backends, plus the [`JobStore`] operations used by the
//! runtime workers. One implementation is provided:
//!
//! - [`MemoryStore`]: in-process storage with per-instance locking

mod jobs;
mod memory;

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub use jobs::{Incident, IncidentQuery, JobRecord, JobStore, ScheduledTimer, TimerRecord};
pub use memory::{MemoryStore, MemoryUnitOfWork};

use crate::correlation::{CorrelationEntry, CorrelationIndex, CorrelationKey};
use crate::error::Result;
use crate::variables::Variables;
use crate::workflow::{InstanceKey, InstanceRef};

/// Stored record with global ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub global_sequence: i64,
    pub process_id: String,
    pub instance: InstanceKey,
    pub sequence: i64,
    pub payload: Value,
    pub created_at: OffsetDateTime,
}

/// A task activation to create when the unit of work commits.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Task type routed to a job handler.
    pub task_type: String,
    /// Snapshot of the instance variables at activation time.
    pub variables: Variables,
}

/// Result of beginning a unit of work.
///
/// Indicates whether the instance can process signals or already completed.
pub enum BeginResult<U> {
    /// Instance is active (or does not exist yet) and ready for a transition.
    Active {
        /// Existing records for replay. Empty for a fresh instance.
        events: Vec<Value>,
        /// Unit of work for appending new records.
        uow: U,
    },
    /// Instance has already completed (terminal state).
    ///
    /// No records loaded, no lock held. Caller should skip processing.
    Completed,
}

/// Storage backend for instance streams.
///
/// Implementations must provide transactional semantics with per-instance
/// locking. [`Store::begin`] acquires an exclusive lock on the instance,
/// serializing every transition of that instance while different instances
/// proceed in parallel.
///
/// Users typically don't interact with this trait directly; the gateway and
/// the runtime workers drive the decision cycle.
pub trait Store: Send + Sync + Clone + 'static {
    /// The unit of work type returned by this store.
    type UnitOfWork<'a>: UnitOfWork + Send
    where
        Self: 'a;

    /// Begin a unit of work for an instance.
    ///
    /// This method:
    /// 1. Acquires an exclusive lock on the instance
    /// 2. Checks if the instance already completed (returns `Completed` if so)
    /// 3. Loads all existing records for replay
    /// 4. Returns a unit of work for appending new records
    ///
    /// The lock is held until the unit of work is committed or dropped.
    fn begin<'a>(
        &'a self,
        instance: &InstanceRef,
    ) -> impl Future<Output = Result<BeginResult<Self::UnitOfWork<'a>>>> + Send;

    /// The store's notion of the current time.
    ///
    /// Used for decisions, due-timer claims and retry backoff so that all of
    /// them follow the same clock.
    fn now(&self) -> OffsetDateTime;

    /// The correlation index maintained by this store's commits.
    fn correlations(&self) -> &CorrelationIndex;
}

/// A transactional unit of work for a single instance.
///
/// Changes are only persisted when [`commit`](Self::commit) is called;
/// dropping the unit of work without committing discards everything,
/// including correlation changes.
pub trait UnitOfWork: Send {
    /// Append records to the instance stream.
    fn append_events<E, I>(&mut self, events: I) -> impl Future<Output = Result<()>> + Send
    where
        E: Serialize + Send,
        I: IntoIterator<Item = E> + Send;

    /// Create task activations.
    fn enqueue_jobs(&mut self, jobs: Vec<NewJob>) -> impl Future<Output = Result<()>> + Send;

    /// Schedule timers for future signal delivery.
    ///
    /// If a timer has a `key`, it replaces any pending timer with the same key
    /// for the same instance.
    fn schedule_timers<T>(&mut self, timers: T) -> impl Future<Output = Result<()>> + Send
    where
        T: IntoIterator<Item = crate::Timer<Value>> + Send;

    /// Cancel pending timers by key for the current instance.
    fn cancel_timers(&mut self, keys: Vec<String>) -> impl Future<Output = Result<()>> + Send;

    /// Cancel every pending timer of the current instance.
    ///
    /// Applied before timers scheduled in the same unit of work.
    fn cancel_all_timers(&mut self);

    /// Bind a correlation key to this instance when the unit of work commits.
    ///
    /// Fails eagerly with [`Error::DuplicateCorrelation`](crate::Error::DuplicateCorrelation)
    /// if another live instance holds the key. The check is repeated
    /// atomically at commit.
    fn bind_correlation(
        &mut self,
        key: CorrelationKey,
        entry: CorrelationEntry,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove this instance's binding for `key` when the unit of work commits.
    fn unbind_correlation(&mut self, key: CorrelationKey);

    /// Mark the instance as completed (terminal state reached).
    ///
    /// On commit, pending timers of the instance are cancelled and further
    /// signals are skipped.
    fn mark_completed(&mut self);

    /// Commit the unit of work, persisting all changes and releasing the lock.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

/// Event store operations needed for projection replay.
pub trait EventStore: Send + Sync + Clone + 'static {
    /// Fetch records after the provided global sequence (exclusive).
    ///
    /// Returns records ordered by `global_sequence` ascending.
    fn fetch_events_since(
        &self,
        after: i64,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<StoredEvent>>> + Send;
}

/// Projection position storage for projection workers.
pub trait ProjectionStore: Send + Sync + Clone + 'static {
    /// Load the last processed global sequence for a projection.
    fn load_projection_position(
        &self,
        projection_name: &str,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Persist the last processed global sequence for a projection.
    fn store_projection_position(
        &self,
        projection_name: &str,
        global_sequence: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Every storage capability the engine needs.
///
/// Blanket-implemented; bound on this instead of listing the traits.
pub trait EngineStore:
    Store + JobStore + EventStore + ProjectionStore + InstanceQueryStore
{
}

impl<T> EngineStore for T where
    T: Store + JobStore + EventStore + ProjectionStore + InstanceQueryStore
{
}

/// Query-only store operations for inspecting instance history.
#[async_trait]
pub trait InstanceQueryStore: Send + Sync + Clone + 'static {
    /// Fetch all records of an instance ordered by sequence.
    async fn fetch_instance_events(&self, instance: InstanceKey) -> Result<Vec<StoredEvent>>;

    /// Whether the instance completed.
    async fn is_completed(&self, instance: InstanceKey) -> Result<bool>;

    /// List the pending timers of an instance ordered by fire time.
    async fn pending_timers(&self, instance: InstanceKey) -> Result<Vec<ScheduledTimer>>;
}
