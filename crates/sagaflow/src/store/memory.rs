//! In-process store implementation.
//!
//! [`MemoryStore`] keeps instance streams, task activations, timers and
//! projection checkpoints in memory. It provides the same transactional
//! contract as a durable backend within one process:
//!
//! - per-instance serialization through an async mutex held by the unit of work
//! - all changes of a unit of work (records, jobs, timers, correlation
//!   binding, completion) become visible together at commit
//! - a dropped unit of work leaves no trace
//!
//! All time comparisons use the store's [`Clock`], so a [`ManualClock`]
//! makes timer and backoff behavior deterministic.
//!
//! [`ManualClock`]: crate::ManualClock

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::jobs::{Incident, IncidentQuery, JobRecord, JobStore, ScheduledTimer, TimerRecord};
use super::{
    BeginResult, EventStore, InstanceQueryStore, NewJob, ProjectionStore, Store, StoredEvent,
    UnitOfWork,
};
use crate::Timer;
use crate::clock::{Clock, SystemClock, to_time_duration};
use crate::correlation::{CorrelationEntry, CorrelationIndex, CorrelationKey};
use crate::error::{Error, Result};
use crate::workflow::{InstanceKey, InstanceRef};

/// In-memory store.
///
/// Cheap to clone; clones share the same data.
///
/// # Example
///
/// ```
/// use sagaflow::{ManualClock, MemoryStore, Store};
///
/// let clock = ManualClock::deterministic();
/// let store = MemoryStore::with_clock(clock.clone());
/// assert!(store.correlations().is_empty());
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    correlations: CorrelationIndex,
    locks: Mutex<HashMap<InstanceKey, Arc<AsyncMutex<()>>>>,
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    instances: HashMap<InstanceKey, InstanceRow>,
    events: Vec<StoredEvent>,
    streams: HashMap<InstanceKey, Vec<usize>>,
    jobs: BTreeMap<Uuid, JobRow>,
    timers: BTreeMap<Uuid, TimerRow>,
    projection_positions: HashMap<String, i64>,
}

struct InstanceRow {
    completed_at: Option<OffsetDateTime>,
}

struct JobRow {
    record: JobRecord,
    available_at: OffsetDateTime,
    locked_until: Option<OffsetDateTime>,
    incident: Option<Incident>,
    completed_at: Option<OffsetDateTime>,
}

impl JobRow {
    fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

struct TimerRow {
    instance: InstanceRef,
    key: Option<String>,
    fire_at: OffsetDateTime,
    payload: Value,
    attempts: u32,
    locked_until: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
}

impl TimerRow {
    fn is_pending_for(&self, instance: InstanceKey) -> bool {
        self.processed_at.is_none() && self.instance.key() == instance
    }
}

impl Tables {
    fn is_live(&self, instance: &InstanceKey) -> bool {
        self.instances
            .get(instance)
            .is_some_and(|row| row.completed_at.is_none())
    }

    fn stream(&self, instance: InstanceKey) -> impl Iterator<Item = &StoredEvent> {
        self.streams
            .get(&instance)
            .into_iter()
            .flatten()
            .filter_map(|index| self.events.get(*index))
    }

    fn remove_pending_timers(&mut self, instance: InstanceKey, mut matches: impl FnMut(&TimerRow) -> bool) {
        self.timers
            .retain(|_, row| !(row.is_pending_for(instance) && matches(row)));
    }

    fn job_mut(&mut self, job_key: Uuid) -> Result<&mut JobRow> {
        self.jobs
            .get_mut(&job_key)
            .filter(|row| row.is_open())
            .ok_or(Error::JobNotFound(job_key))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("correlations", &self.inner.correlations.len())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: impl Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock: Arc::new(clock),
                correlations: CorrelationIndex::new(),
                locks: Mutex::new(HashMap::new()),
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    /// All task activations of an instance in creation order, in any state.
    pub fn activations(&self, instance: InstanceKey) -> Vec<JobRecord> {
        self.tables()
            .jobs
            .values()
            .filter(|row| row.record.instance.key() == instance)
            .map(|row| row.record.clone())
            .collect()
    }

    /// Number of jobs that are neither completed nor in an incident.
    pub fn open_job_count(&self) -> usize {
        self.tables()
            .jobs
            .values()
            .filter(|row| row.is_open() && row.incident.is_none())
            .count()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn instance_lock(&self, instance: InstanceKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(instance).or_default())
    }

    /// Drop the instance mutex once no unit of work holds or awaits it.
    fn forget_idle_lock(&self, instance: InstanceKey) {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&instance)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&instance);
        }
    }

    fn is_live(&self, instance: &InstanceKey) -> bool {
        self.tables().is_live(instance)
    }
}

impl Store for MemoryStore {
    type UnitOfWork<'a> = MemoryUnitOfWork<'a>;

    async fn begin<'a>(
        &'a self,
        instance: &InstanceRef,
    ) -> Result<BeginResult<Self::UnitOfWork<'a>>> {
        let guard = InstanceLock {
            store: self,
            instance: instance.key(),
            guard: Some(self.instance_lock(instance.key()).lock_owned().await),
        };

        let events: Vec<Value> = {
            let tables = self.tables();
            if tables
                .instances
                .get(&instance.key())
                .is_some_and(|row| row.completed_at.is_some())
            {
                // Guard is released on return
                return Ok(BeginResult::Completed);
            }
            tables
                .stream(instance.key())
                .map(|event| event.payload.clone())
                .collect()
        };

        Ok(BeginResult::Active {
            events,
            uow: MemoryUnitOfWork {
                store: self,
                instance: instance.clone(),
                _guard: guard,
                pending: Pending::default(),
            },
        })
    }

    fn now(&self) -> OffsetDateTime {
        self.inner.clock.now()
    }

    fn correlations(&self) -> &CorrelationIndex {
        &self.inner.correlations
    }
}

#[derive(Default)]
struct Pending {
    events: Vec<Value>,
    jobs: Vec<NewJob>,
    timers: Vec<Timer<Value>>,
    cancel_keys: Vec<String>,
    cancel_all: bool,
    bind: Option<(CorrelationKey, CorrelationEntry)>,
    unbind: Option<CorrelationKey>,
    completed: bool,
}

/// Held instance mutex. Releasing it forgets the mutex when idle.
struct InstanceLock<'a> {
    store: &'a MemoryStore,
    instance: InstanceKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.store.forget_idle_lock(self.instance);
    }
}

/// Unit of work of the [`MemoryStore`].
///
/// Holds the instance lock until committed or dropped.
pub struct MemoryUnitOfWork<'a> {
    store: &'a MemoryStore,
    instance: InstanceRef,
    _guard: InstanceLock<'a>,
    pending: Pending,
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    async fn append_events<E, I>(&mut self, events: I) -> Result<()>
    where
        E: Serialize + Send,
        I: IntoIterator<Item = E> + Send,
    {
        for event in events {
            self.pending.events.push(serde_json::to_value(event)?);
        }
        Ok(())
    }

    async fn enqueue_jobs(&mut self, jobs: Vec<NewJob>) -> Result<()> {
        self.pending.jobs.extend(jobs);
        Ok(())
    }

    async fn schedule_timers<T>(&mut self, timers: T) -> Result<()>
    where
        T: IntoIterator<Item = Timer<Value>> + Send,
    {
        self.pending.timers.extend(timers);
        Ok(())
    }

    async fn cancel_timers(&mut self, keys: Vec<String>) -> Result<()> {
        self.pending.cancel_keys.extend(keys);
        Ok(())
    }

    fn cancel_all_timers(&mut self) {
        self.pending.cancel_all = true;
    }

    async fn bind_correlation(&mut self, key: CorrelationKey, entry: CorrelationEntry) -> Result<()> {
        if let Some(existing) = self.store.correlations().resolve(&key) {
            if existing.instance != entry.instance && self.store.is_live(&existing.instance) {
                return Err(Error::DuplicateCorrelation {
                    correlation_key: key,
                    existing: existing.instance,
                });
            }
        }
        self.pending.unbind = None;
        self.pending.bind = Some((key, entry));
        Ok(())
    }

    fn unbind_correlation(&mut self, key: CorrelationKey) {
        self.pending.bind = None;
        self.pending.unbind = Some(key);
    }

    fn mark_completed(&mut self) {
        self.pending.completed = true;
    }

    async fn commit(self) -> Result<()> {
        let MemoryUnitOfWork {
            store,
            instance,
            _guard,
            pending,
        } = self;
        let key = instance.key();
        let now = store.now();
        let mut tables = store.tables();

        // The only fallible step runs first so a rejected bind writes nothing.
        if let Some((correlation_key, entry)) = pending.bind {
            store
                .correlations()
                .bind(correlation_key, entry, |owner| tables.is_live(owner))?;
        }
        if let Some(correlation_key) = pending.unbind {
            store.correlations().unbind(&correlation_key, &key);
        }

        tables
            .instances
            .entry(key)
            .or_insert(InstanceRow { completed_at: None });

        let mut sequence = tables.streams.get(&key).map_or(0, Vec::len);
        for payload in pending.events {
            let index = tables.events.len();
            tables.events.push(StoredEvent {
                global_sequence: i64::try_from(index + 1).unwrap_or(i64::MAX),
                process_id: instance.process_id().to_string(),
                instance: key,
                sequence: i64::try_from(sequence).unwrap_or(i64::MAX),
                payload,
                created_at: now,
            });
            tables.streams.entry(key).or_default().push(index);
            sequence += 1;
        }

        for job in pending.jobs {
            let job_key = Uuid::now_v7();
            debug!(job_key = %job_key, instance = %instance, task_type = %job.task_type, "Job activated");
            tables.jobs.insert(
                job_key,
                JobRow {
                    record: JobRecord {
                        key: job_key,
                        instance: instance.clone(),
                        task_type: job.task_type,
                        variables: job.variables,
                        attempts: 0,
                        last_error: None,
                        created_at: now,
                    },
                    available_at: now,
                    locked_until: None,
                    incident: None,
                    completed_at: None,
                },
            );
        }

        if pending.cancel_all {
            tables.remove_pending_timers(key, |_| true);
        }
        if !pending.cancel_keys.is_empty() {
            let keys = pending.cancel_keys;
            tables.remove_pending_timers(key, |row| {
                row.key.as_ref().is_some_and(|k| keys.contains(k))
            });
        }
        for timer in pending.timers {
            if let Some(timer_key) = timer.key.as_deref() {
                tables.remove_pending_timers(key, |row| row.key.as_deref() == Some(timer_key));
            }
            tables.timers.insert(
                Uuid::now_v7(),
                TimerRow {
                    instance: instance.clone(),
                    key: timer.key,
                    fire_at: timer.fire_at,
                    payload: timer.payload,
                    attempts: 0,
                    locked_until: None,
                    processed_at: None,
                },
            );
        }

        if pending.completed {
            tables.remove_pending_timers(key, |_| true);
            if let Some(row) = tables.instances.get_mut(&key) {
                row.completed_at = Some(now);
            }
            debug!(instance = %instance, "Instance completed");
        }

        Ok(())
    }
}

impl JobStore for MemoryStore {
    async fn claim_job(
        &self,
        worker_id: &str,
        task_types: &[String],
        lock_duration: Duration,
    ) -> Result<Option<JobRecord>> {
        let now = self.now();
        let mut tables = self.tables();

        let claimed = tables.jobs.values_mut().find(|row| {
            row.is_open()
                && row.incident.is_none()
                && row.available_at <= now
                && row.locked_until.is_none_or(|until| until <= now)
                && task_types.contains(&row.record.task_type)
        });

        Ok(claimed.map(|row| {
            row.locked_until = Some(now + to_time_duration(lock_duration));
            debug!(job_key = %row.record.key, worker_id, "Job claimed");
            row.record.clone()
        }))
    }

    async fn complete_job(&self, job_key: Uuid) -> Result<()> {
        let now = self.now();
        let mut tables = self.tables();
        let row = tables.job_mut(job_key)?;
        row.completed_at = Some(now);
        row.locked_until = None;
        Ok(())
    }

    async fn record_job_failure(&self, job_key: Uuid, error: &str, backoff: Duration) -> Result<()> {
        let now = self.now();
        let mut tables = self.tables();
        let row = tables.job_mut(job_key)?;
        row.record.attempts += 1;
        row.record.last_error = Some(error.to_string());
        row.available_at = now + to_time_duration(backoff);
        row.locked_until = None;
        Ok(())
    }

    async fn raise_incident(&self, job_key: Uuid, error: &str) -> Result<Incident> {
        let now = self.now();
        let mut tables = self.tables();
        let row = tables.job_mut(job_key)?;
        row.record.attempts += 1;
        row.record.last_error = Some(error.to_string());
        row.locked_until = None;
        let incident = Incident {
            job_key,
            instance: row.record.instance.clone(),
            task_type: row.record.task_type.clone(),
            attempts: row.record.attempts,
            error: error.to_string(),
            raised_at: now,
        };
        row.incident = Some(incident.clone());
        Ok(incident)
    }

    async fn fetch_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>> {
        let tables = self.tables();
        let mut incidents: Vec<Incident> = tables
            .jobs
            .values()
            .filter(|row| row.is_open())
            .filter_map(|row| row.incident.as_ref())
            .filter(|incident| query.matches(incident))
            .cloned()
            .collect();
        incidents.sort_by_key(|incident| incident.raised_at);
        if let Some(limit) = query.limit {
            incidents.truncate(limit as usize);
        }
        Ok(incidents)
    }

    async fn resolve_incident(&self, job_key: Uuid) -> Result<bool> {
        let now = self.now();
        let mut tables = self.tables();
        let Some(row) = tables.jobs.get_mut(&job_key).filter(|row| row.is_open()) else {
            return Ok(false);
        };
        if row.incident.take().is_none() {
            return Ok(false);
        }
        row.record.attempts = 0;
        row.available_at = now;
        Ok(true)
    }

    async fn claim_timer(&self, worker_id: &str, lock_duration: Duration) -> Result<Option<TimerRecord>> {
        let now = self.now();
        let mut tables = self.tables();

        let due = tables
            .timers
            .iter_mut()
            .filter(|(_, row)| {
                row.processed_at.is_none()
                    && row.fire_at <= now
                    && row.locked_until.is_none_or(|until| until <= now)
            })
            .min_by_key(|(id, row)| (row.fire_at, **id));

        Ok(due.map(|(id, row)| {
            row.locked_until = Some(now + to_time_duration(lock_duration));
            debug!(timer_id = %id, worker_id, "Timer claimed");
            TimerRecord {
                id: *id,
                instance: row.instance.clone(),
                key: row.key.clone(),
                payload: row.payload.clone(),
                fire_at: row.fire_at,
                attempts: row.attempts,
            }
        }))
    }

    async fn mark_timer_processed(&self, timer_id: Uuid) -> Result<()> {
        let now = self.now();
        // Timers cancelled by the transition they triggered are already gone.
        if let Some(row) = self.tables().timers.get_mut(&timer_id) {
            row.processed_at = Some(now);
            row.locked_until = None;
        }
        Ok(())
    }

    async fn record_timer_failure(&self, timer_id: Uuid, error: &str, backoff: Duration) -> Result<()> {
        let now = self.now();
        if let Some(row) = self.tables().timers.get_mut(&timer_id) {
            debug!(timer_id = %timer_id, error, "Timer delivery failed");
            row.attempts += 1;
            row.locked_until = Some(now + to_time_duration(backoff));
        }
        Ok(())
    }
}

impl EventStore for MemoryStore {
    async fn fetch_events_since(&self, after: i64, limit: u32) -> Result<Vec<StoredEvent>> {
        let skip = usize::try_from(after.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .tables()
            .events
            .iter()
            .skip(skip)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

impl ProjectionStore for MemoryStore {
    async fn load_projection_position(&self, projection_name: &str) -> Result<i64> {
        Ok(self
            .tables()
            .projection_positions
            .get(projection_name)
            .copied()
            .unwrap_or(0))
    }

    async fn store_projection_position(&self, projection_name: &str, global_sequence: i64) -> Result<()> {
        self.tables()
            .projection_positions
            .insert(projection_name.to_string(), global_sequence);
        Ok(())
    }
}

#[async_trait]
impl InstanceQueryStore for MemoryStore {
    async fn fetch_instance_events(&self, instance: InstanceKey) -> Result<Vec<StoredEvent>> {
        Ok(self.tables().stream(instance).cloned().collect())
    }

    async fn is_completed(&self, instance: InstanceKey) -> Result<bool> {
        self.tables()
            .instances
            .get(&instance)
            .map(|row| row.completed_at.is_some())
            .ok_or(Error::InstanceNotFound(instance))
    }

    async fn pending_timers(&self, instance: InstanceKey) -> Result<Vec<ScheduledTimer>> {
        let tables = self.tables();
        let mut timers: Vec<ScheduledTimer> = tables
            .timers
            .values()
            .filter(|row| row.is_pending_for(instance))
            .map(|row| ScheduledTimer {
                key: row.key.clone(),
                fire_at: row.fire_at,
                payload: row.payload.clone(),
            })
            .collect();
        timers.sort_by_key(|timer| timer.fire_at);
        Ok(timers)
    }
}
