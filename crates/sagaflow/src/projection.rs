//! Projection infrastructure and the instance-summary read model.
//!
//! Projections follow the global record order and lag behind commits, so
//! everything served from them is eventually consistent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::correlation::CorrelationKey;
use crate::decider::InstanceRecord;
use crate::error::Result;
use crate::store::{EventStore, ProjectionStore, StoredEvent};
use crate::workflow::InstanceKey;

/// Type alias for boxed futures (object-safe async).
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Projection event delivered to projection handlers.
#[derive(Debug, Clone)]
pub struct ProjectionEvent {
    pub global_sequence: i64,
    pub process_id: String,
    pub instance: InstanceKey,
    pub sequence: i64,
    pub payload: Value,
    pub created_at: OffsetDateTime,
}

impl From<StoredEvent> for ProjectionEvent {
    fn from(event: StoredEvent) -> Self {
        Self {
            global_sequence: event.global_sequence,
            process_id: event.process_id,
            instance: event.instance,
            sequence: event.sequence,
            payload: event.payload,
            created_at: event.created_at,
        }
    }
}

/// Projection handler trait.
pub trait Projection: Send + Sync + 'static {
    /// Projection identifier used for checkpointing.
    fn name(&self) -> &'static str;

    /// Apply an event to the projection.
    fn handle<'a>(&'a self, event: ProjectionEvent) -> BoxFuture<'a, Result<()>>;
}

/// Configuration for projection workers.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// How often to poll for new events.
    pub poll_interval: Duration,
    /// Maximum number of events to fetch per batch.
    pub batch_size: u32,
    /// Base delay for retry backoff after projection failures.
    pub error_backoff_base: Duration,
    /// Maximum delay for retry backoff after projection failures.
    pub error_backoff_max: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
            error_backoff_base: Duration::from_millis(200),
            error_backoff_max: Duration::from_secs(5),
        }
    }
}

impl ProjectionConfig {
    fn error_backoff_duration(&self, failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(failures.saturating_sub(1));
        let delay = self.error_backoff_base.saturating_mul(multiplier);
        delay.min(self.error_backoff_max)
    }
}

/// Worker that applies projections using global event ordering.
pub struct ProjectionWorker<S, P>
where
    S: EventStore + ProjectionStore,
    P: Projection,
{
    store: S,
    projection: Arc<P>,
    config: ProjectionConfig,
    worker_id: String,
}

impl<S, P> ProjectionWorker<S, P>
where
    S: EventStore + ProjectionStore,
    P: Projection,
{
    pub fn new(store: S, projection: Arc<P>, config: ProjectionConfig, worker_id: String) -> Self {
        Self {
            store,
            projection,
            config,
            worker_id,
        }
    }

    /// Follow the record stream until `shutdown` flips to `true`.
    ///
    /// A full batch is followed by the next one right away; otherwise the
    /// worker sleeps for the poll interval, or for the error backoff after a
    /// failed batch.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.projection.name();
        let mut failures: u32 = 0;

        info!(worker_id = %self.worker_id, projection = name, "Projection worker started");

        while !*shutdown.borrow() {
            let pause = match self.process_batch().await {
                Ok(applied) => {
                    failures = 0;
                    if applied > 0 && applied >= self.config.batch_size as usize {
                        continue;
                    }
                    self.config.poll_interval
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let backoff = self.config.error_backoff_duration(failures);
                    error!(
                        worker_id = %self.worker_id,
                        projection = name,
                        failures,
                        backoff_ms = backoff.as_millis(),
                        error = %err,
                        "Projection batch failed, backing off"
                    );
                    backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, projection = name, "Projection worker shutting down");
    }

    /// Apply the next batch of events.
    ///
    /// Returns the number of events applied.
    pub(crate) async fn process_batch(&self) -> Result<usize> {
        let position = self
            .store
            .load_projection_position(self.projection.name())
            .await?;

        let events = self
            .store
            .fetch_events_since(position, self.config.batch_size)
            .await?;

        let applied = events.len();
        for event in events {
            let projection_event = ProjectionEvent::from(event);
            let next_position = projection_event.global_sequence;
            self.projection.handle(projection_event).await?;
            self.store
                .store_projection_position(self.projection.name(), next_position)
                .await?;
            debug!(
                projection = self.projection.name(),
                global_sequence = next_position,
                "Projection advanced"
            );
        }

        Ok(applied)
    }
}

/// Lifecycle status used to filter instance listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Not yet in a terminal state.
    Active,
    /// Reached a terminal state.
    Completed,
}

/// Eventually consistent listing row for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub instance: InstanceKey,
    pub process_id: String,
    pub correlation_key: CorrelationKey,
    /// Name of the last state entered.
    pub state: String,
    pub terminal: bool,
    /// Number of records applied so far.
    pub version: usize,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl InstanceSummary {
    pub fn status(&self) -> InstanceStatus {
        if self.terminal {
            InstanceStatus::Completed
        } else {
            InstanceStatus::Active
        }
    }
}

/// Filter for instance listings.
///
/// # Example
///
/// ```
/// use sagaflow::{InstanceFilter, InstanceStatus};
///
/// let filter = InstanceFilter::new()
///     .process_id("newsletterSubscription")
///     .status(InstanceStatus::Active)
///     .limit(50);
/// assert_eq!(filter.limit, Some(50));
/// ```
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub process_id: Option<String>,
    pub correlation_key: Option<CorrelationKey>,
    pub status: Option<InstanceStatus>,
    pub limit: Option<usize>,
}

impl InstanceFilter {
    /// Create an empty filter (matches every instance).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub fn correlation_key(mut self, key: impl Into<CorrelationKey>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, summary: &InstanceSummary) -> bool {
        self.process_id
            .as_deref()
            .is_none_or(|p| summary.process_id == p)
            && self
                .correlation_key
                .as_ref()
                .is_none_or(|k| summary.correlation_key == *k)
            && self.status.is_none_or(|s| summary.status() == s)
    }
}

/// Instance-summary projection backing `query_instances`.
#[derive(Debug, Default)]
pub struct InstanceSummaries {
    rows: RwLock<HashMap<InstanceKey, InstanceSummary>>,
}

impl InstanceSummaries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summaries matching `filter`, oldest instance first.
    pub fn query(&self, filter: &InstanceFilter) -> Vec<InstanceSummary> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<InstanceSummary> = rows
            .values()
            .filter(|summary| filter.matches(summary))
            .cloned()
            .collect();
        matched.sort_by_key(|summary| (summary.created_at, summary.instance));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    fn apply(&self, event: ProjectionEvent) -> Result<()> {
        let record: InstanceRecord<Value> = serde_json::from_value(event.payload)?;
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);

        match record {
            InstanceRecord::Created {
                process_id,
                correlation_key,
                ..
            } => {
                rows.insert(
                    event.instance,
                    InstanceSummary {
                        instance: event.instance,
                        process_id,
                        correlation_key,
                        state: String::new(),
                        terminal: false,
                        version: 0,
                        created_at: event.created_at,
                        updated_at: event.created_at,
                    },
                );
            }
            InstanceRecord::StateEntered { state, terminal } => {
                if let Some(summary) = rows.get_mut(&event.instance) {
                    summary.state = state;
                    summary.terminal = terminal;
                }
            }
            InstanceRecord::VariablesMerged { .. } | InstanceRecord::Event { .. } => {}
        }

        if let Some(summary) = rows.get_mut(&event.instance) {
            summary.version = usize::try_from(event.sequence + 1).unwrap_or(usize::MAX);
            summary.updated_at = event.created_at;
        }
        Ok(())
    }
}

impl Projection for InstanceSummaries {
    fn name(&self) -> &'static str {
        "instance_summaries"
    }

    fn handle<'a>(&'a self, event: ProjectionEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.apply(event) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct MockStore {
        state: Arc<Mutex<MockState>>,
    }

    struct MockState {
        events: Vec<StoredEvent>,
        position: i64,
    }

    impl MockStore {
        fn new(events: Vec<StoredEvent>) -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    events,
                    position: 0,
                })),
            }
        }
    }

    impl EventStore for MockStore {
        async fn fetch_events_since(&self, after: i64, limit: u32) -> Result<Vec<StoredEvent>> {
            let state = self.state.lock().unwrap();
            let mut events: Vec<_> = state
                .events
                .iter()
                .filter(|event| event.global_sequence > after)
                .cloned()
                .collect();
            events.truncate(limit as usize);
            Ok(events)
        }
    }

    impl ProjectionStore for MockStore {
        async fn load_projection_position(&self, _projection_name: &str) -> Result<i64> {
            let state = self.state.lock().unwrap();
            Ok(state.position)
        }

        async fn store_projection_position(
            &self,
            _projection_name: &str,
            global_sequence: i64,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.position = global_sequence;
            Ok(())
        }
    }

    /// Fails to decode the first record it sees, then accepts everything.
    struct DecodeOnceFails {
        calls: Arc<AtomicUsize>,
    }

    impl DecodeOnceFails {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Projection for DecodeOnceFails {
        fn name(&self) -> &'static str {
            "decode-once-fails"
        }

        fn handle<'a>(&'a self, event: ProjectionEvent) -> BoxFuture<'a, Result<()>> {
            let calls = Arc::clone(&self.calls);
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    serde_json::from_value::<u64>(event.payload)?;
                }
                Ok(())
            })
        }
    }

    fn stored(global_sequence: i64, instance: InstanceKey, sequence: i64, payload: Value) -> StoredEvent {
        StoredEvent {
            global_sequence,
            process_id: "newsletterSubscription".to_string(),
            instance,
            sequence,
            payload,
            created_at: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(global_sequence),
        }
    }

    fn created(instance: InstanceKey, global_sequence: i64, correlation_key: &str) -> StoredEvent {
        stored(
            global_sequence,
            instance,
            0,
            json!({
                "kind": "created",
                "process_id": "newsletterSubscription",
                "correlation_key": correlation_key,
                "variables": {"subscriptionId": correlation_key},
            }),
        )
    }

    fn state_entered(
        instance: InstanceKey,
        global_sequence: i64,
        sequence: i64,
        state: &str,
        terminal: bool,
    ) -> StoredEvent {
        stored(
            global_sequence,
            instance,
            sequence,
            json!({"kind": "state_entered", "state": state, "terminal": terminal}),
        )
    }

    #[tokio::test]
    async fn failed_record_is_retried_after_backoff() {
        let event = stored(1, InstanceKey::generate(), 0, json!({"kind": "created"}));

        let store = MockStore::new(vec![event]);
        let projection = Arc::new(DecodeOnceFails::new());
        let config = ProjectionConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 10,
            error_backoff_base: Duration::from_millis(200),
            error_backoff_max: Duration::from_millis(200),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker =
            ProjectionWorker::new(store, projection.clone(), config, "worker-1".to_string());
        let handle = tokio::spawn(worker.run(shutdown_rx));

        async fn wait_for_calls(
            projection: &DecodeOnceFails,
            target: usize,
            timeout: Duration,
        ) -> tokio::time::Instant {
            let start = tokio::time::Instant::now();
            loop {
                if projection.calls() >= target {
                    return tokio::time::Instant::now();
                }
                if start.elapsed() > timeout {
                    panic!("timed out waiting for {} calls", target);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        let first_at = wait_for_calls(&projection, 1, Duration::from_millis(200)).await;
        let second_at = wait_for_calls(&projection, 2, Duration::from_secs(1)).await;
        assert!(second_at.duration_since(first_at) >= Duration::from_millis(150));

        let _ = shutdown_tx.send(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn summaries_follow_state_changes() {
        let first = InstanceKey::generate();
        let second = InstanceKey::generate();
        let store = MockStore::new(vec![
            created(first, 1, "sub-1"),
            state_entered(first, 2, 1, "AwaitingConfirmation", false),
            created(second, 3, "sub-2"),
            state_entered(second, 4, 1, "AwaitingConfirmation", false),
            stored(5, first, 2, json!({"kind": "event", "event": {"type": "Confirmed"}})),
            state_entered(first, 6, 3, "Confirmed", true),
        ]);
        let summaries = Arc::new(InstanceSummaries::new());
        let worker = ProjectionWorker::new(
            store,
            Arc::clone(&summaries),
            ProjectionConfig::default(),
            "worker-1".to_string(),
        );

        assert_eq!(worker.process_batch().await.unwrap(), 6);
        assert_eq!(worker.process_batch().await.unwrap(), 0);

        let all = summaries.query(&InstanceFilter::new());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].instance, first);
        assert_eq!(all[0].state, "Confirmed");
        assert_eq!(all[0].version, 4);
        assert_eq!(all[0].status(), InstanceStatus::Completed);

        let active = summaries.query(&InstanceFilter::new().status(InstanceStatus::Active));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].correlation_key, CorrelationKey::new("sub-2"));

        let by_key = summaries.query(&InstanceFilter::new().correlation_key("sub-1"));
        assert_eq!(by_key.len(), 1);
        assert_eq!(by_key[0].instance, first);

        assert!(
            summaries
                .query(&InstanceFilter::new().process_id("other"))
                .is_empty()
        );
        assert_eq!(summaries.query(&InstanceFilter::new().limit(1)).len(), 1);
    }
}
