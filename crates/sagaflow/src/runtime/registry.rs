//! Process and handler registries, engine builder, and the worker runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::config::{EngineConfig, RuntimeConfig};
use super::job_worker::JobWorker;
use super::timer_worker::TimerWorker;
use crate::decider::{self, Outcome};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::gateway::EngineGateway;
use crate::job::{JobHandler, RetryPolicy};
use crate::projection::{InstanceSummaries, ProjectionConfig, ProjectionWorker};
use crate::store::{EngineStore, Incident, IncidentQuery, Store};
use crate::workflow::{InstanceKey, InstanceRef, Signal, Workflow};

/// Type-erased process definition for dynamic dispatch.
///
/// This trait allows the registry to store different workflow types in a
/// single map while preserving type-safe execution.
#[async_trait]
pub(crate) trait ProcessEntry: Send + Sync {
    /// Whether the definition can start before `element`.
    fn supports_start_before(&self, element: &str) -> bool;

    /// Execute a signal for this definition.
    ///
    /// Deserializes a timer payload and routes to the typed decider.
    async fn execute(&self, key: InstanceKey, signal: Signal<Value>) -> Result<Outcome>;
}

/// Typed entry that captures the workflow type at registration.
struct TypedProcessEntry<W, S>
where
    W: Workflow,
    S: Store,
{
    workflow: W,
    store: S,
}

#[async_trait]
impl<W, S> ProcessEntry for TypedProcessEntry<W, S>
where
    W: Workflow,
    S: Store,
{
    fn supports_start_before(&self, element: &str) -> bool {
        W::supports_start_before(element)
    }

    async fn execute(&self, key: InstanceKey, signal: Signal<Value>) -> Result<Outcome> {
        let signal = signal.try_map_timer(serde_json::from_value::<W::Timer>)?;
        decider::execute(&self.workflow, &self.store, key, signal).await
    }
}

/// Registry mapping process ids to their definitions.
pub(crate) struct ProcessRegistry {
    entries: HashMap<&'static str, Arc<dyn ProcessEntry>>,
}

impl ProcessRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up a definition by process id.
    pub(crate) fn get(&self, process_id: &str) -> Option<&Arc<dyn ProcessEntry>> {
        self.entries.get(process_id)
    }

    /// Look up a definition, failing with `InvalidDefinition` if unknown.
    pub(crate) fn require(&self, process_id: &str) -> Result<&Arc<dyn ProcessEntry>> {
        self.get(process_id).ok_or_else(|| {
            Error::InvalidDefinition(format!("process '{process_id}' is not registered"))
        })
    }

    /// Returns the number of registered definitions.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A handler with the retry policy it runs under.
pub(crate) struct RegisteredHandler {
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) retry_policy: RetryPolicy,
}

/// Registry mapping task types to handlers.
pub(crate) struct HandlerRegistry {
    entries: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    /// Look up the handler for a task type.
    pub(crate) fn get(&self, task_type: &str) -> Option<&RegisteredHandler> {
        self.entries.get(task_type)
    }

    /// The registered task types, sorted.
    pub(crate) fn task_types(&self) -> Vec<String> {
        let mut task_types: Vec<String> = self.entries.keys().cloned().collect();
        task_types.sort();
        task_types
    }

    /// Returns the number of registered handlers.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Builder for constructing an [`Engine`].
///
/// Registers process definitions and job handlers, and configures the
/// runtime before anything runs. Duplicate registrations are reported by
/// [`build`](Self::build) so that a misconfigured engine never starts.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::builder(MemoryStore::new())
///     .register_process(SubscriptionWorkflow::default())
///     .register_handler(task_types::SEND_WELCOME_MAIL, welcome_worker)
///     .config(RuntimeConfig {
///         job_poll_interval: Duration::from_millis(50),
///         ..Default::default()
///     })
///     .build()?;
/// ```
pub struct EngineBuilder<S>
where
    S: EngineStore,
{
    store: S,
    processes: ProcessRegistry,
    handlers: HashMap<String, (Arc<dyn JobHandler>, Option<RetryPolicy>)>,
    duplicate_process: Option<String>,
    duplicate_task_type: Option<String>,
    config: RuntimeConfig,
    engine_config: EngineConfig,
}

impl<S> EngineBuilder<S>
where
    S: EngineStore,
{
    /// Create a new builder over the given store.
    pub(crate) fn new(store: S) -> Self {
        Self {
            store,
            processes: ProcessRegistry::new(),
            handlers: HashMap::new(),
            duplicate_process: None,
            duplicate_task_type: None,
            config: RuntimeConfig::default(),
            engine_config: EngineConfig::default(),
        }
    }

    /// Register a process definition.
    ///
    /// The workflow's `PROCESS_ID` is used as the key for routing. Each
    /// process id can only be registered once.
    pub fn register_process<W: Workflow>(mut self, workflow: W) -> Self {
        if self.processes.entries.contains_key(W::PROCESS_ID) {
            if self.duplicate_process.is_none() {
                self.duplicate_process = Some(W::PROCESS_ID.to_string());
            }
            return self;
        }

        let entry = TypedProcessEntry {
            workflow,
            store: self.store.clone(),
        };
        self.processes.entries.insert(W::PROCESS_ID, Arc::new(entry));
        self
    }

    /// Register the handler for a task type.
    ///
    /// Uses the runtime's default retry policy. Each task type can only be
    /// registered once.
    pub fn register_handler<H: JobHandler>(self, task_type: impl Into<String>, handler: H) -> Self {
        self.insert_handler(task_type.into(), Arc::new(handler), None)
    }

    /// Register the handler for a task type with its own retry policy.
    pub fn register_handler_with_retry<H: JobHandler>(
        self,
        task_type: impl Into<String>,
        handler: H,
        retry_policy: RetryPolicy,
    ) -> Self {
        self.insert_handler(task_type.into(), Arc::new(handler), Some(retry_policy))
    }

    fn insert_handler(
        mut self,
        task_type: String,
        handler: Arc<dyn JobHandler>,
        retry_policy: Option<RetryPolicy>,
    ) -> Self {
        if self.handlers.contains_key(&task_type) {
            if self.duplicate_task_type.is_none() {
                self.duplicate_task_type = Some(task_type);
            }
            return self;
        }

        self.handlers.insert(task_type, (handler, retry_policy));
        self
    }

    /// Set the runtime configuration.
    ///
    /// If not called, uses [`RuntimeConfig::default()`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the gateway configuration.
    ///
    /// If not called, uses [`EngineConfig::default()`].
    pub fn engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = engine_config;
        self
    }

    /// Build the engine (gateway + runtime).
    ///
    /// Fails on duplicate registrations or an invalid retry policy.
    pub fn build(self) -> Result<Engine<S>> {
        if let Some(process_id) = self.duplicate_process {
            return Err(Error::DuplicateProcessDefinition(process_id));
        }
        if let Some(task_type) = self.duplicate_task_type {
            return Err(Error::DuplicateTaskType(task_type));
        }
        self.config.retry_policy.validate()?;

        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (task_type, (handler, retry_policy)) in self.handlers {
            let retry_policy = retry_policy.unwrap_or_else(|| self.config.retry_policy.clone());
            retry_policy.validate()?;
            handlers.insert(
                task_type,
                RegisteredHandler {
                    handler,
                    retry_policy,
                },
            );
        }

        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let summaries = Arc::new(InstanceSummaries::new());
        let gateway = Arc::new(EngineGateway::new(
            self.store.clone(),
            Arc::new(self.processes),
            Arc::clone(&summaries),
            self.engine_config.message_ttl,
        ));

        let runtime = WorkflowRuntime {
            store: self.store,
            gateway: Arc::clone(&gateway),
            handlers: Arc::new(HandlerRegistry { entries: handlers }),
            summaries,
            config: self.config,
            projection: self.engine_config.projection,
            worker_id,
        };

        Ok(Engine { gateway, runtime })
    }
}

/// Job and timer execution runtime.
///
/// The runtime coordinates job workers, timer workers and the
/// instance-summary projection. It routes task completions and fired timers
/// back to the owning instance through the process registry.
///
/// # Lifecycle
///
/// 1. Create with [`Engine::builder(store)`](Engine::builder)
/// 2. Register processes and handlers on the [`EngineBuilder`]
/// 3. Build with [`EngineBuilder::build()`]
/// 4. Run with [`WorkflowRuntime::run()`], or step with [`WorkflowRuntime::drain()`]
#[derive(Clone)]
pub struct WorkflowRuntime<S>
where
    S: EngineStore,
{
    pub(crate) store: S,
    gateway: Arc<EngineGateway<S>>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    summaries: Arc<InstanceSummaries>,
    pub(crate) config: RuntimeConfig,
    projection: ProjectionConfig,
    worker_id: String,
}

impl<S> WorkflowRuntime<S>
where
    S: EngineStore,
{
    /// Returns the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the worker identifier.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns the number of registered job handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Returns the number of registered process definitions.
    pub fn process_count(&self) -> usize {
        self.gateway.registry().len()
    }

    /// Deliver a signal to an instance through its definition.
    pub(crate) async fn deliver(&self, instance: &InstanceRef, signal: Signal<Value>) -> Result<Outcome> {
        let entry = self.gateway.registry().require(instance.process_id())?;
        entry.execute(instance.key(), signal).await
    }

    fn projection_worker(&self, worker_id: String) -> ProjectionWorker<S, InstanceSummaries> {
        ProjectionWorker::new(
            self.store.clone(),
            Arc::clone(&self.summaries),
            self.projection.clone(),
            worker_id,
        )
    }

    /// Run the job, timer and projection workers until shutdown signal.
    ///
    /// - Job workers: claim activations and invoke handlers
    /// - Timer workers: deliver due timers to their instances
    /// - Projection worker: keeps instance summaries up to date
    ///
    /// The number of workers is controlled by `job_workers` and
    /// `timer_workers` in [`RuntimeConfig`].
    ///
    /// # Shutdown Behavior
    ///
    /// When the shutdown future completes:
    /// 1. All workers stop claiming new work
    /// 2. Wait for current work (if any) to complete
    /// 3. Close the gateway; later calls fail with `EngineUnavailable`
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tokio::signal;
    ///
    /// // Run until Ctrl+C
    /// engine.runtime.run(async { signal::ctrl_c().await.ok(); }).await?;
    /// ```
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let job_worker_count = self.config.job_workers.max(1);
        let timer_worker_count = self.config.timer_workers.max(1);

        info!(
            worker_id = %self.worker_id,
            processes = self.process_count(),
            handlers = self.handler_count(),
            job_workers = job_worker_count,
            timer_workers = timer_worker_count,
            "Runtime starting"
        );

        let runtime = Arc::new(self);
        let mut worker_handles = Vec::new();

        // Spawn job workers
        for i in 0..job_worker_count {
            let worker_id = if job_worker_count == 1 {
                format!("{}-job", runtime.worker_id)
            } else {
                format!("{}-job-{}", runtime.worker_id, i)
            };

            let job_worker = JobWorker::new(Arc::clone(&runtime), worker_id);
            let job_shutdown_rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                job_worker.run(job_shutdown_rx).await;
            }));
        }

        // Spawn timer workers
        for i in 0..timer_worker_count {
            let worker_id = if timer_worker_count == 1 {
                format!("{}-timer", runtime.worker_id)
            } else {
                format!("{}-timer-{}", runtime.worker_id, i)
            };

            let timer_worker = TimerWorker::new(Arc::clone(&runtime), worker_id);
            let timer_shutdown_rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                timer_worker.run(timer_shutdown_rx).await;
            }));
        }

        let projection_worker =
            runtime.projection_worker(format!("{}-projection", runtime.worker_id));
        let projection_shutdown_rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            projection_worker.run(projection_shutdown_rx).await;
        }));

        // Wait for shutdown signal
        shutdown.await;

        // Signal shutdown to all workers
        let _ = shutdown_tx.send(true);

        // Wait for all workers with timeout
        let shutdown_timeout = runtime.config.shutdown_timeout;
        let all_workers = async {
            for handle in worker_handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(shutdown_timeout, all_workers).await {
            Ok(()) => {
                info!(worker_id = %runtime.worker_id, "Runtime stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %runtime.worker_id,
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }

        runtime.gateway.close();
        Ok(())
    }

    /// Process due timers, activatable jobs and pending projection updates
    /// until nothing is left to do.
    ///
    /// Runs on the caller's task instead of spawned workers, which makes it
    /// the tool of choice for tests driven by a manual clock. Jobs in backoff
    /// and timers that are not yet due are left alone.
    pub async fn drain(&self) -> Result<()> {
        let runtime = Arc::new(self.clone());
        let timers = TimerWorker::new(Arc::clone(&runtime), format!("{}-drain", self.worker_id));
        let jobs = JobWorker::new(Arc::clone(&runtime), format!("{}-drain", self.worker_id));

        loop {
            let mut progressed = false;
            while timers.process_one().await? {
                progressed = true;
            }
            while jobs.process_one().await? {
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        let projection = self.projection_worker(format!("{}-drain", self.worker_id));
        while projection.process_batch().await? > 0 {}
        Ok(())
    }

    /// Fetch open incidents.
    ///
    /// Returns jobs whose retries are exhausted or whose handler reported a
    /// non-retryable failure.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let incidents = engine
    ///     .runtime
    ///     .incidents(IncidentQuery::new().task_type("newsletter.sendWelcomeMail"))
    ///     .await?;
    /// ```
    pub async fn incidents(&self, query: IncidentQuery) -> Result<Vec<Incident>> {
        self.store.fetch_incidents(&query).await
    }

    /// Resolve an incident, making its job activatable again.
    ///
    /// Returns `Ok(true)` if an open incident was found and resolved.
    pub async fn resolve_incident(&self, job_key: Uuid) -> Result<bool> {
        let resolved = self.store.resolve_incident(job_key).await?;
        if resolved {
            info!(job_key = %job_key, "Incident resolved");
        }
        Ok(resolved)
    }
}
