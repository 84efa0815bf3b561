use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sagaflow::job::RetryPolicy;
use sagaflow::store::{InstanceQueryStore, ScheduledTimer};
use sagaflow::subscription::workers::{
    AbortRegistrationWorker, ConfirmationMailWorker, WelcomeMailWorker,
};
use sagaflow::subscription::{
    EscalationPolicy, NewsletterSubscriptionProcess, SubscriptionId, SubscriptionState,
    SubscriptionWorkflow, task_types,
};
use sagaflow::{
    Engine, EngineConfig, InstanceKey, ManualClock, MemoryStore, ProcessInstance, RuntimeConfig,
};
use tokio::task::JoinHandle;

use super::use_cases::RecordingUseCases;

pub const TEST_MAX_ATTEMPTS: u32 = 3;
pub const TEST_MESSAGE_TTL: Duration = Duration::from_millis(50);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fast runtime config for tests.
pub fn test_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        job_poll_interval: Duration::from_millis(10),
        timer_poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
        retry_policy: RetryPolicy {
            max_attempts: TEST_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        },
        worker_id: Some("test".into()),
        ..Default::default()
    }
}

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        message_ttl: TEST_MESSAGE_TTL,
        ..Default::default()
    }
}

/// Subscription engine on a manual clock with recording use cases.
pub struct TestApp {
    pub clock: ManualClock,
    pub store: MemoryStore,
    pub engine: Engine<MemoryStore>,
    pub process: NewsletterSubscriptionProcess,
    pub use_cases: Arc<RecordingUseCases>,
}

pub struct TestAppBuilder {
    policy: EscalationPolicy,
    runtime_config: RuntimeConfig,
    engine_config: EngineConfig,
}

impl TestAppBuilder {
    pub fn policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn message_ttl(mut self, message_ttl: Duration) -> Self {
        self.engine_config.message_ttl = message_ttl;
        self
    }

    pub fn build(self) -> Result<TestApp> {
        let clock = ManualClock::deterministic();
        let store = MemoryStore::with_clock(clock.clone());
        let use_cases = Arc::new(RecordingUseCases::default());

        let engine = Engine::builder(store.clone())
            .register_process(SubscriptionWorkflow::new(self.policy)?)
            .register_handler(
                task_types::SEND_CONFIRMATION_MAIL,
                ConfirmationMailWorker::new(use_cases.clone()),
            )
            .register_handler(
                task_types::SEND_WELCOME_MAIL,
                WelcomeMailWorker::new(use_cases.clone()),
            )
            .register_handler(
                task_types::ABORT_REGISTRATION,
                AbortRegistrationWorker::new(use_cases.clone()),
            )
            .config(self.runtime_config)
            .engine_config(self.engine_config)
            .build()?;

        let process = NewsletterSubscriptionProcess::new(engine.gateway());

        Ok(TestApp {
            clock,
            store,
            engine,
            process,
            use_cases,
        })
    }
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            policy: EscalationPolicy::default(),
            runtime_config: test_runtime_config(),
            engine_config: test_engine_config(),
        }
    }

    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Move the clock forward, then process everything that became due.
    pub async fn advance(&self, duration: Duration) -> Result<()> {
        self.clock.advance(duration);
        self.drain().await
    }

    pub async fn drain(&self) -> Result<()> {
        self.engine.drain().await.context("draining runtime")
    }

    /// Submit a form for a fresh subscription and process the activations.
    pub async fn subscribe(&self) -> Result<(SubscriptionId, InstanceKey)> {
        let id = SubscriptionId::new_v4();
        let key = self.process.submit_form(id).await?;
        self.drain().await?;
        Ok((id, key))
    }

    pub async fn instance(&self, key: InstanceKey) -> Result<ProcessInstance<SubscriptionState>> {
        Ok(self
            .engine
            .gateway
            .instance::<SubscriptionWorkflow>(key)
            .await?
            .into_inner())
    }

    pub async fn pending_timers(&self, key: InstanceKey) -> Result<Vec<ScheduledTimer>> {
        Ok(self.store.pending_timers(key).await?)
    }

    /// Spawn the runtime workers; the handle stops them on [`Running::shutdown`].
    pub fn spawn(&self) -> Running {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            engine
                .run(async move {
                    let _ = shutdown_rx.await;
                })
                .await
                .map_err(anyhow::Error::from)
        });

        Running {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

/// Spawned runtime. Drop signals shutdown.
pub struct Running {
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Running {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await??;
        }
        Ok(())
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Event types of a replayed stream, skipping bookkeeping records.
pub async fn event_types(store: &MemoryStore, key: InstanceKey) -> Result<Vec<String>> {
    let records = store.fetch_instance_events(key).await?;
    Ok(records
        .into_iter()
        .filter(|record| record.payload["kind"] == "event")
        .map(|record| {
            record.payload["event"]["type"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect())
}
