//! Process engine gateway.
//!
//! The gateway is the application-facing port of the engine: it starts
//! instances, delivers correlated messages and lists instances. Every
//! operation declares its consistency contract in its return type:
//!
//! | Operation | Consistency | Returns |
//! |-----------|-------------|---------|
//! | [`start_instance`](ProcessEngine::start_instance) | strong | [`Strong<InstanceKey>`] |
//! | [`send_message`](ProcessEngine::send_message) | strong | [`Strong<()>`] |
//! | [`query_instances`](ProcessEngine::query_instances) | eventual | [`Eventual<Vec<InstanceSummary>>`] |
//!
//! Strong operations return after the resulting transition committed.
//! Eventual reads are served from a projection that lags the instance
//! streams and must never be used to route messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::consistency::{Eventual, Strong};
use crate::correlation::CorrelationKey;
use crate::decider::{self, Outcome};
use crate::error::{Error, Result};
use crate::projection::{InstanceFilter, InstanceSummaries, InstanceSummary};
use crate::runtime::registry::ProcessRegistry;
use crate::store::{InstanceQueryStore, Store};
use crate::variables::Variables;
use crate::workflow::{InstanceKey, ProcessInstance, Signal, Workflow};

/// Application-facing process engine operations.
///
/// Adapters depend on this trait (usually as `Arc<dyn ProcessEngine>`), not
/// on the concrete gateway.
#[async_trait]
pub trait ProcessEngine: Send + Sync {
    /// Start a new instance of `process_id` with the given variables.
    ///
    /// Returns after the start transition, including the correlation
    /// binding, has committed.
    ///
    /// # Errors
    ///
    /// - [`Error::EngineUnavailable`] if the engine has shut down
    /// - [`Error::InvalidDefinition`] if `process_id` is not registered
    /// - [`Error::MissingVariable`] if the correlation variable is absent
    /// - [`Error::DuplicateCorrelation`] if a live instance waits on the same key
    async fn start_instance(
        &self,
        process_id: &str,
        variables: Variables,
    ) -> Result<Strong<InstanceKey>>;

    /// Deliver a message to the instance waiting on `correlation_key`.
    ///
    /// Returns after the receiving transition has committed. If no instance
    /// waits yet, waits up to the message TTL for one to bind.
    ///
    /// # Errors
    ///
    /// - [`Error::EngineUnavailable`] if the engine has shut down
    /// - [`Error::NoWaitingInstance`] if no instance awaits the message
    async fn send_message(
        &self,
        message_name: &str,
        correlation_key: &CorrelationKey,
        variables: Variables,
    ) -> Result<Strong<()>>;

    /// List instances matching `filter`.
    async fn query_instances(&self, filter: InstanceFilter) -> Result<Eventual<Vec<InstanceSummary>>>;
}

/// The engine's [`ProcessEngine`] implementation.
///
/// Built by [`EngineBuilder::build`](crate::runtime::EngineBuilder::build)
/// and shared as `Arc<EngineGateway<S>>`.
pub struct EngineGateway<S>
where
    S: Store + InstanceQueryStore,
{
    store: S,
    registry: Arc<ProcessRegistry>,
    summaries: Arc<InstanceSummaries>,
    message_ttl: Duration,
    closed: AtomicBool,
}

impl<S> EngineGateway<S>
where
    S: Store + InstanceQueryStore,
{
    pub(crate) fn new(
        store: S,
        registry: Arc<ProcessRegistry>,
        summaries: Arc<InstanceSummaries>,
        message_ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            summaries,
            message_ttl,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Stop accepting commands; later calls fail with `EngineUnavailable`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Gateway closed");
        }
    }

    /// Returns `true` once the gateway has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::EngineUnavailable("engine has shut down".into()));
        }
        Ok(())
    }

    /// Start an instance before a specific element of its definition.
    ///
    /// Used to enter a process mid-flow, for example waiting for a
    /// confirmation without sending the first mail.
    ///
    /// # Errors
    ///
    /// Same as [`ProcessEngine::start_instance`], plus
    /// [`Error::InvalidDefinition`] if the definition cannot start before
    /// `element`.
    pub async fn start_instance_before(
        &self,
        process_id: &str,
        element: &str,
        variables: Variables,
    ) -> Result<Strong<InstanceKey>> {
        self.start(process_id, Some(element), variables).await
    }

    /// Load an instance by replaying its stream.
    pub async fn instance<W: Workflow>(&self, key: InstanceKey) -> Result<Strong<ProcessInstance<W::State>>> {
        decider::load::<W, _>(&self.store, key).await.map(Strong)
    }

    async fn start(
        &self,
        process_id: &str,
        start_before: Option<&str>,
        variables: Variables,
    ) -> Result<Strong<InstanceKey>> {
        self.ensure_open()?;
        let entry = self.registry.require(process_id)?;

        if let Some(element) = start_before {
            if !entry.supports_start_before(element) {
                return Err(Error::InvalidDefinition(format!(
                    "process '{process_id}' cannot start before '{element}'"
                )));
            }
        }

        let key = InstanceKey::generate();
        let signal = Signal::Start {
            variables,
            start_before: start_before.map(str::to_string),
        };

        match entry.execute(key, signal).await? {
            Outcome::Committed { to, .. } => {
                info!(process_id, instance = %key, state = to, "Instance started");
                Ok(Strong(key))
            }
            // Only possible if a freshly generated key already has a stream
            Outcome::Skipped(_) => Err(Error::EngineUnavailable(format!(
                "instance {key} could not be created"
            ))),
        }
    }
}

#[async_trait]
impl<S> ProcessEngine for EngineGateway<S>
where
    S: Store + InstanceQueryStore,
{
    async fn start_instance(
        &self,
        process_id: &str,
        variables: Variables,
    ) -> Result<Strong<InstanceKey>> {
        self.start(process_id, None, variables).await
    }

    async fn send_message(
        &self,
        message_name: &str,
        correlation_key: &CorrelationKey,
        variables: Variables,
    ) -> Result<Strong<()>> {
        self.ensure_open()?;
        let no_waiting_instance = || Error::NoWaitingInstance {
            message_name: message_name.to_string(),
            correlation_key: correlation_key.clone(),
        };

        let correlations = self.store.correlations();
        let deadline = tokio::time::Instant::now() + self.message_ttl;

        loop {
            // Register interest before resolving so a bind in between is not missed.
            let bound = correlations.bound();
            tokio::pin!(bound);
            bound.as_mut().enable();

            if let Some(entry) = correlations
                .resolve(correlation_key)
                .filter(|entry| entry.message_name == message_name)
            {
                let process = self.registry.require(&entry.process_id)?;
                let signal = Signal::Message {
                    name: message_name.to_string(),
                    variables,
                };

                return match process.execute(entry.instance, signal).await? {
                    Outcome::Committed { from, to, .. } => {
                        debug!(
                            message = message_name,
                            correlation_key = %correlation_key,
                            instance = %entry.instance,
                            from,
                            to,
                            "Message correlated"
                        );
                        Ok(Strong(()))
                    }
                    // The instance left the waiting state before we got its lock
                    Outcome::Skipped(_) => Err(no_waiting_instance()),
                };
            }

            if tokio::time::timeout_at(deadline, bound).await.is_err() {
                debug!(
                    message = message_name,
                    correlation_key = %correlation_key,
                    "No instance waiting for message"
                );
                return Err(no_waiting_instance());
            }
        }
    }

    async fn query_instances(&self, filter: InstanceFilter) -> Result<Eventual<Vec<InstanceSummary>>> {
        Ok(Eventual(self.summaries.query(&filter)))
    }
}
