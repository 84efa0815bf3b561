//! Engine bundle.

use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::gateway::EngineGateway;
use crate::runtime::{EngineBuilder, WorkflowRuntime};
use crate::store::{EngineStore, Incident, IncidentQuery};

/// Convenience bundle for a gateway + runtime pair.
///
/// The gateway is shared with adapters (as `Arc<dyn ProcessEngine>`); the
/// runtime is either run until shutdown or stepped with [`drain`](Self::drain).
#[derive(Clone)]
pub struct Engine<S>
where
    S: EngineStore,
{
    pub gateway: Arc<EngineGateway<S>>,
    pub runtime: WorkflowRuntime<S>,
}

impl<S> Engine<S>
where
    S: EngineStore,
{
    /// Create a new engine builder over `store`.
    pub fn builder(store: S) -> EngineBuilder<S> {
        EngineBuilder::new(store)
    }

    /// Clone the gateway handle.
    pub fn gateway(&self) -> Arc<EngineGateway<S>> {
        Arc::clone(&self.gateway)
    }

    /// Run workers until `shutdown` completes, then close the gateway.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.runtime.run(shutdown).await
    }

    /// See [`WorkflowRuntime::drain`].
    pub async fn drain(&self) -> Result<()> {
        self.runtime.drain().await
    }

    /// See [`WorkflowRuntime::incidents`].
    pub async fn incidents(&self, query: IncidentQuery) -> Result<Vec<Incident>> {
        self.runtime.incidents(query).await
    }

    /// See [`WorkflowRuntime::resolve_incident`].
    pub async fn resolve_incident(&self, job_key: Uuid) -> Result<bool> {
        self.runtime.resolve_incident(job_key).await
    }
}
