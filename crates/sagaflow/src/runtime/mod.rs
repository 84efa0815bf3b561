//! Runtime for executing jobs and timers.
//!
//! This module provides the infrastructure that moves instances forward
//! between gateway calls:
//!
//! - [`WorkflowRuntime`]: Coordinator that runs job, timer and projection workers
//! - [`EngineBuilder`]: Builder for registering processes and job handlers
//! - [`RuntimeConfig`] / [`EngineConfig`]: Polling intervals, timeouts, message TTL
//!
//! # Example
//!
//! ```ignore
//! use sagaflow::runtime::RuntimeConfig;
//!
//! let engine = Engine::builder(store)
//!     .register_process(SubscriptionWorkflow::default())
//!     .register_handler(task_types::SEND_CONFIRMATION_MAIL, confirmation_worker)
//!     .config(RuntimeConfig::default())
//!     .build()?;
//!
//! engine.runtime.run(shutdown_signal).await?;
//! ```

mod config;
mod job_worker;
pub(crate) mod registry;
mod timer_worker;

pub use config::{EngineConfig, RuntimeConfig};
pub use registry::{EngineBuilder, WorkflowRuntime};
