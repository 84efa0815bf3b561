//! Saga orchestration core for long-running business processes.
//!
//! Sagaflow runs process definitions as event-sourced instances:
//!
//! - **Pure decisions**: [`Workflow::evolve`] and [`Workflow::decide`] are
//!   deterministic and record every transition as events
//! - **Correlated messages**: instances waiting for a message are bound to a
//!   business key and receive messages through the [`ProcessEngine`] gateway
//! - **Durable timers and jobs**: reminders, timeouts and task activations are
//!   committed with the transition and processed by background workers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  start / message  ┌──────────────────────────────────────┐
//! │ Application  │ ────────────────► │ EngineGateway (ProcessEngine)        │
//! └──────────────┘                   │                                      │
//!        ▲                           │  1. Begin unit of work (lock)        │
//!        │ query (eventual)          │  2. Replay stream → state            │
//!        │                           │  3. decide(now, state, signal)       │
//!        │                           │  4. Append events, jobs, timers      │
//!        │                           │  5. Bind / unbind correlation        │
//!        │                           │  6. Commit                           │
//!        │                           └──────────────────────────────────────┘
//!        │                                  ▲                 ▲
//!        │                        TaskCompleted            Timer
//!        │                                  │                 │
//!        │                           ┌──────┴─────┐    ┌──────┴──────┐
//!        └── InstanceSummaries ◄──── │ JobWorker  │    │ TimerWorker │
//!                                    └────────────┘    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sagaflow::subscription::{NewsletterSubscriptionProcess, SubscriptionWorkflow, task_types};
//! use sagaflow::{Engine, MemoryStore};
//!
//! let engine = Engine::builder(MemoryStore::new())
//!     .register_process(SubscriptionWorkflow::default())
//!     .register_handler(task_types::SEND_CONFIRMATION_MAIL, confirmation_worker)
//!     .register_handler(task_types::SEND_WELCOME_MAIL, welcome_worker)
//!     .register_handler(task_types::ABORT_REGISTRATION, abort_worker)
//!     .build()?;
//!
//! let process = NewsletterSubscriptionProcess::new(engine.gateway());
//! tokio::spawn(engine.clone().run(shutdown_signal()));
//!
//! process.submit_form(subscription_id).await?;
//! process.confirm(subscription_id).await?;
//! ```
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

mod clock;
mod consistency;
mod correlation;
mod decider;
mod engine;
mod error;
mod gateway;
pub mod job;
mod projection;
pub mod runtime;
pub mod store;
pub mod subscription;
mod timer;
mod variables;
mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use consistency::{Consistency, Eventual, GatewayOperation, Strong};
pub use correlation::{BindOutcome, CorrelationEntry, CorrelationIndex, CorrelationKey};
pub use engine::Engine;
pub use error::{Error, Result};
pub use gateway::{EngineGateway, ProcessEngine};
pub use nonempty::NonEmpty;
pub use projection::{
    InstanceFilter, InstanceStatus, InstanceSummary, Projection, ProjectionConfig,
    ProjectionEvent, ProjectionWorker,
};
pub use runtime::{EngineBuilder, EngineConfig, RuntimeConfig, WorkflowRuntime};
pub use store::{EventStore, MemoryStore, ProjectionStore, Store, StoredEvent};
pub use timer::Timer;
pub use variables::Variables;
pub use workflow::{
    Decision, InstanceKey, InstanceRef, ProcessInstance, Signal, TaskRequest, Workflow,
};
