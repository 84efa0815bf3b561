//! Job handling types for task activations.
//!
//! This module provides the contract between the engine and the code that
//! performs a workflow's tasks:
//!
//! - [`JobHandler`]: Trait implemented per task type
//! - [`ActivatedJob`]: The activation handed to a handler, with typed input
//! - [`HandlerFailure`]: Failure reported by a handler
//! - [`RetryPolicy`]: Configuration for exponential backoff

mod activated;
mod handler;
mod retry;

pub use activated::ActivatedJob;
pub use handler::{HandlerFailure, JobHandler};
pub use retry::RetryPolicy;
