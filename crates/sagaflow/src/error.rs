//! Error types for sagaflow.

use thiserror::Error;

use crate::correlation::CorrelationKey;
use crate::workflow::InstanceKey;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sagaflow operations.
///
/// Only [`Error::EngineUnavailable`] is worth retrying with backoff. The
/// remaining variants describe logic or configuration errors and are surfaced
/// to the caller as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine cannot accept commands (closed or shut down).
    #[error("process engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The process id is not registered, or cannot start where requested.
    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    /// No instance is waiting for this message under this correlation key.
    #[error("no instance waiting for message {message_name} with correlation key {correlation_key}")]
    NoWaitingInstance {
        /// The message that could not be delivered.
        message_name: String,
        /// The correlation key that was not bound.
        correlation_key: CorrelationKey,
    },

    /// Another live instance is already bound to this correlation key.
    #[error("correlation key {correlation_key} is already bound to instance {existing}")]
    DuplicateCorrelation {
        /// The contested correlation key.
        correlation_key: CorrelationKey,
        /// The live instance that owns the key.
        existing: InstanceKey,
    },

    /// A required process variable is missing or has the wrong shape.
    #[error("missing or invalid process variable: {0}")]
    MissingVariable(String),

    /// No instance exists under this key.
    #[error("process instance not found: {0}")]
    InstanceNotFound(InstanceKey),

    /// The job is unknown or was already completed.
    #[error("job not found or already completed: {0}")]
    JobNotFound(uuid::Uuid),

    /// A task type was registered with more than one handler.
    #[error("duplicate handler registration for task type: {0}")]
    DuplicateTaskType(String),

    /// A process definition was registered more than once.
    #[error("duplicate process definition registration: {0}")]
    DuplicateProcessDefinition(String),

    /// A workflow policy failed validation.
    #[error("invalid workflow policy: {0}")]
    InvalidPolicy(String),

    /// Failed to serialize or deserialize variables, events or timer payloads.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to deserialize an event during replay.
    ///
    /// Includes the process id, instance key and the event's position in
    /// the instance stream (0-indexed).
    #[error("failed to deserialize event at sequence {sequence} for {process_id}:{instance}: {source}")]
    EventDeserialization {
        /// The process definition id.
        process_id: String,
        /// The instance whose stream failed to replay.
        instance: InstanceKey,
        /// The event's position in the stream (0-indexed).
        sequence: usize,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create an event deserialization error with context.
    pub fn event_deserialization(
        process_id: impl Into<String>,
        instance: InstanceKey,
        sequence: usize,
        source: serde_json::Error,
    ) -> Self {
        Error::EventDeserialization {
            process_id: process_id.into(),
            instance,
            sequence,
            source,
        }
    }

    /// Returns `true` if the caller may retry the command with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::EngineUnavailable(_))
    }
}
