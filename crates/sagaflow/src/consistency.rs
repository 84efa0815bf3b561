//! Consistency contracts of gateway operations.
//!
//! Every operation on the [`ProcessEngine`](crate::ProcessEngine) port
//! declares whether its result reflects all commands acknowledged before it
//! ([`Consistency::Strong`]) or a projection that may lag behind
//! ([`Consistency::Eventual`]). The declaration is carried in the return
//! type, so callers cannot route on eventually consistent data by accident.

use std::ops::Deref;

/// Consistency level of a gateway operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consistency {
    /// The effect is committed before the call returns and is visible to every
    /// later operation.
    Strong,
    /// The result is read from a projection that lags the event stream.
    Eventual,
}

/// The operations exposed by the process engine gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOperation {
    /// Start a new process instance.
    StartInstance,
    /// Deliver a correlated message.
    SendMessage,
    /// Search process instances.
    QueryInstances,
}

impl GatewayOperation {
    /// The consistency contract of the operation.
    ///
    /// ```
    /// use sagaflow::{Consistency, GatewayOperation};
    ///
    /// assert_eq!(GatewayOperation::SendMessage.consistency(), Consistency::Strong);
    /// assert_eq!(GatewayOperation::QueryInstances.consistency(), Consistency::Eventual);
    /// ```
    pub const fn consistency(self) -> Consistency {
        match self {
            GatewayOperation::StartInstance | GatewayOperation::SendMessage => Consistency::Strong,
            GatewayOperation::QueryInstances => Consistency::Eventual,
        }
    }
}

/// A result produced under strong consistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Strong<T>(pub T);

impl<T> Strong<T> {
    /// The consistency level of this wrapper.
    pub const CONSISTENCY: Consistency = Consistency::Strong;

    /// Unwrap the value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Strong<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// A result read from an eventually consistent projection.
///
/// May not yet reflect commands acknowledged before the read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Eventual<T>(pub T);

impl<T> Eventual<T> {
    /// The consistency level of this wrapper.
    pub const CONSISTENCY: Consistency = Consistency::Eventual;

    /// Unwrap the value, acknowledging that it may be stale.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Eventual<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
