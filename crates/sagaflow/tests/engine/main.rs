//! Engine integration tests on the in-memory store.
//!
//! Scenarios drive time with a [`sagaflow::ManualClock`] and step the
//! runtime with `drain()`, except where the spawned workers themselves are
//! under test.

mod e2e;
mod gateway;
mod runtime;
mod store;
mod support;
