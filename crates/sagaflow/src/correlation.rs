//! Instance correlation index.
//!
//! Maps an external business key (e.g. a subscription id) to the single
//! instance currently waiting for a message under that key. The decider binds
//! an entry when an instance enters a message-waiting state and unbinds it
//! when the instance leaves that state by any path; message delivery resolves
//! entries to find its target.
//!
//! All mutations are compare-and-swap style: [`CorrelationIndex::bind`] only
//! succeeds if the key is free, owned by the same instance, or owned by an
//! instance that is no longer live, and [`CorrelationIndex::unbind`] only
//! removes an entry whose owner matches.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::workflow::InstanceKey;

/// Business correlation key used to route messages to a waiting instance.
///
/// # Example
///
/// ```
/// use sagaflow::CorrelationKey;
///
/// let key = CorrelationKey::new("4a607799-804b-43d1-8aa2-bdcc4dfd9b86");
/// assert_eq!(key.as_str(), "4a607799-804b-43d1-8aa2-bdcc4dfd9b86");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Create a new correlation key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for CorrelationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// An active binding: which instance waits, and for which message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    /// The waiting instance.
    pub instance: InstanceKey,
    /// The process definition of the waiting instance.
    pub process_id: String,
    /// The message the instance is waiting for.
    pub message_name: String,
}

/// Outcome of a successful [`CorrelationIndex::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The key was free (or held by a dead instance) and is now bound.
    Bound,
    /// The key was already bound to the same instance; nothing changed.
    AlreadyBound,
}

/// Thread-safe correlation key → waiting instance map.
#[derive(Debug, Default)]
pub struct CorrelationIndex {
    entries: RwLock<HashMap<CorrelationKey, CorrelationEntry>>,
    bound: Notify,
}

impl CorrelationIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `entry.instance`.
    ///
    /// Binding the same key to the same instance again is a no-op
    /// ([`BindOutcome::AlreadyBound`], the awaited message is refreshed).
    /// An entry owned by a different instance is only replaced if `is_live`
    /// reports that owner as dead; otherwise the bind is rejected with
    /// [`Error::DuplicateCorrelation`] and the existing entry is kept.
    pub fn bind(
        &self,
        key: CorrelationKey,
        entry: CorrelationEntry,
        is_live: impl Fn(&InstanceKey) -> bool,
    ) -> Result<BindOutcome> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let outcome = match entries.get(&key) {
            Some(existing) if existing.instance == entry.instance => {
                entries.insert(key, entry);
                return Ok(BindOutcome::AlreadyBound);
            }
            Some(existing) if is_live(&existing.instance) => {
                return Err(Error::DuplicateCorrelation {
                    correlation_key: key,
                    existing: existing.instance,
                });
            }
            Some(stale) => {
                debug!(
                    correlation_key = %key,
                    stale_instance = %stale.instance,
                    "Replacing correlation entry of dead instance"
                );
                BindOutcome::Bound
            }
            None => BindOutcome::Bound,
        };

        debug!(
            correlation_key = %key,
            instance = %entry.instance,
            message = %entry.message_name,
            "Correlation bound"
        );
        entries.insert(key, entry);
        drop(entries);
        self.bound.notify_waiters();
        Ok(outcome)
    }

    /// Resolve the instance currently waiting under `key`.
    pub fn resolve(&self, key: &CorrelationKey) -> Option<CorrelationEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Remove the binding for `key` if `owner` holds it.
    ///
    /// Returns `true` if an entry was removed.
    pub fn unbind(&self, key: &CorrelationKey, owner: &InstanceKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(existing) if existing.instance == *owner => {
                entries.remove(key);
                debug!(correlation_key = %key, instance = %owner, "Correlation unbound");
                true
            }
            _ => false,
        }
    }

    /// Number of active bindings.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the next successful bind.
    ///
    /// Register interest *before* re-checking with [`resolve`](Self::resolve)
    /// to avoid missing a bind that races with the check.
    pub(crate) fn bound(&self) -> tokio::sync::futures::Notified<'_> {
        self.bound.notified()
    }
}
