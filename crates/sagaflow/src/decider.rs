//! Workflow decision execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::correlation::{CorrelationEntry, CorrelationKey};
use crate::error::{Error, Result};
use crate::store::{BeginResult, InstanceQueryStore, NewJob, Store, UnitOfWork};
use crate::variables::Variables;
use crate::workflow::{InstanceKey, InstanceRef, ProcessInstance, Signal, Workflow};

/// A record in an instance stream.
///
/// Workflow events are wrapped together with the engine's own bookkeeping so
/// that replay restores variables and correlation alongside the state, and
/// projections can follow state changes without knowing workflow types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum InstanceRecord<E> {
    Created {
        process_id: String,
        correlation_key: CorrelationKey,
        variables: Variables,
    },
    VariablesMerged {
        variables: Variables,
    },
    Event {
        event: E,
    },
    StateEntered {
        state: String,
        terminal: bool,
    },
}

/// Why a signal was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Skip {
    /// The instance already completed.
    Completed,
    /// The instance does not await the delivered message.
    NotAwaiting,
    /// A start signal hit an existing stream.
    AlreadyStarted,
}

/// Result of executing one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Committed {
        from: &'static str,
        to: &'static str,
        terminal: bool,
    },
    Skipped(Skip),
}

struct Replayed<S> {
    correlation_key: CorrelationKey,
    variables: Variables,
    state: S,
    version: usize,
}

/// Execute a signal against an instance.
///
/// This function:
/// 1. Begins a unit of work (acquires the instance lock, loads records)
/// 2. Skips if the instance completed, or no longer awaits a delivered message
/// 3. Replays records to reconstruct state and variables
/// 4. Merges the signal's variables into the instance
/// 5. Calls `Workflow::decide` with the current state and signal
/// 6. Appends the resulting records
/// 7. Creates task activations with a snapshot of the variables
/// 8. Cancels and schedules timers
/// 9. Binds or unbinds the correlation key as the awaited message changes
/// 10. Marks the instance completed if a terminal state is reached
/// 11. Commits the unit of work
///
/// If any step fails, nothing is persisted.
///
/// # Concurrency
///
/// Executions for different instances run concurrently. Executions for the
/// same instance are serialized by the store's locking.
pub(crate) async fn execute<W, S>(
    workflow: &W,
    store: &S,
    key: InstanceKey,
    signal: Signal<W::Timer>,
) -> Result<Outcome>
where
    W: Workflow,
    S: Store,
{
    let instance = InstanceRef::new(W::PROCESS_ID, key);

    let (records, mut uow) = match store.begin(&instance).await? {
        BeginResult::Active { events, uow } => (events, uow),
        BeginResult::Completed => {
            debug!(instance = %instance, signal = signal.kind(), "Instance completed, signal skipped");
            return Ok(Outcome::Skipped(Skip::Completed));
        }
    };

    let is_start = matches!(signal, Signal::Start { .. });
    let mut new_records: Vec<InstanceRecord<W::Event>> = Vec::new();

    let (correlation_key, variables, state) = match (replay::<W>(key, records)?, &signal) {
        (None, Signal::Start { variables, .. }) => {
            let correlation_key =
                CorrelationKey::new(variables.require_str(W::CORRELATION_VARIABLE)?);
            new_records.push(InstanceRecord::Created {
                process_id: W::PROCESS_ID.to_string(),
                correlation_key: correlation_key.clone(),
                variables: variables.clone(),
            });
            (correlation_key, variables.clone(), W::State::default())
        }
        (Some(_), Signal::Start { .. }) => return Ok(Outcome::Skipped(Skip::AlreadyStarted)),
        (None, _) => return Err(Error::InstanceNotFound(key)),
        (Some(replayed), _) => {
            if let Signal::Message { name, .. } = &signal {
                if W::awaited_message(&replayed.state) != Some(name.as_str()) {
                    debug!(instance = %instance, message = %name, "Message not awaited");
                    return Ok(Outcome::Skipped(Skip::NotAwaiting));
                }
            }

            let mut variables = replayed.variables;
            if let Some(incoming) = signal.variables().filter(|vars| !vars.is_empty()) {
                variables.merge(incoming.clone());
                new_records.push(InstanceRecord::VariablesMerged {
                    variables: incoming.clone(),
                });
            }
            (replayed.correlation_key, variables, replayed.state)
        }
    };

    let from = W::state_name(&state);
    let awaited_before = W::awaited_message(&state);

    let now = store.now();
    let decision = workflow.decide(now, &state, &signal).into_parts();

    // Compute final state by applying new events
    let final_state = decision.events.iter().cloned().fold(state, W::evolve);
    let to = W::state_name(&final_state);
    let terminal = W::is_terminal(&final_state);

    new_records.extend(
        decision
            .events
            .into_iter()
            .map(|event| InstanceRecord::Event { event }),
    );
    if is_start || terminal || to != from {
        new_records.push(InstanceRecord::StateEntered {
            state: to.to_string(),
            terminal,
        });
    }
    uow.append_events(new_records).await?;

    let jobs: Vec<NewJob> = decision
        .tasks
        .into_iter()
        .map(|task| NewJob {
            task_type: task.task_type,
            variables: variables.clone(),
        })
        .collect();
    uow.enqueue_jobs(jobs).await?;

    if decision.cancel_all_timers {
        uow.cancel_all_timers();
    }
    if !decision.cancel_timers.is_empty() {
        uow.cancel_timers(decision.cancel_timers).await?;
    }

    // Convert timers to JSON for storage
    let json_timers = decision
        .timers
        .into_iter()
        .map(|timer| timer.try_map(serde_json::to_value))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    uow.schedule_timers(json_timers).await?;

    let awaited_after = if terminal {
        None
    } else {
        W::awaited_message(&final_state)
    };
    match awaited_after {
        Some(message_name) => {
            let entry = CorrelationEntry {
                instance: key,
                process_id: W::PROCESS_ID.to_string(),
                message_name: message_name.to_string(),
            };
            uow.bind_correlation(correlation_key.clone(), entry).await?;
        }
        None if awaited_before.is_some() => uow.unbind_correlation(correlation_key.clone()),
        None => {}
    }

    if terminal {
        uow.mark_completed();
    }

    uow.commit().await?;

    if from == to {
        debug!(instance = %instance, state = to, signal = signal.kind(), "Signal applied");
    } else {
        info!(
            instance = %instance,
            correlation_key = %correlation_key,
            from,
            to,
            terminal,
            signal = signal.kind(),
            "Instance transitioned"
        );
    }

    Ok(Outcome::Committed { from, to, terminal })
}

/// Load an instance by replaying its stream (strongly consistent read).
pub(crate) async fn load<W, S>(store: &S, key: InstanceKey) -> Result<ProcessInstance<W::State>>
where
    W: Workflow,
    S: InstanceQueryStore,
{
    let events = store.fetch_instance_events(key).await?;
    if events
        .first()
        .is_some_and(|event| event.process_id != W::PROCESS_ID)
    {
        return Err(Error::InstanceNotFound(key));
    }

    let payloads = events.into_iter().map(|event| event.payload).collect();
    let replayed = replay::<W>(key, payloads)?.ok_or(Error::InstanceNotFound(key))?;

    Ok(ProcessInstance {
        key,
        process_id: W::PROCESS_ID.to_string(),
        correlation_key: replayed.correlation_key,
        terminal: W::is_terminal(&replayed.state),
        state: replayed.state,
        variables: replayed.variables,
        version: replayed.version,
    })
}

/// Replay records to reconstruct state, variables and correlation key.
///
/// Returns `None` for an empty stream.
fn replay<W: Workflow>(key: InstanceKey, records: Vec<Value>) -> Result<Option<Replayed<W::State>>> {
    if records.is_empty() {
        return Ok(None);
    }

    let version = records.len();
    let mut correlation_key = None;
    let mut variables = Variables::new();
    let mut state = W::State::default();

    for (sequence, payload) in records.into_iter().enumerate() {
        let record: InstanceRecord<W::Event> = serde_json::from_value(payload)
            .map_err(|e| Error::event_deserialization(W::PROCESS_ID, key, sequence, e))?;
        match record {
            InstanceRecord::Created {
                correlation_key: created_key,
                variables: initial,
                ..
            } => {
                correlation_key = Some(created_key);
                variables = initial;
            }
            InstanceRecord::VariablesMerged { variables: merged } => variables.merge(merged),
            InstanceRecord::Event { event } => state = W::evolve(state, event),
            InstanceRecord::StateEntered { .. } => {}
        }
    }

    let correlation_key = correlation_key.ok_or(Error::InstanceNotFound(key))?;
    Ok(Some(Replayed {
        correlation_key,
        variables,
        state,
        version,
    }))
}
