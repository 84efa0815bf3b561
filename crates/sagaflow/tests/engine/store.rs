//! What a subscription leaves behind in the store.

use std::time::Duration;

use sagaflow::store::{EventStore, InstanceQueryStore, Store};
use sagaflow::subscription::{PROCESS_ID, task_types, variables};
use sagaflow::{CorrelationKey, InstanceKey, MemoryStore};
use test_utils::engine_test;
use time::OffsetDateTime;

use crate::support::helpers::TestApp;

async fn record_kinds(store: &MemoryStore, key: InstanceKey) -> anyhow::Result<Vec<String>> {
    Ok(store
        .fetch_instance_events(key)
        .await?
        .into_iter()
        .map(|record| record.payload["kind"].as_str().unwrap_or_default().to_string())
        .collect())
}

engine_test!(start_commits_stream_timers_binding_and_activation, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;

    let records = app.store.fetch_instance_events(key).await?;
    let created = &records[0].payload;
    assert_eq!(created["kind"], "created");
    assert_eq!(created["process_id"], PROCESS_ID);
    assert_eq!(created["correlation_key"], id.to_string());
    assert_eq!(records[0].process_id, PROCESS_ID);
    assert!(records.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));

    let timers = app.pending_timers(key).await?;
    let base = OffsetDateTime::UNIX_EPOCH;
    let schedule: Vec<_> = timers
        .iter()
        .map(|t| (t.key.as_deref(), t.fire_at - base))
        .collect();
    assert_eq!(
        schedule,
        vec![
            (Some("reminder"), time::Duration::seconds(60)),
            (Some("final-timeout"), time::Duration::seconds(150)),
        ]
    );

    let binding = app
        .store
        .correlations()
        .resolve(&CorrelationKey::new(id.to_string()))
        .expect("instance should be bound");
    assert_eq!(binding.instance, key);
    assert_eq!(binding.message_name, "SubscriptionConfirmed");

    let activations = app.store.activations(key);
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].task_type, task_types::SEND_CONFIRMATION_MAIL);
    assert_eq!(
        activations[0].variables.get_str(variables::SUBSCRIPTION_ID),
        Some(id.to_string().as_str())
    );
    assert_eq!(app.store.open_job_count(), 0);

    Ok(())
});

engine_test!(completion_releases_binding_and_timers, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;

    app.process.confirm(id).await?;
    assert!(
        app.store
            .correlations()
            .resolve(&CorrelationKey::new(id.to_string()))
            .is_none()
    );
    assert!(app.pending_timers(key).await?.is_empty());

    app.drain().await?;
    assert!(app.store.is_completed(key).await?);
    assert_eq!(app.store.open_job_count(), 0);
    assert!(app.store.correlations().is_empty());

    // Completed instances take no further records.
    let recorded = app.store.fetch_instance_events(key).await?.len();
    app.advance(Duration::from_secs(300)).await?;
    assert_eq!(app.store.fetch_instance_events(key).await?.len(), recorded);

    Ok(())
});

engine_test!(replay_matches_recorded_history, {
    let app = TestApp::new()?;
    let (_, key) = app.subscribe().await?;
    app.advance(Duration::from_secs(60)).await?;

    let instance = app.instance(key).await?;

    assert_eq!(instance.process_id, PROCESS_ID);
    assert_eq!(instance.state.confirmation_mails_requested, 2);
    assert_eq!(instance.state.reminders_fired, 1);
    assert_eq!(
        instance.version,
        app.store.fetch_instance_events(key).await?.len()
    );
    assert_eq!(
        record_kinds(&app.store, key).await?.first().map(String::as_str),
        Some("created")
    );

    Ok(())
});

engine_test!(global_sequence_orders_all_instances, {
    let app = TestApp::new()?;
    app.subscribe().await?;
    app.subscribe().await?;

    let all = app.store.fetch_events_since(0, 1000).await?;
    assert!(all.windows(2).all(|w| w[0].global_sequence < w[1].global_sequence));

    let tail = app.store.fetch_events_since(all[2].global_sequence, 2).await?;
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].global_sequence, all[3].global_sequence);

    Ok(())
});
