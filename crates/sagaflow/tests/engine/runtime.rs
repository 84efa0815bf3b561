//! Integration tests for the job and timer runtime.

use std::time::Duration;

use sagaflow::job::RetryPolicy;
use sagaflow::store::IncidentQuery;
use sagaflow::subscription::workers::ConfirmationMailWorker;
use sagaflow::subscription::{
    EscalationPolicy, SubscriptionId, SubscriptionWorkflow, task_types,
};
use sagaflow::{Engine, Error, MemoryStore};
use test_utils::{engine_test, wait_until};

use crate::support::helpers::{
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT, TEST_MAX_ATTEMPTS, TestApp,
};
use crate::support::use_cases::{Call, RecordingUseCases};

engine_test!(failed_welcome_mail_is_retried_after_backoff, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;
    app.use_cases.fail_welcome_mails(1);

    app.process.confirm(id).await?;
    app.drain().await?;

    // First attempt failed; the retry waits for the backoff on the store clock.
    assert!(!app.use_cases.calls().contains(&Call::WelcomeMail(id)));
    assert!(!app.instance(key).await?.terminal);

    app.advance(Duration::from_secs(1)).await?;

    assert!(app.use_cases.calls().contains(&Call::WelcomeMail(id)));
    assert!(app.instance(key).await?.terminal);
    assert!(app.engine.incidents(IncidentQuery::new()).await?.is_empty());

    Ok(())
});

engine_test!(exhausted_retries_raise_incident_until_resolved, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;
    app.use_cases.fail_welcome_mails(u32::MAX);

    app.process.confirm(id).await?;
    app.drain().await?;
    app.advance(Duration::from_secs(1)).await?;
    app.advance(Duration::from_secs(2)).await?;

    let incidents = app
        .engine
        .incidents(IncidentQuery::new().task_type(task_types::SEND_WELCOME_MAIL))
        .await?;
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.instance.key(), key);
    assert_eq!(incident.attempts, TEST_MAX_ATTEMPTS);
    assert!(incident.error.contains("mail server unavailable"));

    // Parked: no further deliveries while the incident is open.
    app.advance(Duration::from_secs(60)).await?;
    assert!(!app.instance(key).await?.terminal);

    app.use_cases.fail_welcome_mails(0);
    assert!(app.engine.resolve_incident(incident.job_key).await?);
    app.drain().await?;

    assert!(app.use_cases.calls().contains(&Call::WelcomeMail(id)));
    assert!(app.instance(key).await?.terminal);
    assert!(app.engine.incidents(IncidentQuery::new()).await?.is_empty());
    assert!(!app.engine.resolve_incident(incident.job_key).await?);

    Ok(())
});

engine_test!(spawned_workers_drive_subscription, {
    let app = TestApp::new()?;
    let running = app.spawn();
    let id = SubscriptionId::new_v4();

    app.process.submit_form(id).await?;
    wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
        Ok(app
            .use_cases
            .calls()
            .contains(&Call::ConfirmationMail(id))
            .then_some(()))
    })
    .await?;

    app.process.confirm(id).await?;
    wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
        Ok(app
            .use_cases
            .calls()
            .contains(&Call::WelcomeMail(id))
            .then_some(()))
    })
    .await?;

    tokio::time::timeout(Duration::from_secs(3), running.shutdown())
        .await
        .map_err(|_| anyhow::anyhow!("shutdown should complete within timeout"))??;

    // Shutdown closes the gateway.
    let err = app
        .process
        .submit_form(SubscriptionId::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EngineUnavailable(_)));

    Ok(())
});

engine_test!(spawned_timer_worker_fires_due_reminder, {
    let app = TestApp::new()?;
    let (id, _) = app.subscribe().await?;
    let _running = app.spawn();

    app.clock.advance(Duration::from_secs(60));

    wait_until(DEFAULT_TEST_TIMEOUT, DEFAULT_POLL_INTERVAL, || async {
        Ok((app.use_cases.calls_for(id).len() == 2).then_some(()))
    })
    .await?;

    Ok(())
});

engine_test!(custom_escalation_policy_applies, {
    let app = TestApp::builder()
        .policy(EscalationPolicy {
            reminder_interval: Duration::from_secs(10),
            confirmation_mails: 3,
            final_timeout: Duration::from_secs(45),
        })
        .build()?;
    let (id, key) = app.subscribe().await?;

    for _ in 0..3 {
        app.advance(Duration::from_secs(10)).await?;
    }
    assert_eq!(app.use_cases.calls_for(id).len(), 3);

    app.advance(Duration::from_secs(15)).await?;
    assert_eq!(app.use_cases.calls_for(id).last(), Some(&Call::Abort(id)));
    assert!(app.instance(key).await?.terminal);

    Ok(())
});

#[test]
fn invalid_escalation_policy_is_rejected() {
    let policy = EscalationPolicy {
        reminder_interval: Duration::from_secs(60),
        confirmation_mails: 3,
        final_timeout: Duration::from_secs(100),
    };

    assert!(matches!(
        SubscriptionWorkflow::new(policy),
        Err(Error::InvalidPolicy(_))
    ));
}

#[test]
fn unbounded_final_timeout_is_rejected() {
    let result = TestApp::builder()
        .policy(EscalationPolicy {
            reminder_interval: Duration::from_secs(60),
            confirmation_mails: 1,
            final_timeout: Duration::from_secs(u64::MAX / 4),
        })
        .build();

    let err = result.err().expect("policy should be rejected");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidPolicy(_))
    ));
}

#[test]
fn duplicate_registrations_fail_build() {
    let use_cases = std::sync::Arc::new(RecordingUseCases::default());

    let handler = Engine::builder(MemoryStore::new())
        .register_handler(
            task_types::SEND_CONFIRMATION_MAIL,
            ConfirmationMailWorker::new(use_cases.clone()),
        )
        .register_handler(
            task_types::SEND_CONFIRMATION_MAIL,
            ConfirmationMailWorker::new(use_cases),
        )
        .build();
    let process = Engine::builder(MemoryStore::new())
        .register_process(SubscriptionWorkflow::default())
        .register_process(SubscriptionWorkflow::default())
        .build();

    assert!(matches!(
        handler.err(),
        Some(Error::DuplicateTaskType(t)) if t == task_types::SEND_CONFIRMATION_MAIL
    ));
    assert!(matches!(
        process.err(),
        Some(Error::DuplicateProcessDefinition(p)) if p == "newsletterSubscription"
    ));
}

#[test]
fn invalid_retry_policy_fails_build() {
    let result = Engine::builder(MemoryStore::new())
        .register_handler_with_retry(
            task_types::SEND_CONFIRMATION_MAIL,
            ConfirmationMailWorker::new(std::sync::Arc::new(RecordingUseCases::default())),
            RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
        )
        .build();

    assert!(matches!(result.err(), Some(Error::InvalidPolicy(_))));
}
