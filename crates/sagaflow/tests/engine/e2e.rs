//! End-to-end subscription scenarios.
//!
//! Time is driven by the manual clock with the default escalation policy:
//! reminder after 60 s, two confirmation mails, abort after 150 s.

use std::time::Duration;

use sagaflow::subscription::{PROCESS_ID, Phase, SubscriptionId, elements, variables};
use sagaflow::{Error, InstanceFilter, InstanceStatus, ProcessEngine, Variables};
use test_utils::engine_test;

use crate::support::helpers::{TestApp, event_types};
use crate::support::use_cases::Call;

const REMINDER: Duration = Duration::from_secs(60);

engine_test!(confirmed_subscription_gets_welcome_mail, {
    let app = TestApp::new()?;

    let (id, key) = app.subscribe().await?;
    assert_eq!(app.use_cases.calls(), vec![Call::ConfirmationMail(id)]);

    app.process.confirm(id).await?;
    app.drain().await?;

    assert_eq!(
        app.use_cases.calls(),
        vec![Call::ConfirmationMail(id), Call::WelcomeMail(id)]
    );

    let instance = app.instance(key).await?;
    assert!(instance.terminal);
    assert_eq!(instance.state.phase, Phase::Confirmed { welcome_sent: true });
    assert!(instance.state.welcome_mail_sent);
    assert_eq!(
        instance.variables.get(variables::WELCOME_MAIL_SENT),
        Some(&serde_json::json!(true))
    );
    assert!(app.pending_timers(key).await?.is_empty());

    // No reminder and no abort once confirmed.
    app.advance(Duration::from_secs(200)).await?;
    assert_eq!(app.use_cases.calls().len(), 2);

    let listing = app
        .engine
        .gateway
        .query_instances(InstanceFilter::new().correlation_key(id.to_string()))
        .await?
        .into_inner();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].status(), InstanceStatus::Completed);
    assert_eq!(listing[0].state, "Confirmed");

    Ok(())
});

engine_test!(unconfirmed_subscription_is_reminded_then_aborted, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;

    app.advance(REMINDER).await?;
    assert_eq!(
        app.use_cases.calls(),
        vec![Call::ConfirmationMail(id), Call::ConfirmationMail(id)]
    );

    // Mail count reached: nothing at 120 s.
    app.advance(REMINDER).await?;
    assert_eq!(app.use_cases.calls().len(), 2);
    assert!(!app.instance(key).await?.terminal);

    app.advance(Duration::from_secs(30)).await?;
    assert_eq!(
        app.use_cases.calls(),
        vec![
            Call::ConfirmationMail(id),
            Call::ConfirmationMail(id),
            Call::Abort(id)
        ]
    );

    let instance = app.instance(key).await?;
    assert!(instance.terminal);
    assert_eq!(instance.state.phase, Phase::Aborted { cleaned_up: true });
    assert_eq!(instance.state.confirmation_mails_delivered, 2);

    assert_eq!(
        event_types(&app.store, key).await?,
        vec![
            "started",
            "awaiting_confirmation",
            "confirmation_mail_requested",
            "confirmation_mail_delivered",
            "reminder_fired",
            "confirmation_mail_requested",
            "confirmation_mail_delivered",
            "timed_out",
            "registration_aborted",
        ]
    );

    Ok(())
});

engine_test!(confirmation_after_abort_is_rejected, {
    let app = TestApp::new()?;
    let (id, _) = app.subscribe().await?;
    app.advance(Duration::from_secs(150)).await?;

    let err = app.process.confirm(id).await.unwrap_err();

    assert!(matches!(err, Error::NoWaitingInstance { .. }));
    assert!(!app.use_cases.calls().contains(&Call::WelcomeMail(id)));

    Ok(())
});

engine_test!(confirmation_after_reminder_cancels_abort, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;
    app.advance(REMINDER).await?;

    app.process.confirm(id).await?;
    app.drain().await?;
    app.advance(Duration::from_secs(120)).await?;

    assert_eq!(
        app.use_cases.calls(),
        vec![
            Call::ConfirmationMail(id),
            Call::ConfirmationMail(id),
            Call::WelcomeMail(id)
        ]
    );
    assert!(app.instance(key).await?.terminal);

    Ok(())
});

engine_test!(confirmation_committed_before_due_timeout_wins, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;

    // The final timeout is due but not yet delivered by a worker.
    app.clock.advance(Duration::from_secs(150));
    app.process.confirm(id).await?;
    app.drain().await?;

    assert!(!app.use_cases.calls().contains(&Call::Abort(id)));
    let instance = app.instance(key).await?;
    assert_eq!(instance.state.phase, Phase::Confirmed { welcome_sent: true });

    Ok(())
});

engine_test!(confirmation_before_first_mail_is_sent, {
    let app = TestApp::new()?;
    let id = SubscriptionId::new_v4();

    let key = app.process.submit_form(id).await?;
    app.process.confirm(id).await?;
    app.drain().await?;

    // The activation created at start still runs and is recorded.
    assert_eq!(
        app.use_cases.calls(),
        vec![Call::ConfirmationMail(id), Call::WelcomeMail(id)]
    );
    let instance = app.instance(key).await?;
    assert!(instance.terminal);
    assert_eq!(instance.state.confirmation_mails_delivered, 1);

    Ok(())
});

engine_test!(start_before_confirmation_skips_first_mail, {
    let app = TestApp::new()?;
    let id = SubscriptionId::new_v4();

    let key = app
        .engine
        .gateway
        .start_instance_before(
            PROCESS_ID,
            elements::CONFIRM_REGISTRATION,
            Variables::new().with(variables::SUBSCRIPTION_ID, id.to_string()),
        )
        .await?
        .into_inner();
    app.drain().await?;
    assert!(app.use_cases.calls().is_empty());

    app.advance(REMINDER).await?;
    assert_eq!(app.use_cases.calls(), vec![Call::ConfirmationMail(id)]);

    app.advance(REMINDER).await?;
    app.advance(Duration::from_secs(30)).await?;
    assert_eq!(
        app.use_cases.calls(),
        vec![
            Call::ConfirmationMail(id),
            Call::ConfirmationMail(id),
            Call::Abort(id)
        ]
    );
    assert!(app.instance(key).await?.terminal);

    Ok(())
});

engine_test!(subscriptions_progress_independently, {
    let app = TestApp::new()?;
    let (confirmed, confirmed_key) = app.subscribe().await?;
    app.advance(Duration::from_secs(30)).await?;
    let (late, late_key) = app.subscribe().await?;

    app.process.confirm(confirmed).await?;
    // 150 s after the first start, 120 s after the second.
    app.advance(Duration::from_secs(120)).await?;

    assert!(app.instance(confirmed_key).await?.terminal);
    assert_eq!(
        app.use_cases.calls_for(late),
        vec![Call::ConfirmationMail(late), Call::ConfirmationMail(late)]
    );
    assert!(!app.instance(late_key).await?.terminal);

    app.advance(Duration::from_secs(30)).await?;
    assert!(app.use_cases.calls_for(late).contains(&Call::Abort(late)));

    let active = app
        .engine
        .gateway
        .query_instances(InstanceFilter::new().status(InstanceStatus::Active))
        .await?
        .into_inner();
    assert!(active.is_empty());

    Ok(())
});
