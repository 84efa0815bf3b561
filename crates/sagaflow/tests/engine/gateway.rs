//! Gateway contracts: start, correlated messages and eventual listings.

use std::time::Duration;

use sagaflow::subscription::{PROCESS_ID, SubscriptionId, elements, messages, variables};
use sagaflow::{
    CorrelationKey, Error, Eventual, InstanceFilter, InstanceStatus, ProcessEngine, Variables,
};
use test_utils::engine_test;

use crate::support::helpers::TestApp;
use crate::support::use_cases::Call;

fn start_variables(id: SubscriptionId) -> Variables {
    Variables::new().with(variables::SUBSCRIPTION_ID, id.to_string())
}

engine_test!(message_waits_for_instance_to_bind, {
    let app = TestApp::builder()
        .message_ttl(Duration::from_secs(5))
        .build()?;
    let id = SubscriptionId::new_v4();

    let gateway = app.engine.gateway();
    let confirm = tokio::spawn(async move {
        gateway
            .send_message(
                messages::SUBSCRIPTION_CONFIRMED,
                &CorrelationKey::new(id.to_string()),
                Variables::new(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    app.process.submit_form(id).await?;

    confirm.await??;
    app.drain().await?;
    assert!(app.use_cases.calls().contains(&Call::WelcomeMail(id)));

    Ok(())
});

engine_test!(message_without_instance_expires, {
    let app = TestApp::new()?;

    let err = app
        .process
        .confirm(SubscriptionId::new_v4())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoWaitingInstance { .. }));

    Ok(())
});

engine_test!(unknown_message_name_is_not_correlated, {
    let app = TestApp::new()?;
    let (id, key) = app.subscribe().await?;

    let err = app
        .engine
        .gateway
        .send_message(
            "SubscriptionCancelled",
            &CorrelationKey::new(id.to_string()),
            Variables::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::NoWaitingInstance { message_name, .. } if message_name == "SubscriptionCancelled"
    ));
    assert!(!app.instance(key).await?.terminal);

    Ok(())
});

engine_test!(second_confirmation_is_rejected, {
    let app = TestApp::new()?;
    let (id, _) = app.subscribe().await?;

    app.process.confirm(id).await?;
    let err = app.process.confirm(id).await.unwrap_err();

    assert!(matches!(err, Error::NoWaitingInstance { .. }));
    app.drain().await?;
    let welcome_mails = app
        .use_cases
        .calls()
        .into_iter()
        .filter(|call| *call == Call::WelcomeMail(id))
        .count();
    assert_eq!(welcome_mails, 1);

    Ok(())
});

engine_test!(duplicate_subscription_is_rejected, {
    let app = TestApp::new()?;
    let (id, _) = app.subscribe().await?;

    let err = app.process.submit_form(id).await.unwrap_err();

    assert!(matches!(
        err,
        Error::DuplicateCorrelation { correlation_key, .. } if correlation_key.as_str() == id.to_string()
    ));

    app.drain().await?;
    let listing = app
        .engine
        .gateway
        .query_instances(InstanceFilter::new().correlation_key(id.to_string()))
        .await?
        .into_inner();
    assert_eq!(listing.len(), 1);
    assert_eq!(app.use_cases.calls_for(id).len(), 1);

    Ok(())
});

engine_test!(resubscribe_after_abort_starts_fresh_instance, {
    let app = TestApp::new()?;
    let (id, first) = app.subscribe().await?;
    app.advance(Duration::from_secs(150)).await?;

    let second = app.process.submit_form(id).await?;

    assert_ne!(first, second);
    app.process.confirm(id).await?;

    Ok(())
});

engine_test!(start_requires_correlation_variable, {
    let app = TestApp::new()?;

    let err = app
        .engine
        .gateway
        .start_instance(PROCESS_ID, Variables::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingVariable(_)));
    app.drain().await?;
    assert!(
        app.engine
            .gateway
            .query_instances(InstanceFilter::new())
            .await?
            .into_inner()
            .is_empty()
    );

    Ok(())
});

engine_test!(unknown_process_and_start_element_are_invalid, {
    let app = TestApp::new()?;
    let id = SubscriptionId::new_v4();

    let unknown = app
        .engine
        .gateway
        .start_instance("orderFulfillment", start_variables(id))
        .await
        .unwrap_err();
    let element = app
        .engine
        .gateway
        .start_instance_before(PROCESS_ID, "Activity_SendWelcomeMail", start_variables(id))
        .await
        .unwrap_err();

    assert!(matches!(unknown, Error::InvalidDefinition(_)));
    assert!(matches!(element, Error::InvalidDefinition(_)));

    // Neither attempt bound the key.
    app.engine
        .gateway
        .start_instance_before(PROCESS_ID, elements::SEND_CONFIRMATION_MAIL, start_variables(id))
        .await?;

    Ok(())
});

engine_test!(listing_is_eventually_consistent, {
    let app = TestApp::new()?;
    let id = SubscriptionId::new_v4();

    app.process.submit_form(id).await?;
    let before: Eventual<_> = app
        .engine
        .gateway
        .query_instances(InstanceFilter::new().process_id(PROCESS_ID))
        .await?;
    assert!(before.is_empty());

    app.drain().await?;
    let after = app
        .engine
        .gateway
        .query_instances(InstanceFilter::new().process_id(PROCESS_ID))
        .await?
        .into_inner();

    assert_eq!(after.len(), 1);
    assert_eq!(after[0].correlation_key.as_str(), id.to_string());
    assert_eq!(after[0].state, "AwaitingConfirmation");
    assert_eq!(after[0].status(), InstanceStatus::Active);

    Ok(())
});

engine_test!(listing_filters_by_status_with_limit, {
    let app = TestApp::new()?;
    let (confirmed, _) = app.subscribe().await?;
    app.subscribe().await?;
    app.subscribe().await?;

    app.process.confirm(confirmed).await?;
    app.drain().await?;

    let gateway = &app.engine.gateway;
    let completed = gateway
        .query_instances(InstanceFilter::new().status(InstanceStatus::Completed))
        .await?
        .into_inner();
    let active = gateway
        .query_instances(InstanceFilter::new().status(InstanceStatus::Active).limit(1))
        .await?
        .into_inner();

    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].correlation_key.as_str(), confirmed.to_string());
    assert_eq!(active.len(), 1);

    Ok(())
});

engine_test!(closed_engine_rejects_commands, {
    let app = TestApp::new()?;
    let (id, _) = app.subscribe().await?;

    app.engine.gateway.close();

    let start = app.process.submit_form(SubscriptionId::new_v4()).await.unwrap_err();
    let confirm = app.process.confirm(id).await.unwrap_err();
    assert!(matches!(start, Error::EngineUnavailable(_)));
    assert!(matches!(confirm, Error::EngineUnavailable(_)));

    // Queries stay available.
    app.engine
        .gateway
        .query_instances(InstanceFilter::new())
        .await?;

    Ok(())
});
