// tests/provider.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use mom_provider::{
    // ---
    current_context,
    ConnectionProvider,
    ContextGuard,
    DestinationKind,
    LookupContext,
    MessagingError,
    ProviderBuilder,
    TransportError,
};

use common::{broker, builder_for, init_logging, memory_context, provider_for, PASSWORD, USER};

#[tokio::test]
async fn credentials_select_authenticated_path() -> mom_provider::Result<()> {
    // ---
    // Arrange
    // ---
    init_logging();
    let broker = broker("auth", false);
    let provider = builder_for(&broker).credentials(USER, PASSWORD).build()?;

    // ---
    // Act
    // ---
    let connection = provider.provide_connection().await?;

    // ---
    // Assert
    // ---
    assert_eq!(connection.principal(), Some(USER));
    assert!(connection.is_authenticated());
    assert_eq!(provider.registry().len().await, 1);
    assert_eq!(broker.live_connections(), 1);

    connection.close().await?;
    assert!(provider.registry().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn missing_credentials_select_anonymous_path() -> mom_provider::Result<()> {
    // ---
    init_logging();
    let broker = broker("anon", true);
    let provider = provider_for(&broker);

    let connection = provider.provide_connection().await?;

    assert_eq!(connection.principal(), None);
    provider.close_all().await;
    Ok(())
}

#[tokio::test]
async fn half_credential_pair_connects_anonymously() {
    // ---
    init_logging();
    let broker = broker("half", false);
    let provider = builder_for(&broker)
        .username(USER)
        .build()
        .expect("half pair is a valid configuration");

    // The broker refuses anonymous clients, so taking the anonymous path
    // shows up as an authentication failure.
    let err = provider
        .provide_connection()
        .await
        .expect_err("anonymous access is disabled");

    assert_eq!(err.to_string(), "could not create messaging connection");
    assert!(matches!(
        err.transport_error(),
        Some(TransportError::Authentication(reason)) if reason == "anonymous access"
    ));
    assert!(provider.registry().is_empty().await);
}

#[tokio::test]
async fn wrong_password_is_distinguishable_from_network_failure() {
    // ---
    init_logging();
    let broker = broker("wrong", false);

    let bad_password = builder_for(&broker)
        .credentials(USER, "nope")
        .build()
        .expect("provider");
    let err = bad_password.provide_connection().await.expect_err("bad password");
    assert!(matches!(
        err.transport_error(),
        Some(TransportError::Authentication(_))
    ));

    broker.set_reachable(false);
    let good = builder_for(&broker)
        .credentials(USER, PASSWORD)
        .build()
        .expect("provider");
    let err = good.provide_connection().await.expect_err("broker is down");
    assert!(matches!(err, MessagingError::ConnectionCreation { .. }));
    assert!(matches!(err.transport_error(), Some(TransportError::Network(_))));
}

#[tokio::test]
async fn ambient_context_is_restored_after_success() -> mom_provider::Result<()> {
    // ---
    init_logging();
    let broker = broker("ctx-ok", true);
    let provider = provider_for(&broker);
    let framework = LookupContext::empty("framework");
    let _guard = ContextGuard::enter(framework.clone());

    provider.provide_connection().await?;

    assert_eq!(current_context(), Some(framework));
    provider.close_all().await;
    Ok(())
}

#[tokio::test]
async fn ambient_context_is_restored_after_failure() {
    // ---
    init_logging();
    let framework = LookupContext::empty("framework");
    let _guard = ContextGuard::enter(framework.clone());

    let provider = ProviderBuilder::new()
        .host_address("memory://nowhere")
        .context(LookupContext::empty("provider"))
        .build()
        .expect("provider");

    let err = provider.provide_connection().await.expect_err("no driver");

    assert_eq!(
        err.transport_error(),
        Some(&TransportError::DriverNotFound("memory".into()))
    );
    assert_eq!(current_context(), Some(framework));
}

#[tokio::test]
async fn discovery_ignores_the_ambient_context() -> mom_provider::Result<()> {
    // ---
    // Arrange: the caller's context can resolve a different broker under the
    // same scheme; the provider must still use its own.
    // ---
    init_logging();
    let mine = broker("mine", true);
    let theirs = broker("theirs", true);

    let _guard = ContextGuard::enter(memory_context("framework", &theirs));
    let provider = ProviderBuilder::new()
        .host_address(mine.address())
        .context(memory_context("provider", &mine))
        .build()?;

    // ---
    // Act
    // ---
    provider.provide_connection().await?;

    // ---
    // Assert
    // ---
    assert_eq!(mine.live_connections(), 1);
    assert_eq!(theirs.live_connections(), 0);

    // Without a driver of its own the provider fails, even though the
    // ambient context could have served the scheme.
    let isolated = ProviderBuilder::new()
        .host_address(theirs.address())
        .context(LookupContext::empty("provider"))
        .build()?;
    assert!(isolated.provide_connection().await.is_err());

    provider.close_all().await;
    Ok(())
}

#[test]
fn description_reflects_host() {
    // ---
    let broker = broker("desc", true);

    let provider = builder_for(&broker).label("Billing").build().expect("provider");
    assert_eq!(
        provider.description(),
        "Billing Messaging connected to memory://desc"
    );

    let hostless = ProviderBuilder::new()
        .context(memory_context("provider", &broker))
        .build()
        .expect("provider");
    assert_eq!(hostless.description(), "Broker Messaging");
}

#[tokio::test]
async fn destination_lookup_is_idempotent() -> mom_provider::Result<()> {
    // ---
    init_logging();
    let broker = broker("dest", true);
    let provider = provider_for(&broker);
    let connection = provider.provide_connection().await?;
    let session = connection.create_session().await?;
    let other = connection.create_session().await?;

    let first = provider.get_queue(&session, "orders")?;
    let second = provider.get_queue(&session, "orders")?;
    let elsewhere = provider.get_queue(&other, "orders")?;
    let topic = provider.get_topic(&session, "orders")?;

    assert_eq!(first, second);
    assert_ne!(first, elsewhere);
    assert!(first.denotes(&elsewhere));
    assert!(!first.denotes(&topic));

    // Both handles reach the same broker queue.
    let consumer = other.create_consumer(&elsewhere).await?;
    let producer = session.create_producer(&first).await?;
    producer.send(Bytes::from_static(b"ping")).await?;
    let got = consumer.receive(Duration::from_millis(200)).await?;
    assert_eq!(got.map(|m| m.payload), Some(Bytes::from_static(b"ping")));

    provider.close_all().await;
    Ok(())
}

#[tokio::test]
async fn invalid_or_closed_lookups_fail_with_kind_and_name() -> mom_provider::Result<()> {
    // ---
    init_logging();
    let broker = broker("bad-dest", true);
    let provider = provider_for(&broker);
    let connection = provider.provide_connection().await?;
    let session = connection.create_session().await?;

    let err = provider.get_topic(&session, "").expect_err("empty name");
    assert!(matches!(
        err,
        MessagingError::DestinationResolution {
            kind: DestinationKind::Topic,
            ..
        }
    ));

    session.close().await?;
    let err = provider.get_queue(&session, "orders").expect_err("closed session");
    assert_eq!(err.to_string(), "could not access queue orders");
    assert_eq!(err.transport_error(), Some(&TransportError::SessionClosed));

    provider.close_all().await;
    Ok(())
}

#[tokio::test]
async fn transport_faults_reach_observers() -> mom_provider::Result<()> {
    // ---
    init_logging();
    let broker = broker("faults", true);
    let provider = provider_for(&broker);
    let mut faults = provider.faults();

    let connection = provider.provide_connection().await?;
    let notified = broker.inject_fault(TransportError::ConnectionLost("reset by peer".into()));

    assert_eq!(notified, 1);
    let fault = tokio::time::timeout(Duration::from_millis(200), faults.recv())
        .await
        .expect("timed out waiting for fault")
        .expect("fault channel closed");
    assert_eq!(fault.connection, connection.id());
    assert_eq!(
        fault.error,
        TransportError::ConnectionLost("reset by peer".into())
    );

    provider.close_all().await;
    Ok(())
}

#[tokio::test]
async fn close_all_survives_individual_failures() -> mom_provider::Result<()> {
    // ---
    // Arrange
    // ---
    init_logging();
    let broker = broker("bulk", true);
    let provider = Arc::new(provider_for(&broker));

    let mut connections = Vec::new();
    for _ in 0..10 {
        connections.push(provider.provide_connection().await?);
    }
    assert_eq!(broker.live_connections(), 10);

    // Close three through their handles, which deregisters them, then put
    // them back as stale entries so their bulk close fails.
    for connection in connections.iter().take(3) {
        connection.close().await?;
        provider.registry().add(connection.clone()).await;
    }

    // ---
    // Act
    // ---
    let report = provider.close_all().await;

    // ---
    // Assert
    // ---
    assert_eq!(report.attempted(), 10);
    assert_eq!(report.closed, 7);
    assert_eq!(report.failures.len(), 3);
    assert!(report
        .failures
        .iter()
        .all(|(_, err)| err.transport_error() == Some(&TransportError::ConnectionClosed)));
    assert!(provider.registry().is_empty().await);
    assert_eq!(broker.live_connections(), 0);
    Ok(())
}
