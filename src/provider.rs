//! Connection provider.
//!
//! A provider turns one [`BrokerConfig`] into live, registered, fault-watched
//! connections. Transport discovery always runs under the provider's own
//! [`LookupContext`], never the caller's.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    lookup,
    BrokerConfig,
    CloseAllReport,
    Connection,
    ConnectionFactory,
    ConnectionFault,
    ConnectionId,
    ConnectionRegistry,
    ContextGuard,
    Destination,
    DestinationKind,
    FaultListener,
    LookupContext,
    MessagingError,
    Result,
    Session,
    TransportError,
    TransportResult,
};

/// Capability set the harness and applications consume.
///
/// `BrokerProvider` is the implementation backed by a transport driver;
/// tests may wrap it to inject failures.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Create, authenticate and register a new connection.
    async fn provide_connection(&self) -> Result<Connection>;

    /// Resolve a queue within `session`. Idempotent per name.
    fn get_queue(&self, session: &Session, name: &str) -> Result<Destination>;

    /// Resolve a topic within `session`. Idempotent per name.
    fn get_topic(&self, session: &Session, name: &str) -> Result<Destination>;

    /// Human-readable identity, e.g. `"Broker Messaging connected to memory://a"`.
    fn description(&self) -> String;

    /// Subscribe to asynchronous faults of this provider's connections.
    fn faults(&self) -> broadcast::Receiver<ConnectionFault>;

    /// Close every connection this provider created and still tracks.
    async fn close_all(&self) -> CloseAllReport;
}

/// Shared trait object used by the harness.
pub type ProviderPtr = Arc<dyn ConnectionProvider>;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Connection provider for one broker configuration.
///
/// Construct it with [`ProviderBuilder`](crate::ProviderBuilder).
pub struct BrokerProvider {
    // ---
    label: String,
    config: Arc<BrokerConfig>,
    context: LookupContext,
    factory: Mutex<Option<Arc<dyn ConnectionFactory>>>,
    registry: Arc<ConnectionRegistry>,
    faults: broadcast::Sender<ConnectionFault>,
}

impl BrokerProvider {
    pub(crate) fn new(
        label: String,
        config: BrokerConfig,
        context: LookupContext,
        fault_capacity: usize,
    ) -> Self {
        // ---
        let (faults, _) = broadcast::channel(fault_capacity);

        Self {
            label,
            config: Arc::new(config),
            context,
            factory: Mutex::new(None),
            registry: Arc::new(ConnectionRegistry::new()),
            faults,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The lookup context transport discovery runs under.
    pub fn context(&self) -> &LookupContext {
        &self.context
    }

    /// Live connections created by this provider.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Return the cached factory or build it under the provider's context.
    ///
    /// The guard is dropped before this returns, so no `.await` ever runs
    /// with the provider context installed.
    fn connection_factory(&self) -> TransportResult<Arc<dyn ConnectionFactory>> {
        // ---
        let mut cached = lock_ignore_poison(&self.factory);
        if let Some(factory) = cached.as_ref() {
            return Ok(Arc::clone(factory));
        }

        let _guard = ContextGuard::enter(self.context.clone());

        let scheme = self
            .config
            .scheme()
            .ok_or_else(|| TransportError::FactoryInit("no host address configured".into()))?;

        let driver = lookup::current()
            .and_then(|context| context.driver(scheme))
            .ok_or_else(|| TransportError::DriverNotFound(scheme.to_string()))?;

        let factory = driver.create_factory(&self.config)?;
        log_debug!("{}: built connection factory for {scheme}", self.label);

        *cached = Some(Arc::clone(&factory));
        Ok(factory)
    }

    async fn connect(&self) -> TransportResult<Connection> {
        // ---
        let factory = self.connection_factory()?;

        let transport = match self.config.credentials() {
            Some(credentials) => {
                log_debug!("{}: connecting as {}", self.label, credentials.username);
                factory.create_connection_with(&credentials).await?
            }
            None => {
                log_debug!("{}: connecting anonymously", self.label);
                factory.create_connection().await?
            }
        };

        let id = ConnectionId::next();
        transport.set_exception_listener(Arc::new(FaultListener::new(id, self.faults.clone())));

        let connection = Connection::new(
            id,
            Arc::clone(&self.config),
            transport,
            Arc::downgrade(&self.registry),
        );
        self.registry.add(connection.clone()).await;

        Ok(connection)
    }

    /// Log the lookup contexts involved in a failed discovery.
    fn log_discovery_failure(&self, error: &TransportError) {
        // ---
        if !matches!(
            error,
            TransportError::DriverNotFound(_) | TransportError::FactoryInit(_)
        ) {
            return;
        }

        let ambient = lookup::current();
        log_error!(
            "{}: transport discovery failed: {error}; provider context {} resolves {:?}; \
             ambient context {} resolves {:?}",
            self.label,
            self.context,
            self.context.schemes(),
            ambient
                .as_ref()
                .map_or_else(|| "<none>".to_string(), ToString::to_string),
            ambient.as_ref().map(LookupContext::schemes).unwrap_or_default()
        );
    }

    fn resolve(&self, session: &Session, kind: DestinationKind, name: &str) -> Result<Destination> {
        // ---
        session
            .resolve(kind, name)
            .map_err(|source| MessagingError::DestinationResolution {
                kind,
                name: name.to_string(),
                source,
            })
    }
}

#[async_trait]
impl ConnectionProvider for BrokerProvider {
    async fn provide_connection(&self) -> Result<Connection> {
        // ---
        match self.connect().await {
            Ok(connection) => {
                log_info!(
                    "{}: {} established ({})",
                    self.label,
                    connection.id(),
                    connection.principal().unwrap_or("anonymous")
                );
                Ok(connection)
            }
            Err(source) => {
                self.log_discovery_failure(&source);
                log_error!("{}: connection failed: {source}", self.label);
                Err(MessagingError::ConnectionCreation { source })
            }
        }
    }

    fn get_queue(&self, session: &Session, name: &str) -> Result<Destination> {
        self.resolve(session, DestinationKind::Queue, name)
    }

    fn get_topic(&self, session: &Session, name: &str) -> Result<Destination> {
        self.resolve(session, DestinationKind::Topic, name)
    }

    fn description(&self) -> String {
        // ---
        match self.config.host() {
            Some(host) => format!("{} Messaging connected to {host}", self.label),
            None => format!("{} Messaging", self.label),
        }
    }

    fn faults(&self) -> broadcast::Receiver<ConnectionFault> {
        self.faults.subscribe()
    }

    async fn close_all(&self) -> CloseAllReport {
        // ---
        let report = self.registry.close_all().await;
        log_info!(
            "{}: closed {} of {} connection(s)",
            self.label,
            report.closed,
            report.attempted()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{current_context, MemoryBroker, MemoryDriver, ProviderBuilder, TransportDriver};

    fn memory_context(broker: &Arc<MemoryBroker>) -> LookupContext {
        let driver: Arc<dyn TransportDriver> = MemoryDriver::new([Arc::clone(broker)]);
        LookupContext::new("provider", [driver])
    }

    #[test]
    fn description_with_and_without_host() {
        // ---
        let broker = MemoryBroker::new("desc");
        let with_host = ProviderBuilder::new()
            .host_address("memory://desc")
            .context(memory_context(&broker))
            .build()
            .expect("provider");
        let without_host = ProviderBuilder::new()
            .label("Orders")
            .host_address("  ")
            .context(memory_context(&broker))
            .build()
            .expect("provider");

        assert_eq!(
            with_host.description(),
            "Broker Messaging connected to memory://desc"
        );
        assert_eq!(without_host.description(), "Orders Messaging");
    }

    #[tokio::test]
    async fn factory_is_built_once() {
        // ---
        let broker = MemoryBroker::new("once");
        let provider = ProviderBuilder::new()
            .host_address(broker.address())
            .context(memory_context(&broker))
            .build()
            .expect("provider");

        let first = provider.connection_factory().expect("factory");
        let second = provider.connection_factory().expect("factory");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_connection_failure() {
        // ---
        let broker = MemoryBroker::new("scheme");
        let provider = ProviderBuilder::new()
            .host_address("tcp://broker:61616")
            .context(memory_context(&broker))
            .build()
            .expect("provider");

        let err = provider.provide_connection().await.expect_err("must fail");

        assert!(matches!(err, MessagingError::ConnectionCreation { .. }));
        assert_eq!(
            err.transport_error(),
            Some(&TransportError::DriverNotFound("tcp".into()))
        );
        assert!(current_context().is_none());
    }

    #[tokio::test]
    async fn missing_host_fails_factory_init() {
        // ---
        let broker = MemoryBroker::new("nohost");
        let provider = ProviderBuilder::new()
            .context(memory_context(&broker))
            .build()
            .expect("provider");

        let err = provider.provide_connection().await.expect_err("must fail");
        assert!(matches!(
            err.transport_error(),
            Some(TransportError::FactoryInit(_))
        ));
    }
}
