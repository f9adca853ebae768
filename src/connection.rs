//! Connection, session, producer and consumer handles.
//!
//! These wrap the transport SPI objects and translate transport failures
//! into [`MessagingError`]s carrying the connection, session or destination
//! they concern.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::{
    // ---
    log_debug,
    BrokerConfig,
    ConnectionId,
    ConnectionRegistry,
    Destination,
    DestinationKind,
    Message,
    MessagingError,
    Result,
    SessionId,
    TransportConnection,
    TransportConsumer,
    TransportProducer,
    TransportResult,
    TransportSession,
};

/// A live broker connection created by a provider.
///
/// Cheap to clone; clones refer to the same transport connection. The
/// provider's registry keeps a clone until the connection is closed.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    config: Arc<BrokerConfig>,
    transport: Box<dyn TransportConnection>,
    registry: Weak<ConnectionRegistry>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        config: Arc<BrokerConfig>,
        transport: Box<dyn TransportConnection>,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        // ---
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                config,
                transport,
                registry,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Configuration the connection was created from.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// User the connection authenticated as; `None` when anonymous.
    pub fn principal(&self) -> Option<&str> {
        self.inner.transport.principal()
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal().is_some()
    }

    /// Open a new session on this connection.
    pub async fn create_session(&self) -> Result<Session> {
        // ---
        let transport = self
            .inner
            .transport
            .create_session()
            .await
            .map_err(|source| MessagingError::SessionCreation {
                connection: self.inner.id,
                source,
            })?;

        log_debug!("{}: opened {}", self.inner.id, transport.id());

        Ok(Session {
            id: transport.id(),
            connection: self.inner.id,
            transport,
        })
    }

    /// Close the connection and drop it from the provider's registry.
    ///
    /// The registry entry is removed even when the transport close fails.
    pub async fn close(&self) -> Result<()> {
        // ---
        let result = self.shutdown().await;

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.inner.id).await;
        }

        result
    }

    /// Close the transport connection without touching the registry.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing", self.inner.id);

        self.inner
            .transport
            .close()
            .await
            .map_err(|source| MessagingError::ConnectionClose {
                connection: self.inner.id,
                source,
            })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("host", &self.inner.config.host())
            .field("principal", &self.principal())
            .finish()
    }
}

/// A session opened on a [`Connection`].
///
/// Destinations are resolved through the provider
/// ([`ConnectionProvider::get_queue`](crate::ConnectionProvider::get_queue));
/// producers and consumers are attached here.
pub struct Session {
    // ---
    id: SessionId,
    connection: ConnectionId,
    transport: Box<dyn TransportSession>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The connection this session belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Resolve a destination at the transport level.
    pub(crate) fn resolve(
        &self,
        kind: DestinationKind,
        name: &str,
    ) -> TransportResult<Destination> {
        // ---
        match kind {
            DestinationKind::Queue => self.transport.create_queue(name),
            DestinationKind::Topic => self.transport.create_topic(name),
        }
    }

    pub async fn create_producer(&self, destination: &Destination) -> Result<Producer> {
        // ---
        let transport = self
            .transport
            .create_producer(destination)
            .await
            .map_err(|source| attach_error(destination, source))?;

        Ok(Producer { transport })
    }

    pub async fn create_consumer(&self, destination: &Destination) -> Result<Consumer> {
        // ---
        let transport = self
            .transport
            .create_consumer(destination)
            .await
            .map_err(|source| attach_error(destination, source))?;

        Ok(Consumer { transport })
    }

    pub async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing {}", self.connection, self.id);

        self.transport
            .close()
            .await
            .map_err(|source| MessagingError::SessionClose {
                session: self.id,
                source,
            })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish()
    }
}

fn attach_error(destination: &Destination, source: crate::TransportError) -> MessagingError {
    MessagingError::Attach {
        kind: destination.kind(),
        name: destination.name().to_string(),
        source,
    }
}

/// Sends messages to one destination.
pub struct Producer {
    transport: Box<dyn TransportProducer>,
}

impl Producer {
    pub fn destination(&self) -> &Destination {
        self.transport.destination()
    }

    /// Send a payload to the producer's destination.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.send_message(Message::new(self.destination().name(), payload))
            .await
    }

    /// Send a prepared message.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        // ---
        self.transport
            .send(message)
            .await
            .map_err(|source| MessagingError::Send {
                destination: self.destination().to_string(),
                source,
            })
    }
}

/// Receives messages from one destination.
pub struct Consumer {
    transport: Box<dyn TransportConsumer>,
}

impl Consumer {
    pub fn destination(&self) -> &Destination {
        self.transport.destination()
    }

    /// Wait at most `timeout` for the next message; `Ok(None)` on timeout.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        // ---
        self.transport
            .receive(timeout)
            .await
            .map_err(|source| MessagingError::Receive {
                destination: self.destination().to_string(),
                source,
            })
    }
}
