// src/domain/transport.rs

//! Transport SPI.
//!
//! This module defines the capability set the provisioning layer consumes
//! from a broker client library: connection-factory construction,
//! authenticated or anonymous connection creation, queue and topic
//! resolution, producers and consumers, and exception-listener
//! registration.
//!
//! The provider treats every implementation as opaque. It never inspects
//! wire formats and makes no assumptions about ordering or durability beyond
//! what a concrete transport documents.
//!
//! The in-memory transport under `src/transport/` is the reference
//! implementation of these semantics.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BrokerConfig, Credentials, Message, TransportError, TransportResult};

/// Identifier of a connection created by a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique connection id.
    pub(crate) fn next() -> Self {
        // ---
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of a session, assigned by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Delivery model of a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Point-to-point: every message is consumed by exactly one consumer.
    Queue,

    /// Publish/subscribe: every consumer attached when a message is sent
    /// receives its own copy.
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => f.write_str("queue"),
            Self::Topic => f.write_str("topic"),
        }
    }
}

/// A queue or topic resolved within a session.
///
/// Handles resolved in different sessions compare unequal even when they
/// name the same broker object; use [`Destination::denotes`] to compare the
/// broker object itself. A handle is only usable while the session that
/// resolved it is open.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    // ---
    kind: DestinationKind,
    name: Arc<str>,
    session: SessionId,
}

impl Destination {
    /// Create a destination handle. Called by transport implementations.
    pub fn new(kind: DestinationKind, name: impl Into<Arc<str>>, session: SessionId) -> Self {
        // ---
        Self {
            kind,
            name: name.into(),
            session,
        }
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The session this handle was resolved in.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// True when both handles denote the same broker object.
    pub fn denotes(&self, other: &Destination) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.name)
    }
}

/// Receiver of asynchronous connection-level failures.
///
/// Invoked on the transport's own dispatch context. Implementations must
/// return promptly and must not block.
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: TransportError);
}

/// Entry point of a transport library, discovered by URI scheme through the
/// active [`LookupContext`](crate::LookupContext).
pub trait TransportDriver: Send + Sync {
    /// URI scheme served by this driver (e.g. `"memory"`).
    fn scheme(&self) -> &str;

    /// Build a connection factory for the given broker configuration.
    ///
    /// Runs while the provider's lookup context is installed on the calling
    /// thread.
    fn create_factory(&self, config: &BrokerConfig) -> TransportResult<Arc<dyn ConnectionFactory>>;
}

/// Creates transport connections to one broker.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    // ---
    /// Open an anonymous connection.
    async fn create_connection(&self) -> TransportResult<Box<dyn TransportConnection>>;

    /// Open a connection authenticated with the given credentials.
    async fn create_connection_with(
        &self,
        credentials: &Credentials,
    ) -> TransportResult<Box<dyn TransportConnection>>;
}

/// A live connection to a broker.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync {
    // ---
    /// User the connection authenticated as; `None` for anonymous connections.
    fn principal(&self) -> Option<&str>;

    /// Install the listener notified of asynchronous connection faults.
    ///
    /// Replaces any previously installed listener.
    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>);

    async fn create_session(&self) -> TransportResult<Box<dyn TransportSession>>;

    /// Close the connection and every session opened on it.
    ///
    /// Closing an already closed connection fails with
    /// [`TransportError::ConnectionClosed`].
    async fn close(&self) -> TransportResult<()>;
}

/// A logical channel over a connection.
///
/// Sessions must not be driven concurrently from unrelated tasks without
/// external synchronization.
#[async_trait::async_trait]
pub trait TransportSession: Send + Sync {
    // ---
    fn id(&self) -> SessionId;

    fn create_queue(&self, name: &str) -> TransportResult<Destination>;

    fn create_topic(&self, name: &str) -> TransportResult<Destination>;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> TransportResult<Box<dyn TransportProducer>>;

    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> TransportResult<Box<dyn TransportConsumer>>;

    async fn close(&self) -> TransportResult<()>;
}

/// Sends messages to one destination.
#[async_trait::async_trait]
pub trait TransportProducer: Send + Sync {
    fn destination(&self) -> &Destination;

    async fn send(&self, message: Message) -> TransportResult<()>;
}

/// Receives messages from one destination.
#[async_trait::async_trait]
pub trait TransportConsumer: Send + Sync {
    fn destination(&self) -> &Destination;

    /// Wait at most `timeout` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time.
    async fn receive(&self, timeout: Duration) -> TransportResult<Option<Message>>;
}
