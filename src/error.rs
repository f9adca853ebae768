use thiserror::Error;

use crate::{ConnectionId, DestinationKind, SessionId};

/// Failures reported by a transport implementation.
///
/// These are the raw errors of the broker SDK. They are cheap to clone so
/// that asynchronous faults can be fanned out to several observers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No driver in the active lookup context serves the URI scheme.
    #[error("no transport driver registered for scheme '{0}'")]
    DriverNotFound(String),

    /// The connection factory could not be built from the configuration.
    #[error("could not initialize connection factory: {0}")]
    FactoryInit(String),

    /// The broker rejected the supplied credentials (or anonymous access).
    #[error("authentication failed for {0}")]
    Authentication(String),

    /// The broker could not be reached.
    #[error("broker unreachable: {0}")]
    Network(String),

    /// The destination name is not acceptable to the broker.
    #[error("invalid destination name '{0}'")]
    InvalidDestination(String),

    /// The session was closed (explicitly or with its connection).
    #[error("session closed")]
    SessionClosed,

    /// The connection was already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection was lost after it had been established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Result type alias for transport SPI operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by the provisioning layer.
///
/// Every variant wraps the underlying [`TransportError`] exactly once, so the
/// cause chain stays intact for callers (`std::error::Error::source`).
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Factory construction, authentication or handshake failed.
    #[error("could not create messaging connection")]
    ConnectionCreation {
        #[source]
        source: TransportError,
    },

    /// A queue or topic could not be resolved within a session.
    #[error("could not access {kind} {name}")]
    DestinationResolution {
        kind: DestinationKind,
        name: String,
        #[source]
        source: TransportError,
    },

    /// A session could not be opened on a connection.
    #[error("could not create session on connection {connection}")]
    SessionCreation {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// A producer or consumer could not be attached to a destination.
    #[error("could not attach to {kind} {name}")]
    Attach {
        kind: DestinationKind,
        name: String,
        #[source]
        source: TransportError,
    },

    /// Sending to a destination failed.
    #[error("could not send to {destination}")]
    Send {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// Receiving from a destination failed.
    #[error("could not receive from {destination}")]
    Receive {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// Closing a session failed.
    #[error("could not close session {session}")]
    SessionClose {
        session: SessionId,
        #[source]
        source: TransportError,
    },

    /// Closing a connection failed.
    #[error("could not close connection {connection}")]
    ConnectionClose {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// Configuration was incomplete or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MessagingError {
    /// The transport failure behind this error, if there is one.
    ///
    /// Lets callers tell authentication failures from network failures
    /// without string matching.
    pub fn transport_error(&self) -> Option<&TransportError> {
        // ---
        match self {
            Self::ConnectionCreation { source }
            | Self::DestinationResolution { source, .. }
            | Self::SessionCreation { source, .. }
            | Self::Attach { source, .. }
            | Self::Send { source, .. }
            | Self::Receive { source, .. }
            | Self::SessionClose { source, .. }
            | Self::ConnectionClose { source, .. } => Some(source),
            Self::Config(_) => None,
        }
    }
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::error::Error as _;

    #[test]
    fn connection_creation_keeps_cause_chain() {
        // ---
        let err = MessagingError::ConnectionCreation {
            source: TransportError::Authentication("user 'bob'".into()),
        };

        assert_eq!(err.to_string(), "could not create messaging connection");
        let cause = err.source().expect("missing cause");
        assert_eq!(cause.to_string(), "authentication failed for user 'bob'");
        assert!(matches!(
            err.transport_error(),
            Some(TransportError::Authentication(_))
        ));
    }

    #[test]
    fn destination_resolution_names_kind() {
        // ---
        let err = MessagingError::DestinationResolution {
            kind: DestinationKind::Topic,
            name: "prices".into(),
            source: TransportError::SessionClosed,
        };
        assert_eq!(err.to_string(), "could not access topic prices");
    }

    #[test]
    fn config_error_has_no_transport_cause() {
        // ---
        let err = MessagingError::Config("missing lookup context".into());
        assert!(err.transport_error().is_none());
    }
}
