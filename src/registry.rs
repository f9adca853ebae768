//! Provider-scoped index of live connections.
//!
//! The registry does not own connections; it holds handles so that every
//! connection a provider created can be closed in bulk. All mutations go
//! through one async mutex, so `add`, `remove` and `close_all` never
//! interleave.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::{log_debug, log_warn, Connection, ConnectionId, MessagingError};

/// Outcome of [`ConnectionRegistry::close_all`].
#[derive(Debug, Default)]
pub struct CloseAllReport {
    /// Connections that closed cleanly.
    pub closed: usize,

    /// Connections whose close failed. They are no longer tracked.
    pub failures: Vec<(ConnectionId, MessagingError)>,
}

impl CloseAllReport {
    /// True when every close succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of connections that were attempted.
    pub fn attempted(&self) -> usize {
        self.closed + self.failures.len()
    }
}

/// Live connections created by one provider.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection.
    pub async fn add(&self, connection: Connection) {
        // ---
        let mut connections = self.connections.lock().await;
        connections.insert(connection.id(), connection);
    }

    /// Forget a connection that was closed on its own.
    ///
    /// Returns false when the connection was not tracked.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        // ---
        let mut connections = self.connections.lock().await;
        connections.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Close every tracked connection.
    ///
    /// Keeps going past individual failures; each one is logged and
    /// collected in the report. The registry is empty afterwards.
    pub async fn close_all(&self) -> CloseAllReport {
        // ---
        let mut connections = self.connections.lock().await;
        let mut report = CloseAllReport::default();

        let mut drained: Vec<Connection> = connections.drain().map(|(_, c)| c).collect();
        drained.sort_by_key(Connection::id);

        for connection in drained {
            match connection.shutdown().await {
                Ok(()) => report.closed += 1,
                Err(err) => {
                    log_warn!("{}: close failed, skipping: {err}", connection.id());
                    report.failures.push((connection.id(), err));
                }
            }
        }

        log_debug!(
            "registry closed {} connection(s), {} failure(s)",
            report.closed,
            report.failures.len()
        );

        report
    }
}
