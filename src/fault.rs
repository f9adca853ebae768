//! Asynchronous connection fault reporting.
//!
//! A [`FaultListener`] is installed on every connection a provider creates.
//! The transport invokes it on its own dispatch context when the connection
//! fails. The listener only logs and emits a [`ConnectionFault`] on a
//! broadcast channel; it never blocks and never retries. Reconnect policy,
//! if any, belongs to whoever observes the channel.

use tokio::sync::broadcast;

use crate::{log_error, log_trace, ConnectionId, ExceptionListener, TransportError};

/// A transport-level failure of one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionFault {
    pub connection: ConnectionId,
    pub error: TransportError,
}

/// Exception listener that forwards faults to observers.
pub struct FaultListener {
    // ---
    connection: ConnectionId,
    sender: broadcast::Sender<ConnectionFault>,
}

impl FaultListener {
    pub fn new(connection: ConnectionId, sender: broadcast::Sender<ConnectionFault>) -> Self {
        Self { connection, sender }
    }
}

impl ExceptionListener for FaultListener {
    fn on_exception(&self, error: TransportError) {
        // ---
        log_error!("{}: transport fault: {error}", self.connection);

        let fault = ConnectionFault {
            connection: self.connection,
            error,
        };

        // broadcast::send never waits; it only fails when nobody listens.
        if self.sender.send(fault).is_err() {
            log_trace!("{}: no fault observers", self.connection);
        }
    }
}
