//! Domain layer public interface.
//!
//! This module defines the transport SPI consumed from a broker client
//! library. It is independent of any concrete broker, protocol or
//! client SDK.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
    //
    ConnectionFactory,
    ConnectionId,
    Destination,
    DestinationKind,
    ExceptionListener,
    SessionId,
    TransportConnection,
    TransportConsumer,
    TransportDriver,
    TransportProducer,
    TransportSession,
};
