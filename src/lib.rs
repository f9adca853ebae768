//! Broker connection provisioning over a message-oriented middleware SPI
//!
//! This library creates, authenticates, registers and tears down transport
//! connections to a broker, resolves queue and topic destinations per
//! session, and ships a heavy distribution harness that drives a concurrent
//! matrix of sessions, destinations, producers and consumers against a
//! provider to validate exactly-once delivery under contention.
//!

// Import all sub modules once...
mod connection;
mod domain;
mod fault;
mod harness;
mod lookup;
mod macros;
mod message;
mod provider;
mod provider_builder;
mod registry;
mod transport;

mod config;
mod error;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use provider::{BrokerProvider, ConnectionProvider, ProviderPtr};
pub use provider_builder::ProviderBuilder;

pub use config::{BrokerConfig, Credentials};
pub use connection::{Connection, Consumer, Producer, Session};
pub use error::{MessagingError, Result, TransportError, TransportResult};
pub use fault::{ConnectionFault, FaultListener};
pub use lookup::{ContextGuard, LookupContext};
pub use message::Message;
pub use registry::{CloseAllReport, ConnectionRegistry};

pub use harness::{
    // ---
    CaseError,
    CaseOutcome,
    CaseStats,
    DestinationTally,
    DistributionConfig,
    DistributionHarness,
    SuiteReport,
};

pub use transport::{MemoryBroker, MemoryBrokerBuilder, MemoryDriver, MEMORY_SCHEME};

// --- public re-exports
pub use domain::{
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

/// Returns the lookup context installed on the calling thread, if any.
pub fn current_context() -> Option<LookupContext> {
    lookup::current()
}
