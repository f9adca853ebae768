//! Transport implementations.
//!
//! This module provides concrete implementations of the transport SPI
//! defined in `crate::domain`. Each transport is reachable through its
//! [`TransportDriver`](crate::TransportDriver), registered in a
//! [`LookupContext`](crate::LookupContext) under its URI scheme.
//!
//! Provisioning code must not depend on transport-specific types.

mod memory;

pub use memory::{MemoryBroker, MemoryBrokerBuilder, MemoryDriver, MEMORY_SCHEME};
