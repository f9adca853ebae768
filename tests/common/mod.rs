// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Arc;

use mom_provider::{
    // ---
    BrokerProvider,
    LookupContext,
    MemoryBroker,
    MemoryDriver,
    ProviderBuilder,
    TransportDriver,
};

pub const USER: &str = "app";
pub const PASSWORD: &str = "secret";

/// Broker accepting `USER`/`PASSWORD` and, optionally, anonymous clients.
pub fn broker(name: &str, allow_anonymous: bool) -> Arc<MemoryBroker> {
    MemoryBroker::builder(name)
        .user(USER, PASSWORD)
        .allow_anonymous(allow_anonymous)
        .build()
}

/// Lookup context serving the memory driver for `broker`.
pub fn memory_context(label: &str, broker: &Arc<MemoryBroker>) -> LookupContext {
    let driver: Arc<dyn TransportDriver> = MemoryDriver::new([Arc::clone(broker)]);
    LookupContext::new(label, [driver])
}

/// Builder pre-wired to `broker` under its own lookup context.
pub fn builder_for(broker: &Arc<MemoryBroker>) -> ProviderBuilder {
    ProviderBuilder::new()
        .host_address(broker.address())
        .context(memory_context("provider", broker))
}

pub fn provider_for(broker: &Arc<MemoryBroker>) -> BrokerProvider {
    builder_for(broker).build().expect("failed to build provider")
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
