//! Provider builder.
//!
//! Provides a fluent builder API for constructing a [`BrokerProvider`] from a
//! broker configuration and the lookup context its transport is discovered in.

use crate::{BrokerConfig, BrokerProvider, Credentials, LookupContext, MessagingError, Result};

/// Default capacity of the fault broadcast channel.
const DEFAULT_FAULT_CAPACITY: usize = 64;

/// Builder for [`BrokerProvider`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use mom_provider::{
///     ConnectionProvider, LookupContext, MemoryBroker, MemoryDriver, ProviderBuilder,
///     TransportDriver,
/// };
///
/// let broker = MemoryBroker::new("local");
/// let driver: Arc<dyn TransportDriver> = MemoryDriver::new([broker.clone()]);
///
/// let provider = ProviderBuilder::new()
///     .label("Orders")
///     .host_address(broker.address())
///     .credentials("app", "secret")
///     .context(LookupContext::new("orders", [driver]))
///     .build()
///     .expect("valid provider");
///
/// assert_eq!(provider.description(), "Orders Messaging connected to memory://local");
/// ```
pub struct ProviderBuilder {
    config: BrokerConfig,
    label: String,
    context: Option<LookupContext>,
    fault_capacity: usize,
}

impl ProviderBuilder {
    /// Create a new provider builder.
    pub fn new() -> Self {
        Self {
            config: BrokerConfig::default(),
            label: "Broker".to_string(),
            context: None,
            fault_capacity: DEFAULT_FAULT_CAPACITY,
        }
    }

    /// Set the broker address, e.g. `"memory://local"`.
    ///
    /// The URI scheme selects the transport driver.
    pub fn host_address(mut self, host: impl Into<String>) -> Self {
        self.config.host_address = Some(host.into());
        self
    }

    /// Set username and password for the authenticated path.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let Credentials { username, password } = Credentials::new(username, password);
        self.config.username = Some(username);
        self.config.password = Some(password);
        self
    }

    /// Set the username only.
    ///
    /// Without a password the provider connects anonymously.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Replace the whole broker configuration.
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Name used in the description and in log lines. Default: `"Broker"`.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Lookup context the transport driver is discovered in (required).
    pub fn context(mut self, context: LookupContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Number of faults buffered per observer before the oldest are dropped.
    pub fn fault_capacity(mut self, capacity: usize) -> Self {
        self.fault_capacity = capacity;
        self
    }

    /// Build the provider.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Config`] if no lookup context was given or
    /// the fault capacity is zero.
    pub fn build(self) -> Result<BrokerProvider> {
        // ---
        let context = self
            .context
            .ok_or_else(|| MessagingError::Config("lookup context is required".into()))?;

        if self.fault_capacity == 0 {
            return Err(MessagingError::Config(
                "fault_capacity must be greater than zero".into(),
            ));
        }

        Ok(BrokerProvider::new(
            self.label,
            self.config,
            context,
            self.fault_capacity,
        ))
    }
}

impl Default for ProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
