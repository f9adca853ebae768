//! Broker connection configuration.
//!
//! This type intentionally contains no transport-specific concepts. The
//! driver selected for the host address' URI scheme is responsible for
//! interpreting it into concrete connection settings.

use std::fmt;

use serde::Deserialize;

/// Username/password pair used on the authenticated connection path.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        // ---
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection parameters for one broker.
///
/// Bound once to a provider and read-only afterwards; the provider shares it
/// between connections behind an `Arc`.
///
/// # Example
///
/// ```
/// use mom_provider::BrokerConfig;
///
/// let config = BrokerConfig::with_host("memory://local")
///     .with_credentials("app", "secret");
/// assert!(config.credentials().is_some());
///
/// // A half credential pair connects anonymously.
/// let anonymous = BrokerConfig::with_host("memory://local").with_username("app");
/// assert!(anonymous.credentials().is_none());
/// ```
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    // ---
    /// Broker address, e.g. `"memory://local"` or `"tcp://broker:61616"`.
    ///
    /// The URI scheme selects the transport driver.
    pub host_address: Option<String>,

    pub username: Option<String>,

    pub password: Option<String>,
}

impl BrokerConfig {
    /// Create a configuration for the given broker address.
    pub fn with_host(host_address: impl Into<String>) -> Self {
        Self {
            host_address: Some(host_address.into()),
            username: None,
            password: None,
        }
    }

    /// Set both username and password.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Credentials for the authenticated path.
    ///
    /// `Some` only when both username and password are present.
    pub fn credentials(&self) -> Option<Credentials> {
        // ---
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    /// The host address, if set and not blank.
    pub fn host(&self) -> Option<&str> {
        self.host_address
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    }

    /// URI scheme of the host address (`"memory"` for `"memory://local"`).
    pub fn scheme(&self) -> Option<&str> {
        // ---
        let host = self.host()?;
        let (scheme, _) = host.split_once("://")?;
        if scheme.is_empty() {
            None
        } else {
            Some(scheme)
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("BrokerConfig")
            .field("host_address", &self.host_address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn credentials_require_both_halves() {
        // ---
        let both = BrokerConfig::with_host("memory://a").with_credentials("u", "p");
        let user_only = BrokerConfig::with_host("memory://a").with_username("u");
        let pass_only = BrokerConfig::with_host("memory://a").with_password("p");

        assert_eq!(both.credentials(), Some(Credentials::new("u", "p")));
        assert_eq!(user_only.credentials(), None);
        assert_eq!(pass_only.credentials(), None);
        assert_eq!(BrokerConfig::default().credentials(), None);
    }

    #[test]
    fn scheme_and_blank_host() {
        // ---
        assert_eq!(BrokerConfig::with_host("memory://a").scheme(), Some("memory"));
        assert_eq!(BrokerConfig::with_host("no-scheme").scheme(), None);
        assert_eq!(BrokerConfig::with_host("   ").host(), None);
        assert_eq!(BrokerConfig::default().scheme(), None);
    }

    #[test]
    fn debug_redacts_password() {
        // ---
        let config = BrokerConfig::with_host("memory://a").with_credentials("u", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!format!("{:?}", config.credentials()).contains("hunter2"));
    }

    #[test]
    fn deserializes_partial_config() {
        // ---
        let config: BrokerConfig =
            serde_json::from_str(r#"{ "host_address": "memory://a", "username": "u" }"#)
                .expect("valid config");
        assert_eq!(config.host(), Some("memory://a"));
        assert!(config.credentials().is_none());
    }
}
