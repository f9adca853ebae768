//! Parameters of a distribution run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DestinationKind, MessagingError, Result};

/// Matrix parameters, fixed before a run starts.
///
/// The default is the reference scenario: message counts `[1, 4, 8]`,
/// 2 sessions per connection, 4 destinations per session, 2 producers and
/// 2 consumers per destination, at most 10 cases in flight, queues only.
///
/// # Example
///
/// ```
/// use mom_provider::{DestinationKind, DistributionConfig};
///
/// let config = DistributionConfig::default()
///     .with_messages([10, 100])
///     .with_destination_kinds([DestinationKind::Queue, DestinationKind::Topic])
///     .with_max_concurrent_tests(4);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.case_count(), 4);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    // ---
    /// Messages sent by each producer, one case per value, in order.
    pub messages: Vec<usize>,

    /// Upper bound on cases executing at the same time.
    pub max_concurrent_tests: usize,

    /// Sessions opened on each case's connection.
    pub session_group: usize,

    /// Destinations resolved in each session.
    pub destination_group: usize,

    /// Producers attached to each destination.
    pub producer_group: usize,

    /// Consumers attached to each destination.
    pub consumer_group: usize,

    /// Delivery models to exercise; every message count runs once per kind.
    pub destination_kinds: Vec<DestinationKind>,

    /// A consumer that sees no progress on its destination for this long
    /// gives up.
    pub receive_timeout: Duration,

    /// How long consumers keep listening after their quota is met, to catch
    /// duplicates.
    pub settle_window: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            messages: vec![1, 4, 8],
            max_concurrent_tests: 10,
            session_group: 2,
            destination_group: 4,
            producer_group: 2,
            consumer_group: 2,
            destination_kinds: vec![DestinationKind::Queue],
            receive_timeout: Duration::from_secs(2),
            settle_window: Duration::from_millis(50),
        }
    }
}

impl DistributionConfig {
    pub fn with_messages(mut self, messages: impl IntoIterator<Item = usize>) -> Self {
        self.messages = messages.into_iter().collect();
        self
    }

    pub fn with_max_concurrent_tests(mut self, max: usize) -> Self {
        self.max_concurrent_tests = max;
        self
    }

    pub fn with_session_group(mut self, sessions: usize) -> Self {
        self.session_group = sessions;
        self
    }

    pub fn with_destination_group(mut self, destinations: usize) -> Self {
        self.destination_group = destinations;
        self
    }

    pub fn with_producer_group(mut self, producers: usize) -> Self {
        self.producer_group = producers;
        self
    }

    pub fn with_consumer_group(mut self, consumers: usize) -> Self {
        self.consumer_group = consumers;
        self
    }

    pub fn with_destination_kinds(
        mut self,
        kinds: impl IntoIterator<Item = DestinationKind>,
    ) -> Self {
        self.destination_kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_settle_window(mut self, window: Duration) -> Self {
        self.settle_window = window;
        self
    }

    /// Number of cases the matrix expands to.
    pub fn case_count(&self) -> usize {
        self.messages.len() * self.destination_kinds.len()
    }

    /// Check that the matrix is runnable.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        // ---
        let groups = [
            ("max_concurrent_tests", self.max_concurrent_tests),
            ("session_group", self.session_group),
            ("destination_group", self.destination_group),
            ("producer_group", self.producer_group),
            ("consumer_group", self.consumer_group),
        ];

        if let Some((field, _)) = groups.iter().find(|(_, value)| *value == 0) {
            return Err(MessagingError::Config(format!(
                "{field} must be greater than zero"
            )));
        }

        if self.messages.is_empty() {
            return Err(MessagingError::Config("messages must not be empty".into()));
        }

        if self.messages.contains(&0) {
            return Err(MessagingError::Config(
                "message counts must be greater than zero".into(),
            ));
        }

        if self.destination_kinds.is_empty() {
            return Err(MessagingError::Config(
                "destination_kinds must not be empty".into(),
            ));
        }

        if self.receive_timeout.is_zero() {
            return Err(MessagingError::Config(
                "receive_timeout must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    /// Expand the matrix into cases: message counts in order, each once per
    /// destination kind.
    pub(crate) fn cases(&self) -> Vec<CaseSpec> {
        // ---
        self.messages
            .iter()
            .flat_map(|&message_count| {
                self.destination_kinds
                    .iter()
                    .map(move |&kind| (message_count, kind))
            })
            .enumerate()
            .map(|(index, (message_count, kind))| CaseSpec {
                index,
                message_count,
                kind,
            })
            .collect()
    }
}

/// One generated case of the matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CaseSpec {
    pub index: usize,
    pub message_count: usize,
    pub kind: DestinationKind,
}
