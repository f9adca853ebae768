//! Outcomes of a distribution run.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::{ConnectionFault, DestinationKind, MessagingError};

/// Why a case failed.
#[derive(Error, Debug)]
pub enum CaseError {
    /// The provider or transport failed while the case was acquiring or
    /// using resources.
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// Fewer stamps arrived than were sent.
    #[error("{destination}: expected {expected} stamp(s), received {received}")]
    Lost {
        destination: String,
        expected: usize,
        received: usize,
    },

    /// A stamp arrived more often than its delivery model allows.
    #[error("{destination}: stamp {producer}/{sequence} delivered {count} times")]
    Duplicated {
        destination: String,
        producer: usize,
        sequence: usize,
        count: usize,
    },

    /// A stamp sent to one destination was observed on another.
    #[error("{destination}: received stamp addressed to {origin}")]
    CrossTalk { destination: String, origin: String },

    /// A payload could not be interpreted as a stamp.
    #[error("{destination}: malformed stamp: {reason}")]
    Malformed { destination: String, reason: String },

    /// The case panicked.
    #[error("case panicked: {0}")]
    Panicked(String),

    /// The case was cancelled before it could finish.
    #[error("case cancelled")]
    Cancelled,
}

/// Delivery counts for one destination of a case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationTally {
    pub destination: String,
    pub kind: DestinationKind,

    /// Stamps sent to the destination (message count × producers). For a
    /// topic this is also what every single consumer must see.
    pub expected: usize,

    /// Stamps received across all consumers.
    pub received: usize,

    /// Stamps received by each consumer, in attach order.
    pub per_consumer: Vec<usize>,
}

/// Measurements of a successful case.
#[derive(Clone, Debug, Default)]
pub struct CaseStats {
    pub destinations: Vec<DestinationTally>,
    pub elapsed: Duration,
}

impl CaseStats {
    /// Stamps received across every destination of the case.
    pub fn delivered(&self) -> usize {
        self.destinations.iter().map(|t| t.received).sum()
    }
}

/// Result of one case of the matrix.
#[derive(Debug)]
pub struct CaseOutcome {
    pub index: usize,
    pub message_count: usize,
    pub kind: DestinationKind,
    pub result: Result<CaseStats, CaseError>,
}

impl CaseOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything a run observed.
#[derive(Debug, Default)]
pub struct SuiteReport {
    /// One entry per case, ordered by case index.
    pub outcomes: Vec<CaseOutcome>,

    /// Highest number of cases that were executing at the same time.
    pub peak_concurrency: usize,

    /// Asynchronous connection faults reported while the run was active.
    pub faults: Vec<ConnectionFault>,

    pub elapsed: Duration,
}

impl SuiteReport {
    pub fn failures(&self) -> impl Iterator<Item = &CaseOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let failed = self.failures().count();
        writeln!(
            f,
            "{} case(s), {} failed, peak concurrency {}, {} fault(s), {:?}",
            self.outcomes.len(),
            failed,
            self.peak_concurrency,
            self.faults.len(),
            self.elapsed
        )?;

        for outcome in self.failures() {
            if let Err(err) = &outcome.result {
                writeln!(
                    f,
                    "  case {:>3}  messages={:<6} {:<5}  {err}",
                    outcome.index, outcome.message_count, outcome.kind
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn outcome(index: usize, result: Result<CaseStats, CaseError>) -> CaseOutcome {
        CaseOutcome {
            index,
            message_count: 4,
            kind: DestinationKind::Queue,
            result,
        }
    }

    #[test]
    fn display_has_one_row_per_failure() {
        // ---
        let report = SuiteReport {
            outcomes: vec![
                outcome(0, Ok(CaseStats::default())),
                outcome(1, Err(CaseError::Cancelled)),
                outcome(
                    2,
                    Err(CaseError::Lost {
                        destination: "queue://a".into(),
                        expected: 8,
                        received: 7,
                    }),
                ),
            ],
            peak_concurrency: 2,
            ..SuiteReport::default()
        };

        let rendered = report.to_string();
        let lines: Vec<_> = rendered.lines().collect();

        assert!(!report.is_success());
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("3 case(s), 2 failed"));
        assert!(lines[1].contains("case   1") && lines[1].contains("cancelled"));
        assert!(lines[2].contains("expected 8 stamp(s), received 7"));
    }

    #[test]
    fn messaging_error_is_transparent() {
        // ---
        let err = CaseError::from(MessagingError::Config("bad".into()));
        assert_eq!(err.to_string(), "invalid configuration: bad");
    }
}
