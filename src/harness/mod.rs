//! Heavy distribution harness.
//!
//! Drives a matrix of concurrent cases against a
//! [`ConnectionProvider`](crate::ConnectionProvider) and
//! checks that every message is delivered exactly once, to the right
//! destination, while no more than `max_concurrent_tests` cases hold broker
//! resources at the same time.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mom_provider::{
//!     DistributionConfig, DistributionHarness, LookupContext, MemoryBroker, MemoryDriver,
//!     ProviderBuilder, TransportDriver,
//! };
//!
//! # async fn example() -> mom_provider::Result<()> {
//! let broker = MemoryBroker::new("heavy");
//! let driver: Arc<dyn TransportDriver> = MemoryDriver::new([broker.clone()]);
//! let provider = ProviderBuilder::new()
//!     .host_address(broker.address())
//!     .context(LookupContext::new("heavy", [driver]))
//!     .build()?;
//!
//! let harness = DistributionHarness::setup(Arc::new(provider), DistributionConfig::default())?;
//! let report = harness.run().await;
//! println!("{report}");
//! harness.teardown().await;
//! # Ok(())
//! # }
//! ```

mod case;
mod config;
mod report;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::{
    // ---
    log_error,
    log_info,
    log_warn,
    CloseAllReport,
    ConnectionFault,
    ProviderPtr,
    Result,
};

use case::{flatten, run_case};
use config::CaseSpec;

pub use config::DistributionConfig;
pub use report::{CaseError, CaseOutcome, CaseStats, DestinationTally, SuiteReport};

/// Bound parameters plus the provider under test.
pub struct DistributionHarness {
    provider: ProviderPtr,
    config: Arc<DistributionConfig>,
}

/// Tracks how many cases are executing and the highest count seen.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(self: &Arc<Self>) -> GaugeGuard {
        // ---
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(Arc::clone(self))
    }
}

struct GaugeGuard(Arc<Gauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DistributionHarness {
    /// Validate `config` and bind it to `provider` for the run.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Config`](crate::MessagingError::Config) when
    /// the matrix is not runnable.
    pub fn setup(provider: ProviderPtr, config: DistributionConfig) -> Result<Self> {
        // ---
        config.validate()?;

        log_info!(
            "distribution harness bound to {}: {} case(s), at most {} concurrent",
            provider.description(),
            config.case_count(),
            config.max_concurrent_tests
        );

        Ok(Self {
            provider,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    pub fn provider(&self) -> &ProviderPtr {
        &self.provider
    }

    /// Execute every case and collect the outcomes.
    ///
    /// Never fails as a whole: each case's failure is recorded in its own
    /// outcome and does not affect its siblings.
    pub async fn run(&self) -> SuiteReport {
        // ---
        let started = Instant::now();
        let mut faults = self.provider.faults();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tests));
        let gauge = Arc::new(Gauge::default());

        let mut pending: BTreeMap<usize, CaseSpec> = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for spec in self.config.cases() {
            pending.insert(spec.index, spec);

            let provider = Arc::clone(&self.provider);
            let config = Arc::clone(&self.config);
            let permits = Arc::clone(&permits);
            let gauge = Arc::clone(&gauge);

            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return outcome(spec, Err(CaseError::Cancelled)),
                };
                let _active = gauge.enter();

                // A nested task turns a panic into an outcome for this case.
                let result = flatten(tokio::spawn(run_case(provider, config, spec)).await);
                outcome(spec, result)
            });
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    pending.remove(&outcome.index);
                    if let Err(err) = &outcome.result {
                        log_warn!(
                            "case {} ({} message(s), {}) failed: {err}",
                            outcome.index,
                            outcome.message_count,
                            outcome.kind
                        );
                    }
                    outcomes.push(outcome);
                }
                Err(err) => log_error!("harness task failed: {err}"),
            }
        }

        // Whatever never reported back was lost with its task.
        outcomes.extend(
            pending
                .into_values()
                .map(|spec| outcome(spec, Err(CaseError::Cancelled))),
        );
        outcomes.sort_by_key(|o| o.index);

        let report = SuiteReport {
            outcomes,
            peak_concurrency: gauge.peak.load(Ordering::SeqCst),
            faults: drain_faults(&mut faults),
            elapsed: started.elapsed(),
        };

        log_info!(
            "distribution run finished: {} of {} case(s) passed, peak concurrency {}",
            report.outcomes.len() - report.failures().count(),
            report.outcomes.len(),
            report.peak_concurrency
        );

        report
    }

    /// Close every connection the provider still tracks.
    pub async fn teardown(self) -> CloseAllReport {
        self.provider.close_all().await
    }
}

fn outcome(spec: CaseSpec, result: std::result::Result<CaseStats, CaseError>) -> CaseOutcome {
    CaseOutcome {
        index: spec.index,
        message_count: spec.message_count,
        kind: spec.kind,
        result,
    }
}

fn drain_faults(faults: &mut broadcast::Receiver<ConnectionFault>) -> Vec<ConnectionFault> {
    // ---
    let mut drained = Vec::new();
    loop {
        match faults.try_recv() {
            Ok(fault) => drained.push(fault),
            Err(TryRecvError::Lagged(skipped)) => {
                log_warn!("fault observer lagged, {skipped} fault(s) dropped");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    drained
}
