//! The polling loop tying resolver, claimer and driver together

use std::{sync::Arc, time::Duration};

use egress_common::{Liveness, Signal, internal};
use egress_registry::RegistryStore;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::instrument;

use crate::{
    AddressLister, DequeueDriver, HostAddressResolver, MessageProcessor, QueueClaimer, QueueStore,
    Result,
};

fn default_worker_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "egress".to_string())
}

const fn default_batch_size() -> usize {
    1
}

const fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Prefix of every claim token this worker generates
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Maximum rows claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between claim cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: default_worker_name(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Counts for one resolve, claim and process cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub eligible: usize,
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct QueueWorker {
    poll_interval: Duration,
    resolver: HostAddressResolver,
    claimer: QueueClaimer,
    driver: DequeueDriver,
}

impl QueueWorker {
    #[must_use]
    pub fn new(
        config: &WorkerConfig,
        registry: Arc<dyn RegistryStore>,
        queue: Arc<dyn QueueStore>,
        lister: Arc<dyn AddressLister>,
        processor: Arc<dyn MessageProcessor>,
        liveness: Liveness,
    ) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            resolver: HostAddressResolver::new(lister, registry),
            claimer: QueueClaimer::new(queue, config.worker_name.clone(), config.batch_size),
            driver: DequeueDriver::new(processor, liveness),
        }
    }

    /// Resolve eligible addresses, claim one batch and process it.
    ///
    /// # Errors
    ///
    /// Returns an error if interfaces cannot be listed or a store query
    /// fails. Processing failures are counted, not returned.
    #[instrument(level = "trace", skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let eligible = self.resolver.eligible_address_ids().await?;
        let batch = self.claimer.claim_batch(&eligible).await?;

        if batch.is_empty() {
            return Ok(CycleReport {
                eligible: eligible.len(),
                ..CycleReport::default()
            });
        }

        let report = self.driver.process_batch(&batch.messages).await;

        Ok(CycleReport {
            eligible: eligible.len(),
            claimed: batch.len(),
            processed: report.processed,
            failed: report.failed,
        })
    }

    /// Run claim cycles every poll interval until shutdown.
    ///
    /// A cycle in progress when the signal arrives runs to completion first.
    ///
    /// # Errors
    ///
    /// Cycle errors are logged and the loop carries on; this only returns
    /// once shutdown is observed.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        internal!(
            level = INFO,
            "Queue worker starting, polling every {}s",
            self.poll_interval.as_secs()
        );

        let mut timer = tokio::time::interval(self.poll_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.claimed > 0 => {
                            tracing::info!(
                                claimed = report.claimed,
                                processed = report.processed,
                                failed = report.failed,
                                "Claim cycle complete"
                            );
                        }
                        Ok(_) => {
                            tracing::trace!("Claim cycle found nothing to do");
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "Claim cycle failed");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Queue worker received shutdown signal");
                        }
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Queue worker lagged behind the shutdown channel");
                            continue;
                        }
                        Err(RecvError::Closed) => {
                            tracing::error!("Queue worker shutdown channel closed");
                        }
                    }
                    break;
                }
            }
        }

        Ok(())
    }
}
