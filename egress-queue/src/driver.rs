use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use egress_common::Liveness;
use futures_util::FutureExt;

use crate::QueuedMessage;

/// The mail pipeline's handler for one claimed row
///
/// Implementations own the row from here on: they deliver it, then clear or
/// reschedule its claim. Errors are reported back for logging only and are
/// never retried by the driver.
#[async_trait]
pub trait MessageProcessor: Send + Sync + std::fmt::Debug {
    async fn process(&self, message: &QueuedMessage) -> anyhow::Result<()>;
}

/// Outcome counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
}

/// Feeds claimed rows to the processor one at a time
#[derive(Debug, Clone)]
pub struct DequeueDriver {
    processor: Arc<dyn MessageProcessor>,
    liveness: Liveness,
}

impl DequeueDriver {
    #[must_use]
    pub fn new(processor: Arc<dyn MessageProcessor>, liveness: Liveness) -> Self {
        Self {
            processor,
            liveness,
        }
    }

    /// Process `messages` sequentially.
    ///
    /// The liveness tracker beats before every message. A failing or
    /// panicking callback is logged and the batch moves on.
    pub async fn process_batch(&self, messages: &[QueuedMessage]) -> BatchReport {
        let mut report = BatchReport::default();

        for message in messages {
            self.liveness.work_completed();

            let outcome = AssertUnwindSafe(self.processor.process(message))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => report.processed += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    tracing::warn!(
                        id = message.id,
                        error = %err,
                        "Processing queued message failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(id = message.id, "Processing queued message panicked");
                }
            }
        }

        report
    }
}
