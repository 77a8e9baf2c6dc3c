use std::sync::Arc;

use chrono::Utc;
use egress_common::internal;
use tracing::instrument;

use crate::{
    ClaimRequest, ClaimToken, EligibleAddresses, MessageId, QueueStore, QueuedMessage, Result,
};

/// The rows one claim cycle owns
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub token: ClaimToken,
    /// Rows the conditional update reported stamping
    pub touched: u64,
    /// Rows read back by token
    pub messages: Vec<QueuedMessage>,
}

impl ClaimedBatch {
    #[must_use]
    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|message| message.id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Claims batches of queued rows on behalf of one worker
#[derive(Debug, Clone)]
pub struct QueueClaimer {
    store: Arc<dyn QueueStore>,
    worker_name: String,
    batch_size: usize,
}

impl QueueClaimer {
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        worker_name: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            worker_name: worker_name.into(),
            batch_size,
        }
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run one claim cycle.
    ///
    /// A fresh token is generated for every call. The store stamps up to
    /// `batch_size` eligible rows with it in one atomic operation, then the
    /// rows carrying the token are read back. The read-back is the claimed
    /// set regardless of the count the update reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached. Losing a race to
    /// another worker is not an error; it just yields fewer rows.
    #[instrument(skip_all, fields(eligible = eligible.len(), batch_size = self.batch_size))]
    pub async fn claim_batch(&self, eligible: &EligibleAddresses) -> Result<ClaimedBatch> {
        let token = ClaimToken::generate(&self.worker_name);

        if self.batch_size == 0 {
            return Ok(ClaimedBatch {
                token,
                touched: 0,
                messages: Vec::new(),
            });
        }

        let touched = self
            .store
            .claim(&ClaimRequest {
                token: &token,
                eligible,
                limit: self.batch_size,
                now: Utc::now(),
            })
            .await?;

        let messages = self.store.claimed(&token).await?;

        if messages.is_empty() {
            tracing::trace!(token = %token, "Nothing to claim");
        } else {
            internal!(
                level = DEBUG,
                token = %token,
                claimed = messages.len(),
                "Claimed queued messages"
            );
        }

        Ok(ClaimedBatch {
            token,
            touched,
            messages,
        })
    }
}
