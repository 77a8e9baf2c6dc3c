use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ClaimToken, EligibleAddresses, MessageId, NewQueuedMessage, QueuedMessage, Result,
};

/// One claim attempt against the shared queue
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub token: &'a ClaimToken,
    pub eligible: &'a EligibleAddresses,
    /// Upper bound on rows stamped by this request
    pub limit: usize,
    /// Reference time for retry readiness
    pub now: DateTime<Utc>,
}

/// Persistence for the outbound queue
///
/// `claim` is the only operation with a cross-process correctness
/// requirement: two concurrent calls, from any number of processes or hosts,
/// must never stamp the same row. Backends enforce that inside the store
/// itself with a single conditional write or a row-locking transaction.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    async fn enqueue(&self, message: NewQueuedMessage) -> Result<QueuedMessage>;

    async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>>;

    /// Stamp up to `request.limit` unclaimed, ready rows whose address is
    /// unset or in `request.eligible` with `request.token`.
    ///
    /// Returns how many rows were stamped.
    async fn claim(&self, request: &ClaimRequest<'_>) -> Result<u64>;

    /// Every row currently stamped with exactly this token.
    async fn claimed(&self, token: &ClaimToken) -> Result<Vec<QueuedMessage>>;

    /// Clear the claim on a row.
    ///
    /// With `retry_after` set the row is deferred until then and its attempt
    /// counter is incremented.
    async fn release(&self, id: MessageId, retry_after: Option<DateTime<Utc>>) -> Result<()>;

    /// Delete a row once the pipeline is finished with it.
    async fn remove(&self, id: MessageId) -> Result<()>;
}
