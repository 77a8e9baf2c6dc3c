use chrono::{DateTime, Utc};
use egress_registry::AddressId;
use serde::{Deserialize, Serialize};

use crate::{ClaimToken, EligibleAddresses};

pub type MessageId = i64;

/// A row of the shared outbound queue
///
/// Only `ip_address_id`, `locked_by` and `locked_at` are interpreted here.
/// The remaining fields belong to the mail pipeline and are carried through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    /// Identifier of the stored message body
    pub message_id: i64,
    /// Recipient domain
    pub domain: String,
    /// Required egress address, `None` when any address may deliver it
    pub ip_address_id: Option<AddressId>,
    pub attempts: i32,
    /// Earliest time of the next delivery attempt
    pub retry_after: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueuedMessage {
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked_by.is_some() || self.locked_at.is_some()
    }

    /// Whether this row may be claimed by a worker whose host can use `eligible`.
    ///
    /// `ready` is the verdict of the pipeline's retry-readiness predicate.
    #[must_use]
    pub fn is_claimable(&self, eligible: &EligibleAddresses, ready: bool) -> bool {
        !self.is_locked()
            && ready
            && self
                .ip_address_id
                .is_none_or(|address_id| eligible.contains(address_id))
    }

    /// Whether this row is stamped with exactly this claim.
    #[must_use]
    pub fn is_claimed_by(&self, token: &ClaimToken) -> bool {
        self.locked_by.as_deref() == Some(token.locker())
            && self.locked_at == Some(token.locked_at())
    }
}

/// A row to add to the queue
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewQueuedMessage {
    pub message_id: i64,
    pub domain: String,
    #[serde(default)]
    pub ip_address_id: Option<AddressId>,
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
}

impl NewQueuedMessage {
    #[must_use]
    pub fn new(message_id: i64, domain: impl Into<String>) -> Self {
        Self {
            message_id,
            domain: domain.into(),
            ip_address_id: None,
            retry_after: None,
        }
    }

    #[must_use]
    pub const fn via(mut self, address_id: AddressId) -> Self {
        self.ip_address_id = Some(address_id);
        self
    }

    #[must_use]
    pub const fn retry_after(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }
}
