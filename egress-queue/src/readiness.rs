use chrono::{DateTime, Utc};

use crate::QueuedMessage;

/// Decides whether a queued row is due for an attempt
///
/// The retry schedule itself belongs to the mail pipeline; the claimer only
/// asks "may this row be picked up now".
pub trait ReadinessPredicate: Send + Sync + std::fmt::Debug {
    fn is_ready(&self, message: &QueuedMessage, now: DateTime<Utc>) -> bool;
}

/// Ready when no retry is scheduled or the scheduled time has passed
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayedRetry;

impl ReadinessPredicate for DelayedRetry {
    fn is_ready(&self, message: &QueuedMessage, now: DateTime<Utc>) -> bool {
        message.retry_after.is_none_or(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn message(retry_after: Option<DateTime<Utc>>) -> QueuedMessage {
        QueuedMessage {
            id: 1,
            message_id: 1,
            domain: "example.com".to_string(),
            ip_address_id: None,
            attempts: 1,
            retry_after,
            locked_by: None,
            locked_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_delayed_retry() {
        let now = Utc::now();
        assert!(DelayedRetry.is_ready(&message(None), now));
        assert!(DelayedRetry.is_ready(&message(Some(now)), now));
        assert!(DelayedRetry.is_ready(&message(Some(now - Duration::minutes(1))), now));
        assert!(!DelayedRetry.is_ready(&message(Some(now + Duration::minutes(1))), now));
    }
}
