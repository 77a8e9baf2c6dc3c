use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use ulid::Ulid;

/// Identity of one claim cycle
///
/// The pair (`locker`, `locked_at`) is written onto every row a cycle claims
/// and is the only way the cycle finds those rows again. `locker` embeds the
/// worker name, process id and a fresh ULID so no two cycles share it, even
/// within one process. `locked_at` is captured once, truncated to the
/// microsecond precision SQL timestamps keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    locker: String,
    locked_at: DateTime<Utc>,
}

impl ClaimToken {
    #[must_use]
    pub fn generate(worker_name: &str) -> Self {
        Self {
            locker: format!("{worker_name}:{}:{}", std::process::id(), Ulid::new()),
            locked_at: Utc::now().trunc_subsecs(6),
        }
    }

    #[must_use]
    pub fn locker(&self) -> &str {
        &self.locker
    }

    #[must_use]
    pub const fn locked_at(&self) -> DateTime<Utc> {
        self.locked_at
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.locker, self.locked_at.to_rfc3339())
    }
}
