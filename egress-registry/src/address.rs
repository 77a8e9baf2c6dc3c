use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PoolId, PoolType};

pub type AddressId = i64;

/// Default `priority` for new addresses
pub const DEFAULT_PRIORITY: i32 = 100;

/// Default `proxy_port` column value
pub const DEFAULT_PROXY_PORT: i32 = 1080;

/// An egress address belonging to one pool
///
/// `pool_type` is not stored on the address row; it is joined in from the
/// owning pool whenever an address is loaded so that proxy-only behaviour can
/// be decided without a second lookup.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: AddressId,
    pub pool_id: PoolId,
    pub pool_type: PoolType,
    pub ipv4: String,
    pub ipv6: Option<String>,
    pub hostname: String,
    /// 0-100, higher is preferred
    pub priority: i32,
    pub proxy_port: i32,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpAddress")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("pool_type", &self.pool_type)
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .field("hostname", &self.hostname)
            .field("priority", &self.priority)
            .field("proxy_port", &self.proxy_port)
            .field("proxy_username", &self.proxy_username)
            .field("proxy_password", &self.proxy_password.as_ref().map(|_| "<redacted>"))
            .field("verified_at", &self.verified_at)
            .field("verification_error", &self.verification_error)
            .finish_non_exhaustive()
    }
}

/// Outcome of the most recent proxy health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Failed,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Failed => "failed",
        })
    }
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.trim().is_empty())
}

impl IpAddress {
    #[must_use]
    pub const fn is_proxy(&self) -> bool {
        self.pool_type.is_proxy()
    }

    /// `true` when the last probe succeeded and no error has been recorded since.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some() && present(self.verification_error.as_ref()).is_none()
    }

    /// Verification state, only meaningful for proxy-pool members.
    #[must_use]
    pub fn verification_status(&self) -> Option<VerificationStatus> {
        if !self.is_proxy() {
            return None;
        }

        Some(if self.is_verified() {
            VerificationStatus::Verified
        } else if present(self.verification_error.as_ref()).is_some() {
            VerificationStatus::Failed
        } else {
            VerificationStatus::Unverified
        })
    }

    /// `ipv4:port` of the proxy endpoint, for proxy-pool members
    #[must_use]
    pub fn proxy_address(&self) -> Option<String> {
        self.is_proxy()
            .then(|| format!("{}:{}", self.ipv4, self.proxy_port))
    }

    /// Username and password, only when both are present
    #[must_use]
    pub fn proxy_credentials(&self) -> Option<(&str, &str)> {
        present(self.proxy_username.as_ref()).zip(present(self.proxy_password.as_ref()))
    }
}

/// Fields accepted when creating or updating an address
///
/// Every field is optional so the same structure serves updates; integers are
/// wide enough to carry out-of-range input through to validation instead of
/// failing at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AddressParams {
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub proxy_port: Option<i64>,
    #[serde(default)]
    pub proxy_username: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
}

impl AddressParams {
    #[must_use]
    pub fn new(ipv4: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            ipv4: Some(ipv4.into()),
            hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn ipv6(mut self, ipv6: impl Into<String>) -> Self {
        self.ipv6 = Some(ipv6.into());
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub const fn proxy_port(mut self, port: i64) -> Self {
        self.proxy_port = Some(port);
        self
    }

    #[must_use]
    pub fn proxy_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(password.into());
        self
    }
}

/// A validated address ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDraft {
    pub pool_id: PoolId,
    pub pool_type: PoolType,
    pub ipv4: String,
    pub ipv6: Option<String>,
    pub hostname: String,
    pub priority: i32,
    pub proxy_port: i32,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
}

/// Verification fields written by the proxy verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_error: Option<String>,
}

impl VerificationRecord {
    #[must_use]
    pub const fn success(at: DateTime<Utc>) -> Self {
        Self {
            verified_at: Some(at),
            verification_error: None,
        }
    }

    #[must_use]
    pub const fn failure(reason: String) -> Self {
        Self {
            verified_at: None,
            verification_error: Some(reason),
        }
    }
}
