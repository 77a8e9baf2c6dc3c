use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ValidationError;

pub type PoolId = i64;

/// What kind of egress a pool provides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Addresses bound directly on worker hosts
    #[default]
    Local,
    /// Remote SOCKS5 proxies, reachable from any host
    Proxy,
}

impl PoolType {
    /// The value persisted in the `pool_type` column
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Proxy => "proxy",
        }
    }

    #[must_use]
    pub const fn is_proxy(self) -> bool {
        matches!(self, Self::Proxy)
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "proxy" => Ok(Self::Proxy),
            other => Err(ValidationError::UnknownPoolType(other.to_string())),
        }
    }
}

/// A named group of egress addresses of a single type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    pub id: PoolId,
    /// Public identifier used by administrative tooling
    pub uuid: Uuid,
    pub name: String,
    pub pool_type: PoolType,
    /// Whether servers without an explicit pool use this one
    pub default: bool,
    pub created_at: DateTime<Utc>,
}

impl IpPool {
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.pool_type, PoolType::Local)
    }

    #[must_use]
    pub const fn is_proxy(&self) -> bool {
        self.pool_type.is_proxy()
    }
}

/// Parameters for creating a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewPool {
    pub name: String,
    #[serde(default)]
    pub pool_type: PoolType,
    #[serde(default)]
    pub default: bool,
}

impl NewPool {
    #[must_use]
    pub fn new(name: impl Into<String>, pool_type: PoolType) -> Self {
        Self {
            name: name.into(),
            pool_type,
            default: false,
        }
    }

    #[must_use]
    pub const fn default_pool(mut self, default: bool) -> Self {
        self.default = default;
        self
    }
}

/// Changes to an existing pool. The pool type is fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PoolUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub default: Option<bool>,
}

impl PoolUpdate {
    /// The pool as it would look with this update applied.
    #[must_use]
    pub fn apply(&self, pool: &IpPool) -> IpPool {
        let mut updated = pool.clone();
        if let Some(name) = &self.name {
            updated.name.clone_from(name);
        }
        if let Some(default) = self.default {
            updated.default = default;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_type_round_trips_column_value() {
        for pool_type in [PoolType::Local, PoolType::Proxy] {
            assert_eq!(pool_type.as_str().parse::<PoolType>(), Ok(pool_type));
        }
        assert_eq!(
            "socks".parse::<PoolType>(),
            Err(ValidationError::UnknownPoolType("socks".to_string()))
        );
    }

    #[test]
    fn test_update_keeps_untouched_fields() {
        let pool = IpPool {
            id: 1,
            uuid: Uuid::new_v4(),
            name: "primary".to_string(),
            pool_type: PoolType::Local,
            default: false,
            created_at: Utc::now(),
        };

        let updated = PoolUpdate {
            default: Some(true),
            ..Default::default()
        }
        .apply(&pool);

        assert_eq!(updated.name, "primary");
        assert!(updated.default);
        assert_eq!(updated.uuid, pool.uuid);
    }
}
