//! Administrative views over the registry

use std::fmt;

use egress_registry::{IpAddress, IpPool, RegistryStore};

/// A pool with its addresses, highest priority first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolListing {
    pub pool: IpPool,
    pub addresses: Vec<IpAddress>,
}

/// Every pool in name order, with its members.
///
/// # Errors
///
/// Fails if the registry cannot be read.
pub async fn list_pools(
    registry: &dyn RegistryStore,
) -> egress_registry::Result<Vec<PoolListing>> {
    let mut listings = Vec::new();

    for pool in registry.pools().await? {
        let addresses = registry.addresses_in_pool(pool.id).await?;
        listings.push(PoolListing { pool, addresses });
    }

    Ok(listings)
}

impl fmt::Display for PoolListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = &self.pool;
        write!(f, "#{} {} ({}", pool.id, pool.name, pool.pool_type.as_str())?;
        if pool.default {
            f.write_str(", default")?;
        }
        write!(f, ") {}", pool.uuid)?;

        if self.addresses.is_empty() {
            return f.write_str("\n  (no addresses)");
        }

        for address in &self.addresses {
            write!(
                f,
                "\n  #{} {} {} priority={}",
                address.id, address.ipv4, address.hostname, address.priority
            )?;
            if let Some(ipv6) = &address.ipv6 {
                write!(f, " ipv6={ipv6}")?;
            }
            if let Some(proxy) = address.proxy_address() {
                write!(f, " proxy={proxy}")?;
            }
            if let Some(status) = address.verification_status() {
                write!(f, " status={status}")?;
            }
            if let Some(error) = &address.verification_error {
                write!(f, " error={error:?}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use egress_registry::PoolType;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_pool_listing() {
        let listing = PoolListing {
            pool: IpPool {
                id: 1,
                uuid: Default::default(),
                name: "Outbound".to_string(),
                pool_type: PoolType::Local,
                default: true,
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            },
            addresses: Vec::new(),
        };

        assert_eq!(
            listing.to_string(),
            "#1 Outbound (local, default) 00000000-0000-0000-0000-000000000000\n  (no addresses)"
        );
    }
}
