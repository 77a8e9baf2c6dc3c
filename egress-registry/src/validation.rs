//! Write-time validation for pools and addresses.
//!
//! Every backend calls these before it inserts or updates a row. Nothing
//! here coerces invalid input into range; out-of-range values are rejected.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{
    AddressDraft, AddressId, AddressParams, IpAddress, IpPool, PoolType, ValidationError,
    address::{DEFAULT_PRIORITY, DEFAULT_PROXY_PORT},
};

const PRIORITY_RANGE: (i64, i64) = (0, 100);
const PORT_RANGE: (i64, i64) = (1, 65_535);

/// Check the invariants of a pool about to be written.
pub fn pool(name: &str, pool_type: PoolType, default: bool) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::Blank("name"));
    }

    if pool_type.is_proxy() && default {
        return Err(ValidationError::ProxyPoolDefault);
    }

    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn in_range(field: &'static str, value: i64, (min, max): (i64, i64)) -> Result<i32, ValidationError> {
    if !(min..=max).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }

    i32::try_from(value).map_err(|_| ValidationError::OutOfRange {
        field,
        min,
        max,
        value,
    })
}

/// Merge `params` onto `existing` (or an empty record) and validate the result.
///
/// Parameters a pool type does not accept are dropped before merging: proxy
/// pools never carry an IPv6 address, and local pools never carry proxy
/// credentials.
pub fn address(
    pool: &IpPool,
    existing: Option<&IpAddress>,
    params: AddressParams,
) -> Result<AddressDraft, ValidationError> {
    let AddressParams {
        ipv4,
        ipv6,
        hostname,
        priority,
        proxy_port,
        proxy_username,
        proxy_password,
    } = params;

    let ipv4 = ipv4
        .or_else(|| existing.map(|a| a.ipv4.clone()))
        .map(|v| v.trim().to_string());
    let ipv4 = non_blank(ipv4).ok_or(ValidationError::Blank("ipv4"))?;
    let ipv4 = match ipv4.parse::<Ipv4Addr>() {
        Ok(parsed) => parsed.to_string(),
        Err(_) => {
            return Err(ValidationError::InvalidAddress {
                field: "ipv4",
                value: ipv4,
                family: "IPv4",
            });
        }
    };

    let hostname = hostname.or_else(|| existing.map(|a| a.hostname.clone()));
    let hostname = non_blank(hostname).ok_or(ValidationError::Blank("hostname"))?;

    let priority = match priority {
        Some(value) => in_range("priority", value, PRIORITY_RANGE)?,
        None => existing.map_or(DEFAULT_PRIORITY, |a| a.priority),
    };

    let draft = if pool.is_proxy() {
        let proxy_port = match proxy_port {
            Some(value) => in_range("proxy_port", value, PORT_RANGE)?,
            None => existing.map_or(DEFAULT_PROXY_PORT, |a| a.proxy_port),
        };
        if !(PORT_RANGE.0..=PORT_RANGE.1).contains(&i64::from(proxy_port)) {
            return Err(ValidationError::OutOfRange {
                field: "proxy_port",
                min: PORT_RANGE.0,
                max: PORT_RANGE.1,
                value: i64::from(proxy_port),
            });
        }

        AddressDraft {
            pool_id: pool.id,
            pool_type: pool.pool_type,
            ipv4,
            ipv6: None,
            hostname,
            priority,
            proxy_port,
            proxy_username: non_blank(
                proxy_username.or_else(|| existing.and_then(|a| a.proxy_username.clone())),
            ),
            proxy_password: non_blank(
                proxy_password.or_else(|| existing.and_then(|a| a.proxy_password.clone())),
            ),
        }
    } else {
        let ipv6 = match ipv6 {
            Some(value) => non_blank(Some(value.trim().to_string())),
            None => existing.and_then(|a| a.ipv6.clone()),
        };
        // Stored in canonical form so it compares equal to interface addresses.
        let ipv6 = match ipv6 {
            Some(value) => match value.parse::<Ipv6Addr>() {
                Ok(parsed) => Some(parsed.to_string()),
                Err(_) => {
                    return Err(ValidationError::InvalidAddress {
                        field: "ipv6",
                        value,
                        family: "IPv6",
                    });
                }
            },
            None => None,
        };

        AddressDraft {
            pool_id: pool.id,
            pool_type: pool.pool_type,
            ipv4,
            ipv6,
            hostname,
            priority,
            proxy_port: existing.map_or(DEFAULT_PROXY_PORT, |a| a.proxy_port),
            proxy_username: None,
            proxy_password: None,
        }
    };

    Ok(draft)
}

/// Enforce the uniqueness rules against rows already in the registry.
///
/// - `ipv4` is unique within its pool
/// - `ipv6`, when present, is unique across all local-pool addresses
///
/// `id` is the address being updated, if any, so it does not collide with itself.
pub fn unique<'a>(
    draft: &AddressDraft,
    id: Option<AddressId>,
    others: impl IntoIterator<Item = &'a IpAddress>,
) -> Result<(), ValidationError> {
    for other in others {
        if Some(other.id) == id {
            continue;
        }

        if other.pool_id == draft.pool_id && other.ipv4 == draft.ipv4 {
            return Err(ValidationError::Taken {
                field: "ipv4",
                value: draft.ipv4.clone(),
            });
        }

        if let Some(ipv6) = &draft.ipv6
            && !other.is_proxy()
            && other.ipv6.as_ref() == Some(ipv6)
        {
            return Err(ValidationError::Taken {
                field: "ipv6",
                value: ipv6.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;

    fn test_pool(id: i64, pool_type: PoolType) -> IpPool {
        IpPool {
            id,
            uuid: Uuid::new_v4(),
            name: format!("pool-{id}"),
            pool_type,
            default: false,
            created_at: Utc::now(),
        }
    }

    fn stored(id: AddressId, draft: AddressDraft) -> IpAddress {
        IpAddress {
            id,
            pool_id: draft.pool_id,
            pool_type: draft.pool_type,
            ipv4: draft.ipv4,
            ipv6: draft.ipv6,
            hostname: draft.hostname,
            priority: draft.priority,
            proxy_port: draft.proxy_port,
            proxy_username: draft.proxy_username,
            proxy_password: draft.proxy_password,
            verified_at: None,
            verification_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_proxy_pool_cannot_be_default() {
        assert_eq!(
            pool("relays", PoolType::Proxy, true),
            Err(ValidationError::ProxyPoolDefault)
        );
        assert_eq!(pool("relays", PoolType::Proxy, false), Ok(()));
        assert_eq!(pool("primary", PoolType::Local, true), Ok(()));
    }

    #[test]
    fn test_pool_name_required() {
        assert_eq!(
            pool("  ", PoolType::Local, false),
            Err(ValidationError::Blank("name"))
        );
    }

    #[test]
    fn test_defaults_applied() {
        let local = test_pool(1, PoolType::Local);
        let draft = address(&local, None, AddressParams::new("10.0.0.5", "mx1")).unwrap();
        assert_eq!(draft.priority, 100);
        assert_eq!(draft.proxy_port, 1080);
        assert_eq!(draft.ipv6, None);

        let proxy = test_pool(2, PoolType::Proxy);
        let draft = address(&proxy, None, AddressParams::new("203.0.113.7", "relay1")).unwrap();
        assert_eq!(draft.priority, 100);
        assert_eq!(draft.proxy_port, 1080);
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let local = test_pool(1, PoolType::Local);

        for value in [150, -1] {
            let err = address(
                &local,
                None,
                AddressParams::new("10.0.0.5", "mx1").priority(value),
            )
            .unwrap_err();
            assert_eq!(
                err,
                ValidationError::OutOfRange {
                    field: "priority",
                    min: 0,
                    max: 100,
                    value,
                }
            );
        }

        assert!(address(&local, None, AddressParams::new("10.0.0.5", "mx1").priority(0)).is_ok());
        assert!(
            address(&local, None, AddressParams::new("10.0.0.5", "mx1").priority(100)).is_ok()
        );
    }

    #[test]
    fn test_proxy_port_out_of_range_rejected() {
        let proxy = test_pool(2, PoolType::Proxy);
        let err = address(
            &proxy,
            None,
            AddressParams::new("203.0.113.7", "relay1").proxy_port(70_000),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::OutOfRange {
                field: "proxy_port",
                value: 70_000,
                ..
            }
        ));

        let err = address(
            &proxy,
            None,
            AddressParams::new("203.0.113.7", "relay1").proxy_port(0),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn test_local_pool_ignores_proxy_fields() {
        let local = test_pool(1, PoolType::Local);
        let draft = address(
            &local,
            None,
            AddressParams::new("10.0.0.5", "mx1")
                .proxy_port(70_000)
                .proxy_credentials("user", "pass"),
        )
        .unwrap();

        assert_eq!(draft.proxy_port, 1080);
        assert_eq!(draft.proxy_username, None);
        assert_eq!(draft.proxy_password, None);
    }

    #[test]
    fn test_proxy_pool_clears_ipv6() {
        let proxy = test_pool(2, PoolType::Proxy);
        let draft = address(
            &proxy,
            None,
            AddressParams::new("203.0.113.7", "relay1").ipv6("2001:db8::7"),
        )
        .unwrap();
        assert_eq!(draft.ipv6, None);
    }

    #[test]
    fn test_required_fields() {
        let local = test_pool(1, PoolType::Local);
        assert_eq!(
            address(&local, None, AddressParams::default()),
            Err(ValidationError::Blank("ipv4"))
        );
        assert_eq!(
            address(
                &local,
                None,
                AddressParams {
                    ipv4: Some("10.0.0.5".to_string()),
                    ..Default::default()
                }
            ),
            Err(ValidationError::Blank("hostname"))
        );
    }

    #[test]
    fn test_address_families_checked() {
        let local = test_pool(1, PoolType::Local);
        assert!(matches!(
            address(&local, None, AddressParams::new("2001:db8::1", "mx1")),
            Err(ValidationError::InvalidAddress { field: "ipv4", .. })
        ));
        assert!(matches!(
            address(
                &local,
                None,
                AddressParams::new("10.0.0.5", "mx1").ipv6("10.0.0.6")
            ),
            Err(ValidationError::InvalidAddress { field: "ipv6", .. })
        ));
    }

    #[test]
    fn test_update_merges_onto_existing() {
        let proxy = test_pool(2, PoolType::Proxy);
        let original = address(
            &proxy,
            None,
            AddressParams::new("203.0.113.7", "relay1")
                .priority(40)
                .proxy_port(1081)
                .proxy_credentials("relay", "secret"),
        )
        .unwrap();
        let existing = stored(9, original);

        let updated = address(
            &proxy,
            Some(&existing),
            AddressParams {
                priority: Some(60),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(updated.priority, 60);
        assert_eq!(updated.proxy_port, 1081);
        assert_eq!(updated.ipv4, "203.0.113.7");
        assert_eq!(updated.proxy_username.as_deref(), Some("relay"));
    }

    #[test]
    fn test_ipv4_unique_within_pool_only() {
        let first_pool = test_pool(1, PoolType::Local);
        let second_pool = test_pool(2, PoolType::Local);

        let existing = stored(
            1,
            address(&first_pool, None, AddressParams::new("10.0.0.5", "mx1")).unwrap(),
        );

        let same_pool = address(&first_pool, None, AddressParams::new("10.0.0.5", "mx2")).unwrap();
        assert_eq!(
            unique(&same_pool, None, [&existing]),
            Err(ValidationError::Taken {
                field: "ipv4",
                value: "10.0.0.5".to_string(),
            })
        );

        // Updating the row itself is not a collision
        assert_eq!(unique(&same_pool, Some(1), [&existing]), Ok(()));

        let other_pool =
            address(&second_pool, None, AddressParams::new("10.0.0.5", "mx2")).unwrap();
        assert_eq!(unique(&other_pool, None, [&existing]), Ok(()));
    }

    #[test]
    fn test_ipv6_unique_across_local_pools() {
        let first_pool = test_pool(1, PoolType::Local);
        let second_pool = test_pool(2, PoolType::Local);

        let existing = stored(
            1,
            address(
                &first_pool,
                None,
                AddressParams::new("10.0.0.5", "mx1").ipv6("2001:db8::5"),
            )
            .unwrap(),
        );

        let clash = address(
            &second_pool,
            None,
            AddressParams::new("10.0.0.6", "mx2").ipv6("2001:db8::5"),
        )
        .unwrap();
        assert!(matches!(
            unique(&clash, None, [&existing]),
            Err(ValidationError::Taken { field: "ipv6", .. })
        ));
    }

    #[test]
    fn test_addresses_stored_in_canonical_form() {
        let local = test_pool(1, PoolType::Local);
        let draft = address(
            &local,
            None,
            AddressParams::new(" 10.0.0.5 ", "mx1").ipv6("2001:DB8:0:0::5"),
        )
        .unwrap();

        assert_eq!(draft.ipv4, "10.0.0.5");
        assert_eq!(draft.ipv6.as_deref(), Some("2001:db8::5"));

        let existing = stored(1, draft);
        let spelled_differently = address(
            &test_pool(2, PoolType::Local),
            None,
            AddressParams::new("10.0.0.6", "mx2").ipv6("2001:0db8::0005"),
        )
        .unwrap();
        assert!(matches!(
            unique(&spelled_differently, None, [&existing]),
            Err(ValidationError::Taken { field: "ipv6", .. })
        ));
    }
}
