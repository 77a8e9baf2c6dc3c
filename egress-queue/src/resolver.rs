//! Host address resolution
//!
//! Maps the addresses bound on this host's interfaces to registry entries.
//! A worker may deliver through a local-pool address only if that exact
//! address is bound on its host, and through any proxy-pool address from
//! anywhere.

use std::{
    collections::BTreeSet,
    io,
    net::{IpAddr, Ipv6Addr},
    sync::Arc,
};

use egress_registry::{AddressId, RegistryStore};
use tracing::instrument;

use crate::{QueueError, Result};

/// Source of the addresses bound on this host
pub trait AddressLister: Send + Sync + std::fmt::Debug {
    fn list(&self) -> io::Result<Vec<IpAddr>>;
}

/// Reads the live network interfaces of the running host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAddressLister;

impl AddressLister for SystemAddressLister {
    fn list(&self) -> io::Result<Vec<IpAddr>> {
        Ok(if_addrs::get_if_addrs()?
            .into_iter()
            .map(|interface| interface.ip())
            .collect())
    }
}

/// A fixed address list, for configuration overrides and tests
#[derive(Debug, Clone, Default)]
pub struct StaticAddressLister(pub Vec<IpAddr>);

impl AddressLister for StaticAddressLister {
    fn list(&self) -> io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

const fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Addresses that can never be an egress address.
///
/// IPv4 loopback (`127.0.0.0/8`) and unspecified, IPv6 link-local
/// (`fe80::/10`), and any IPv6 address in the `::/16` block, which covers
/// loopback, unspecified and the IPv4-mapped forms.
#[must_use]
pub const fn is_excluded(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified(),
        IpAddr::V6(v6) => v6.segments()[0] == 0 || is_link_local_v6(v6),
    }
}

/// This host's usable addresses, in textual form, split by family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAddresses {
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

impl HostAddresses {
    /// Drop excluded addresses and partition the rest by family.
    pub fn from_interfaces(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut ipv4 = BTreeSet::new();
        let mut ipv6 = BTreeSet::new();

        for ip in addresses.into_iter().filter(|ip| !is_excluded(ip)) {
            match ip {
                IpAddr::V4(_) => ipv4.insert(ip.to_string()),
                IpAddr::V6(_) => ipv6.insert(ip.to_string()),
            };
        }

        Self {
            ipv4: ipv4.into_iter().collect(),
            ipv6: ipv6.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }
}

/// Registry addresses a worker on this host may claim messages for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibleAddresses(BTreeSet<AddressId>);

impl EligibleAddresses {
    #[must_use]
    pub fn contains(&self, id: AddressId) -> bool {
        self.0.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = AddressId> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<AddressId> {
        self.iter().collect()
    }
}

impl FromIterator<AddressId> for EligibleAddresses {
    fn from_iter<T: IntoIterator<Item = AddressId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Works out, once per claim cycle, which registry addresses this host serves
#[derive(Debug, Clone)]
pub struct HostAddressResolver {
    lister: Arc<dyn AddressLister>,
    registry: Arc<dyn RegistryStore>,
}

impl HostAddressResolver {
    #[must_use]
    pub fn new(lister: Arc<dyn AddressLister>, registry: Arc<dyn RegistryStore>) -> Self {
        Self { lister, registry }
    }

    /// Enumerate this host's interfaces and resolve them against the registry.
    pub async fn eligible_address_ids(&self) -> Result<EligibleAddresses> {
        let interfaces = self.lister.list().map_err(QueueError::AddressList)?;
        self.resolve(&HostAddresses::from_interfaces(interfaces))
            .await
    }

    /// Local-pool addresses matching `host`, plus every proxy-pool address.
    #[instrument(skip(self), fields(ipv4 = host.ipv4.len(), ipv6 = host.ipv6.len()))]
    pub async fn resolve(&self, host: &HostAddresses) -> Result<EligibleAddresses> {
        let local = if host.is_empty() {
            Vec::new()
        } else {
            self.registry
                .local_address_ids(&host.ipv4, &host.ipv6)
                .await?
        };
        let proxy = self.registry.proxy_address_ids().await?;

        tracing::debug!(
            local = local.len(),
            proxy = proxy.len(),
            "Resolved eligible egress addresses"
        );

        Ok(local.into_iter().chain(proxy).collect())
    }
}
