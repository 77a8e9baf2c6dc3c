use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    AddressId, AddressParams, IpAddress, IpPool, NewPool, PoolId, PoolUpdate, Result,
    VerificationRecord,
};

/// Persistence for pools and addresses
///
/// Implementations must run [`crate::validation`] before every create or
/// update, and must refuse to delete an address that queued messages still
/// reference.
#[async_trait]
pub trait RegistryStore: Send + Sync + std::fmt::Debug {
    async fn create_pool(&self, pool: NewPool) -> Result<IpPool>;

    async fn update_pool(&self, id: PoolId, update: PoolUpdate) -> Result<IpPool>;

    /// Fails with `PoolInUse` while the pool still owns addresses.
    async fn delete_pool(&self, id: PoolId) -> Result<()>;

    async fn pool(&self, id: PoolId) -> Result<Option<IpPool>>;

    async fn pool_by_uuid(&self, uuid: Uuid) -> Result<Option<IpPool>>;

    /// All pools, ordered by name
    async fn pools(&self) -> Result<Vec<IpPool>>;

    /// The lowest-id pool flagged as default
    async fn default_pool(&self) -> Result<Option<IpPool>>;

    async fn create_address(&self, pool_id: PoolId, params: AddressParams) -> Result<IpAddress>;

    async fn update_address(&self, id: AddressId, params: AddressParams) -> Result<IpAddress>;

    /// Fails with `AddressInUse` while queued messages reference the address.
    async fn delete_address(&self, id: AddressId) -> Result<()>;

    async fn address(&self, id: AddressId) -> Result<Option<IpAddress>>;

    /// Addresses of one pool, highest priority first
    async fn addresses_in_pool(&self, pool_id: PoolId) -> Result<Vec<IpAddress>>;

    /// Ids of local-pool addresses whose `ipv4` is in `ipv4` or whose `ipv6` is in `ipv6`.
    ///
    /// Matching is exact string equality.
    async fn local_address_ids(&self, ipv4: &[String], ipv6: &[String]) -> Result<Vec<AddressId>>;

    /// Ids of every address in every proxy pool
    async fn proxy_address_ids(&self) -> Result<Vec<AddressId>>;

    /// Persist the outcome of a proxy verification.
    async fn record_verification(&self, id: AddressId, record: VerificationRecord) -> Result<()>;
}
