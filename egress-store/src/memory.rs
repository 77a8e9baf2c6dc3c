use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use egress_queue::{
    ClaimRequest, ClaimToken, DelayedRetry, MessageId, NewQueuedMessage, QueueError, QueueStore,
    QueuedMessage, ReadinessPredicate,
};
use egress_registry::{
    AddressDraft, AddressId, AddressParams, IpAddress, IpPool, NewPool, PoolId, PoolUpdate,
    RegistryError, RegistryStore, VerificationRecord, validation,
};
use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<PoolId, IpPool>,
    addresses: BTreeMap<AddressId, IpAddress>,
    messages: BTreeMap<MessageId, QueuedMessage>,
    last_pool_id: PoolId,
    last_address_id: AddressId,
    last_message_id: MessageId,
}

impl State {
    fn pool(&self, id: PoolId) -> Result<&IpPool, RegistryError> {
        self.pools.get(&id).ok_or(RegistryError::PoolNotFound(id))
    }

    fn references(&self, address_id: AddressId) -> u64 {
        self.messages
            .values()
            .filter(|message| message.ip_address_id == Some(address_id))
            .count()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

fn apply_draft(address: &mut IpAddress, draft: AddressDraft) {
    address.pool_id = draft.pool_id;
    address.pool_type = draft.pool_type;
    address.ipv4 = draft.ipv4;
    address.ipv6 = draft.ipv6;
    address.hostname = draft.hostname;
    address.priority = draft.priority;
    address.proxy_port = draft.proxy_port;
    address.proxy_username = draft.proxy_username;
    address.proxy_password = draft.proxy_password;
}

/// Registry and queue held in process memory
///
/// All state sits behind a single lock. A claim takes the write lock for its
/// whole select-and-stamp pass, so concurrent claimers sharing one store are
/// serialised and never stamp the same row. The store is shared by cloning.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    readiness: Arc<dyn ReadinessPredicate>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_readiness(Arc::new(DelayedRetry))
    }

    /// A store that asks `readiness` whether a row is due, instead of
    /// comparing `retry_after` with the claim time.
    #[must_use]
    pub fn with_readiness(readiness: Arc<dyn ReadinessPredicate>) -> Self {
        Self {
            state: Arc::default(),
            readiness,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn create_pool(&self, pool: NewPool) -> egress_registry::Result<IpPool> {
        validation::pool(&pool.name, pool.pool_type, pool.default)?;

        let mut state = self.state.write();
        state.last_pool_id += 1;

        let pool = IpPool {
            id: state.last_pool_id,
            uuid: Uuid::new_v4(),
            name: pool.name.trim().to_string(),
            pool_type: pool.pool_type,
            default: pool.default,
            created_at: Utc::now(),
        };
        state.pools.insert(pool.id, pool.clone());

        Ok(pool)
    }

    async fn update_pool(
        &self,
        id: PoolId,
        update: PoolUpdate,
    ) -> egress_registry::Result<IpPool> {
        let mut state = self.state.write();

        let mut updated = update.apply(state.pool(id)?);
        validation::pool(&updated.name, updated.pool_type, updated.default)?;
        updated.name = updated.name.trim().to_string();

        state.pools.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_pool(&self, id: PoolId) -> egress_registry::Result<()> {
        let mut state = self.state.write();
        state.pool(id)?;

        let addresses = state
            .addresses
            .values()
            .filter(|address| address.pool_id == id)
            .count();
        if addresses > 0 {
            return Err(RegistryError::PoolInUse { id, addresses });
        }

        state.pools.remove(&id);
        Ok(())
    }

    async fn pool(&self, id: PoolId) -> egress_registry::Result<Option<IpPool>> {
        Ok(self.state.read().pools.get(&id).cloned())
    }

    async fn pool_by_uuid(&self, uuid: Uuid) -> egress_registry::Result<Option<IpPool>> {
        Ok(self
            .state
            .read()
            .pools
            .values()
            .find(|pool| pool.uuid == uuid)
            .cloned())
    }

    async fn pools(&self) -> egress_registry::Result<Vec<IpPool>> {
        let mut pools: Vec<_> = self.state.read().pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(pools)
    }

    async fn default_pool(&self) -> egress_registry::Result<Option<IpPool>> {
        Ok(self
            .state
            .read()
            .pools
            .values()
            .find(|pool| pool.default)
            .cloned())
    }

    async fn create_address(
        &self,
        pool_id: PoolId,
        params: AddressParams,
    ) -> egress_registry::Result<IpAddress> {
        let mut state = self.state.write();

        let draft = validation::address(state.pool(pool_id)?, None, params)?;
        validation::unique(&draft, None, state.addresses.values())?;

        state.last_address_id += 1;
        let address = IpAddress {
            id: state.last_address_id,
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
        };
        state.addresses.insert(address.id, address.clone());

        Ok(address)
    }

    async fn update_address(
        &self,
        id: AddressId,
        params: AddressParams,
    ) -> egress_registry::Result<IpAddress> {
        let mut state = self.state.write();

        let existing = state
            .addresses
            .get(&id)
            .cloned()
            .ok_or(RegistryError::AddressNotFound(id))?;
        let draft = validation::address(state.pool(existing.pool_id)?, Some(&existing), params)?;
        validation::unique(&draft, Some(id), state.addresses.values())?;

        let mut updated = existing;
        apply_draft(&mut updated, draft);
        state.addresses.insert(id, updated.clone());

        Ok(updated)
    }

    async fn delete_address(&self, id: AddressId) -> egress_registry::Result<()> {
        let mut state = self.state.write();

        if !state.addresses.contains_key(&id) {
            return Err(RegistryError::AddressNotFound(id));
        }

        let queued = state.references(id);
        if queued > 0 {
            return Err(RegistryError::AddressInUse { id, queued });
        }

        state.addresses.remove(&id);
        Ok(())
    }

    async fn address(&self, id: AddressId) -> egress_registry::Result<Option<IpAddress>> {
        Ok(self.state.read().addresses.get(&id).cloned())
    }

    async fn addresses_in_pool(
        &self,
        pool_id: PoolId,
    ) -> egress_registry::Result<Vec<IpAddress>> {
        let mut addresses: Vec<_> = self
            .state
            .read()
            .addresses
            .values()
            .filter(|address| address.pool_id == pool_id)
            .cloned()
            .collect();
        addresses.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(addresses)
    }

    async fn local_address_ids(
        &self,
        ipv4: &[String],
        ipv6: &[String],
    ) -> egress_registry::Result<Vec<AddressId>> {
        Ok(self
            .state
            .read()
            .addresses
            .values()
            .filter(|address| !address.is_proxy())
            .filter(|address| {
                ipv4.contains(&address.ipv4)
                    || address.ipv6.as_ref().is_some_and(|v6| ipv6.contains(v6))
            })
            .map(|address| address.id)
            .collect())
    }

    async fn proxy_address_ids(&self) -> egress_registry::Result<Vec<AddressId>> {
        Ok(self
            .state
            .read()
            .addresses
            .values()
            .filter(|address| address.is_proxy())
            .map(|address| address.id)
            .collect())
    }

    async fn record_verification(
        &self,
        id: AddressId,
        record: VerificationRecord,
    ) -> egress_registry::Result<()> {
        let mut state = self.state.write();
        let address = state
            .addresses
            .get_mut(&id)
            .ok_or(RegistryError::AddressNotFound(id))?;

        address.verified_at = record.verified_at;
        address.verification_error = record.verification_error;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, message: NewQueuedMessage) -> egress_queue::Result<QueuedMessage> {
        let mut state = self.state.write();

        if let Some(address_id) = message.ip_address_id
            && !state.addresses.contains_key(&address_id)
        {
            return Err(RegistryError::AddressNotFound(address_id).into());
        }

        state.last_message_id += 1;
        let row = QueuedMessage {
            id: state.last_message_id,
            message_id: message.message_id,
            domain: message.domain,
            ip_address_id: message.ip_address_id,
            attempts: 0,
            retry_after: message.retry_after,
            locked_by: None,
            locked_at: None,
            created_at: Utc::now(),
        };
        state.messages.insert(row.id, row.clone());

        Ok(row)
    }

    async fn get(&self, id: MessageId) -> egress_queue::Result<Option<QueuedMessage>> {
        Ok(self.state.read().messages.get(&id).cloned())
    }

    async fn claim(&self, request: &ClaimRequest<'_>) -> egress_queue::Result<u64> {
        let mut state = self.state.write();
        let mut touched = 0;

        for row in state
            .messages
            .values_mut()
            .filter(|row| {
                row.is_claimable(request.eligible, self.readiness.is_ready(row, request.now))
            })
            .take(request.limit)
        {
            row.locked_by = Some(request.token.locker().to_string());
            row.locked_at = Some(request.token.locked_at());
            touched += 1;
        }

        Ok(touched)
    }

    async fn claimed(&self, token: &ClaimToken) -> egress_queue::Result<Vec<QueuedMessage>> {
        Ok(self
            .state
            .read()
            .messages
            .values()
            .filter(|row| row.is_claimed_by(token))
            .cloned()
            .collect())
    }

    async fn release(
        &self,
        id: MessageId,
        retry_after: Option<chrono::DateTime<Utc>>,
    ) -> egress_queue::Result<()> {
        let mut state = self.state.write();
        let row = state
            .messages
            .get_mut(&id)
            .ok_or(QueueError::MessageNotFound(id))?;

        row.locked_by = None;
        row.locked_at = None;
        if let Some(at) = retry_after {
            row.retry_after = Some(at);
            row.attempts += 1;
        }

        Ok(())
    }

    async fn remove(&self, id: MessageId) -> egress_queue::Result<()> {
        self.state
            .write()
            .messages
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::MessageNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use egress_queue::EligibleAddresses;
    use egress_registry::{PoolType, ValidationError};
    use pretty_assertions::assert_eq;

    use super::*;

    async fn local_pool(store: &MemoryStore) -> IpPool {
        store
            .create_pool(NewPool::new("Local", PoolType::Local))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pool_ids_and_listing() {
        let store = MemoryStore::new();
        let b = store
            .create_pool(NewPool::new("b-pool", PoolType::Local).default_pool(true))
            .await
            .unwrap();
        let a = store
            .create_pool(NewPool::new("a-pool", PoolType::Proxy))
            .await
            .unwrap();

        assert_eq!((b.id, a.id), (1, 2));
        assert_eq!(
            store
                .pools()
                .await
                .unwrap()
                .into_iter()
                .map(|pool| pool.name)
                .collect::<Vec<_>>(),
            vec!["a-pool", "b-pool"]
        );
        assert_eq!(store.default_pool().await.unwrap(), Some(b.clone()));
        assert_eq!(store.pool_by_uuid(a.uuid).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_update_pool_revalidates() {
        let store = MemoryStore::new();
        let proxy = store
            .create_pool(NewPool::new("Proxies", PoolType::Proxy))
            .await
            .unwrap();

        let err = store
            .update_pool(
                proxy.id,
                PoolUpdate {
                    default: Some(true),
                    ..PoolUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::ProxyPoolDefault)
        ));
        assert!(!store.pool(proxy.id).await.unwrap().unwrap().default);

        let renamed = store
            .update_pool(
                proxy.id,
                PoolUpdate {
                    name: Some("Residential".to_string()),
                    ..PoolUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Residential");
        assert_eq!(renamed.uuid, proxy.uuid);
    }

    #[tokio::test]
    async fn test_update_keeps_verification_state() {
        let store = MemoryStore::new();
        let pool = store
            .create_pool(NewPool::new("Proxies", PoolType::Proxy))
            .await
            .unwrap();
        let address = store
            .create_address(pool.id, AddressParams::new("192.0.2.10", "p1.example.com"))
            .await
            .unwrap();

        let at = Utc::now();
        store
            .record_verification(address.id, VerificationRecord::success(at))
            .await
            .unwrap();

        let updated = store
            .update_address(address.id, AddressParams::default().priority(20))
            .await
            .unwrap();
        assert_eq!(updated.priority, 20);
        assert_eq!(updated.ipv4, "192.0.2.10");
        assert_eq!(updated.verified_at, Some(at));
    }

    #[tokio::test]
    async fn test_enqueue_requires_known_address() {
        let store = MemoryStore::new();
        let err = store
            .enqueue(NewQueuedMessage::new(1, "example.com").via(42))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Registry(RegistryError::AddressNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_delete_address_rejected_while_queued() {
        let store = MemoryStore::new();
        let pool = local_pool(&store).await;
        let address = store
            .create_address(pool.id, AddressParams::new("10.0.0.5", "mx1.example.com"))
            .await
            .unwrap();
        let row = store
            .enqueue(NewQueuedMessage::new(1, "example.com").via(address.id))
            .await
            .unwrap();

        let err = store.delete_address(address.id).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::AddressInUse { id, queued: 1 } if id == address.id
        ));

        store.remove(row.id).await.unwrap();
        store.delete_address(address.id).await.unwrap();
        assert_eq!(store.address(address.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_with_retry_defers_row() {
        let store = MemoryStore::new();
        let row = store
            .enqueue(NewQueuedMessage::new(1, "example.com"))
            .await
            .unwrap();

        let token = ClaimToken::generate("mx1");
        let eligible = EligibleAddresses::default();
        let now = Utc::now();
        let request = ClaimRequest {
            token: &token,
            eligible: &eligible,
            limit: 10,
            now,
        };
        assert_eq!(store.claim(&request).await.unwrap(), 1);

        store
            .release(row.id, Some(now + chrono::Duration::minutes(5)))
            .await
            .unwrap();
        let released = store.get(row.id).await.unwrap().unwrap();
        assert!(!released.is_locked());
        assert_eq!(released.attempts, 1);

        let retry = ClaimToken::generate("mx1");
        let request = ClaimRequest {
            token: &retry,
            eligible: &eligible,
            limit: 10,
            now,
        };
        assert_eq!(store.claim(&request).await.unwrap(), 0);

        let later = ClaimRequest {
            now: now + chrono::Duration::minutes(6),
            ..request
        };
        assert_eq!(store.claim(&later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_message() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.remove(7).await,
            Err(QueueError::MessageNotFound(7))
        ));
    }
}
