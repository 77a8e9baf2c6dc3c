//! Priority-weighted address selection

use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
    seq::IndexedRandom,
};
use tracing::instrument;

use crate::{IpAddress, PoolId, RegistryError, RegistryStore, Result};

/// Pick one address with probability proportional to its priority.
///
/// An address with priority 30 is chosen three times as often as one with
/// priority 10. Addresses with priority 0 are never chosen unless every
/// address in the slice has priority 0, in which case the choice is uniform.
pub fn select_by_priority<'a, R: Rng + ?Sized>(
    addresses: &'a [IpAddress],
    rng: &mut R,
) -> Option<&'a IpAddress> {
    let weights = addresses
        .iter()
        .map(|address| u32::try_from(address.priority).unwrap_or(0));

    match WeightedIndex::new(weights) {
        Ok(index) => addresses.get(index.sample(rng)),
        Err(_) => addresses.choose(rng),
    }
}

/// Load the addresses of `pool_id` and pick one of them by priority.
///
/// Returns `Ok(None)` when the pool has no addresses.
#[instrument(skip(store))]
pub async fn select_for_pool(
    store: &dyn RegistryStore,
    pool_id: PoolId,
) -> Result<Option<IpAddress>> {
    if store.pool(pool_id).await?.is_none() {
        return Err(RegistryError::PoolNotFound(pool_id));
    }

    let addresses = store.addresses_in_pool(pool_id).await?;
    let selected = select_by_priority(&addresses, &mut rand::rng()).cloned();

    tracing::debug!(
        pool_id,
        candidates = addresses.len(),
        selected = selected.as_ref().map(|a| a.id),
        "Selected egress address"
    );

    Ok(selected)
}
