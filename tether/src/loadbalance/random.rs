use std::{hash::Hash, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, RngCore, SeedableRng};

use super::{error::LoadBalanceError, healthy_addresses, LoadBalance};
use crate::{
    discovery::{Change, Discover, Target},
    net::Address,
};

/// Uniform random selection with a per-picker PRNG, so concurrent callers
/// never contend on a global generator.
pub struct RandomBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    router: DashMap<K, Arc<Vec<Address>>>,
    rng: Mutex<SmallRng>,
}

impl<K> RandomBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K> Default for RandomBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self {
            router: DashMap::new(),
            rng: Mutex::new(SmallRng::from_os_rng()),
        }
    }
}

/// Draws without repetition so retries never hit the same instance twice.
pub struct RandomIterator {
    remaining: Vec<Address>,
    rng: SmallRng,
}

impl Iterator for RandomIterator {
    type Item = Address;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..self.remaining.len());
        Some(self.remaining.swap_remove(index))
    }
}

impl<D> LoadBalance<D> for RandomBalance<D::Key>
where
    D: Discover,
{
    fn get_picker<'future>(
        &'future self,
        target: &'future Target,
        discover: &'future D,
    ) -> BoxFuture<'future, Result<Box<dyn Iterator<Item = Address> + Send>, LoadBalanceError>>
    {
        Box::pin(async move {
            let key = discover.key(target);
            let cached = self.router.get(&key).map(|e| e.value().clone());
            let addresses = match cached {
                Some(addresses) => addresses,
                None => {
                    let instances = discover
                        .discover(target)
                        .await
                        .map_err(Into::into)?;
                    let addresses = Arc::new(healthy_addresses(&instances));
                    self.router.insert(key, addresses.clone());
                    addresses
                }
            };
            if addresses.is_empty() {
                return Err(LoadBalanceError::NoAvailableService);
            }
            let seed = self.rng.lock().next_u64();
            Ok(Box::new(RandomIterator {
                remaining: addresses.as_ref().clone(),
                rng: SmallRng::seed_from_u64(seed),
            }) as Box<dyn Iterator<Item = Address> + Send>)
        })
    }

    fn rebalance(&self, changes: Change<D::Key>) {
        if let Entry::Occupied(mut entry) = self.router.entry(changes.key.clone()) {
            entry.insert(Arc::new(healthy_addresses(&changes.all)));
        }
    }
}
