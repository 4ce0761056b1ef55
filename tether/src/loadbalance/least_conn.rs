use std::{collections::HashMap, hash::Hash, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::BoxFuture;
use parking_lot::RwLock;

use super::{error::LoadBalanceError, healthy_addresses, LoadBalance};
use crate::{
    discovery::{Change, Discover, Target},
    net::Address,
};

/// Routes each call to the instance with the fewest calls in flight,
/// according to the picker's own counters.
///
/// The counters are independent of the connection pool's per-transport
/// in-flight accounting: they count calls per *remote instance*, not per
/// local transport. Callers decrement through
/// [`LeastConnectionBalance::on_call_end`] (or the [`LoadBalance::release`]
/// hook) when a call finishes.
pub struct LeastConnectionBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    router: DashMap<K, Arc<Vec<Address>>>,
    active: Arc<RwLock<HashMap<Address, usize>>>,
}

impl<K> LeastConnectionBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep counters only for instances in the live set, adding zero entries
    /// for newcomers.
    fn update_servers(&self, addresses: &[Address]) {
        let mut active = self.active.write();
        active.retain(|addr, _| addresses.contains(addr));
        for addr in addresses {
            active.entry(*addr).or_insert(0);
        }
    }

    /// A call to `addr` finished.
    pub fn on_call_end(&self, addr: &Address) {
        let mut active = self.active.write();
        if let Some(count) = active.get_mut(addr) {
            *count = count.saturating_sub(1);
        }
    }

    #[cfg(test)]
    fn active_count(&self, addr: &Address) -> usize {
        *self.active.read().get(addr).unwrap_or(&0)
    }
}

impl<K> Default for LeastConnectionBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self {
            router: DashMap::new(),
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

pub struct LeastConnectionIterator {
    active: Arc<RwLock<HashMap<Address, usize>>>,
    returned: bool,
}

impl Iterator for LeastConnectionIterator {
    type Item = Address;

    fn next(&mut self) -> Option<Self::Item> {
        if self.returned {
            return None;
        }
        self.returned = true;
        let mut active = self.active.write();
        let addr = active
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(addr, _)| *addr)?;
        if let Some(count) = active.get_mut(&addr) {
            *count += 1;
        }
        Some(addr)
    }
}

impl<D> LoadBalance<D> for LeastConnectionBalance<D::Key>
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
            self.update_servers(&addresses);
            Ok(Box::new(LeastConnectionIterator {
                active: self.active.clone(),
                returned: false,
            }) as Box<dyn Iterator<Item = Address> + Send>)
        })
    }

    fn rebalance(&self, changes: Change<D::Key>) {
        let addresses = healthy_addresses(&changes.all);
        if let Entry::Occupied(mut entry) = self.router.entry(changes.key.clone()) {
            entry.insert(Arc::new(addresses.clone()));
        }
        self.update_servers(&addresses);
    }

    fn release(&self, addr: &Address) {
        self.on_call_end(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscover;

    fn two_instance_discover() -> StaticDiscover {
        StaticDiscover::from(vec![
            "127.0.0.1:8080".parse::<std::net::SocketAddr>().unwrap(),
            "127.0.0.1:8081".parse::<std::net::SocketAddr>().unwrap(),
        ])
    }

    #[tokio::test]
    async fn test_least_connection_balances_and_releases() {
        let lb = LeastConnectionBalance::new();
        let discover = two_instance_discover();
        let target = Target::new("test");

        let mut picker1 = lb.get_picker(&target, &discover).await.unwrap();
        let first = picker1.next().unwrap();

        let mut picker2 = lb.get_picker(&target, &discover).await.unwrap();
        let second = picker2.next().unwrap();

        // With one call in flight on `first`, the second pick avoids it.
        assert_ne!(first, second);

        // Releasing the first makes it least-loaded again.
        lb.on_call_end(&first);
        let mut picker3 = lb.get_picker(&target, &discover).await.unwrap();
        assert_eq!(picker3.next().unwrap(), first);
    }

    #[tokio::test]
    async fn test_release_never_underflows() {
        let lb = LeastConnectionBalance::new();
        let discover = two_instance_discover();
        let target = Target::new("test");

        let mut picker = lb.get_picker(&target, &discover).await.unwrap();
        let addr = picker.next().unwrap();
        lb.on_call_end(&addr);
        lb.on_call_end(&addr);
        assert_eq!(lb.active_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_single_pick_per_iterator() {
        let lb = LeastConnectionBalance::new();
        let discover = two_instance_discover();
        let target = Target::new("test");

        let mut picker = lb.get_picker(&target, &discover).await.unwrap();
        assert!(picker.next().is_some());
        assert!(picker.next().is_none());
    }
}
