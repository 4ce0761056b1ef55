use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{error::LoadBalanceError, healthy_addresses, LoadBalance};
use crate::{
    discovery::{Change, Discover, Instance, Target},
    net::Address,
};

/// Cycles through instances in set order, one step per call.
pub struct RoundRobinBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    router: DashMap<K, Arc<Vec<Address>>>,
    counter: AtomicUsize,
}

impl<K> RoundRobinBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K> Default for RoundRobinBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self {
            router: DashMap::new(),
            counter: AtomicUsize::new(0),
        }
    }
}

pub struct RoundRobinIterator {
    addresses: Arc<Vec<Address>>,
    current: usize,
}

impl Iterator for RoundRobinIterator {
    type Item = Address;

    fn next(&mut self) -> Option<Self::Item> {
        if self.addresses.is_empty() {
            return None;
        }
        let addr = self.addresses[self.current];
        self.current = (self.current + 1) % self.addresses.len();
        Some(addr)
    }
}

impl<D> LoadBalance<D> for RoundRobinBalance<D::Key>
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
            // Guards must not be held across the discover await.
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
            let start = self.counter.fetch_add(1, Ordering::Relaxed) % addresses.len();
            Ok(Box::new(RoundRobinIterator {
                addresses,
                current: start,
            }) as Box<dyn Iterator<Item = Address> + Send>)
        })
    }

    fn rebalance(&self, changes: Change<D::Key>) {
        if let Entry::Occupied(mut entry) = self.router.entry(changes.key.clone()) {
            entry.insert(Arc::new(healthy_addresses(&changes.all)));
        }
        // Membership changed; start the rotation over.
        self.counter.store(0, Ordering::SeqCst);
    }
}

/// Smooth weighted round robin: each step adds every server's weight to its
/// current score, picks the highest score and subtracts the weight total
/// from it. Over `sum(w)` steps every server is picked exactly `w` times.
pub struct WeightedRoundRobinBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    router: DashMap<K, Arc<Mutex<Vec<WeightedServer>>>>,
}

#[derive(Debug, Clone)]
struct WeightedServer {
    address: Address,
    weight: isize,
    current: isize,
}

fn build_servers(instances: &[Arc<Instance>]) -> Vec<WeightedServer> {
    instances
        .iter()
        .filter(|i| i.healthy)
        .map(|i| WeightedServer {
            address: i.address,
            weight: i.weight.max(1) as isize,
            current: 0,
        })
        .collect()
}

fn select_server(servers: &mut [WeightedServer]) -> Option<Address> {
    if servers.is_empty() {
        return None;
    }
    let mut total: isize = 0;
    let mut best: usize = 0;
    let mut best_score = isize::MIN;
    for (i, server) in servers.iter_mut().enumerate() {
        server.current += server.weight;
        total += server.weight;
        if server.current > best_score {
            best_score = server.current;
            best = i;
        }
    }
    servers[best].current -= total;
    Some(servers[best].address)
}

pub struct WeightedRoundRobinIterator {
    servers: Arc<Mutex<Vec<WeightedServer>>>,
}

impl Iterator for WeightedRoundRobinIterator {
    type Item = Address;

    fn next(&mut self) -> Option<Self::Item> {
        select_server(&mut self.servers.lock())
    }
}

impl<K> WeightedRoundRobinBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K> Default for WeightedRoundRobinBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self {
            router: DashMap::new(),
        }
    }
}

impl<D> LoadBalance<D> for WeightedRoundRobinBalance<D::Key>
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
            let servers = match cached {
                Some(servers) => servers,
                None => {
                    let instances = discover
                        .discover(target)
                        .await
                        .map_err(Into::into)?;
                    let servers = Arc::new(Mutex::new(build_servers(&instances)));
                    self.router.insert(key, servers.clone());
                    servers
                }
            };
            if servers.lock().is_empty() {
                return Err(LoadBalanceError::NoAvailableService);
            }
            Ok(Box::new(WeightedRoundRobinIterator { servers })
                as Box<dyn Iterator<Item = Address> + Send>)
        })
    }

    fn rebalance(&self, changes: Change<D::Key>) {
        if let Entry::Occupied(mut entry) = self.router.entry(changes.key.clone()) {
            entry.insert(Arc::new(Mutex::new(build_servers(&changes.all))));
        }
    }
}
