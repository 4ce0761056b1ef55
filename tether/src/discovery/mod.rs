//! Service discovery abstractions.
//!
//! A [`Discover`] turns a [`Target`] into the current set of [`Instance`]s
//! and, when watch-driven, broadcasts [`Change`]s to its consumer. Instances
//! carry a stable `key` (the full store key they were advertised under) so
//! that updates and removals reconcile by identity rather than by address.

pub mod etcd;
pub mod target;

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    hash::Hash,
    net::SocketAddr,
    sync::Arc,
};

use async_broadcast::Receiver;
use faststr::FastStr;

pub use etcd::EtcdDiscover;
pub use target::Target;

use crate::{loadbalance::error::LoadBalanceError, net::Address};

/// [`Instance`] contains information of an instance from the target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Stable identity: the full store key the instance is advertised under.
    pub key: FastStr,
    pub address: Address,
    pub weight: u32,
    pub healthy: bool,
    pub tags: HashMap<FastStr, FastStr>,
}

/// The most basic trait for service discovery.
pub trait Discover: Send + Sync + 'static {
    /// `Key` identifies a group of instances, such as the service name.
    type Key: Hash + PartialEq + Eq + Send + Sync + Clone + 'static;
    type Error: Into<LoadBalanceError>;

    /// Request the current instance set for a target.
    fn discover<'s>(
        &'s self,
        target: &'s Target,
    ) -> impl Future<Output = Result<Vec<Arc<Instance>>, Self::Error>> + Send;

    /// A key suitable for caching the result of [`Discover::discover`].
    fn key(&self, target: &Target) -> Self::Key;

    /// Subscription to instance-set changes; `None` for static discovers.
    fn watch(&self) -> Option<Receiver<Change<Self::Key>>>;
}

/// The difference between two consecutive discovery results.
///
/// Load balancers cache discovery results; watch-driven discovers dispatch a
/// [`Change`] whenever the set changes so caches can be replaced wholesale
/// (`all`) or patched (`added`/`updated`/`removed`).
#[derive(Debug, Clone)]
pub struct Change<K> {
    pub key: K,
    pub all: Vec<Arc<Instance>>,
    pub added: Vec<Arc<Instance>>,
    pub updated: Vec<Arc<Instance>>,
    pub removed: Vec<Arc<Instance>>,
}

/// Diff two instance lists by stable key.
///
/// Same key with different contents counts as updated. The bool indicates
/// whether anything changed at all; callers should skip dispatch when it is
/// false.
pub fn diff_keyed<K>(key: K, prev: &[Arc<Instance>], next: Vec<Arc<Instance>>) -> (Change<K>, bool)
where
    K: Hash + PartialEq + Eq + Send + Sync + 'static,
{
    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut removed = Vec::new();

    let prev_by_key: HashMap<&FastStr, &Arc<Instance>> =
        prev.iter().map(|i| (&i.key, i)).collect();
    let next_keys: HashSet<&FastStr> = next.iter().map(|i| &i.key).collect();

    for instance in &next {
        match prev_by_key.get(&instance.key) {
            None => added.push(instance.clone()),
            Some(old) if ***old != **instance => updated.push(instance.clone()),
            _ => {}
        }
    }
    for instance in prev {
        if !next_keys.contains(&instance.key) {
            removed.push(instance.clone());
        }
    }

    let changed = !added.is_empty() || !updated.is_empty() || !removed.is_empty();

    (
        Change {
            key,
            all: next,
            added,
            updated,
            removed,
        },
        changed,
    )
}

/// A [`Discover`] over a fixed instance list.
#[derive(Clone)]
pub struct StaticDiscover {
    instances: Vec<Arc<Instance>>,
}

impl StaticDiscover {
    pub fn new(instances: Vec<Arc<Instance>>) -> Self {
        Self { instances }
    }
}

impl From<Vec<SocketAddr>> for StaticDiscover {
    fn from(addrs: Vec<SocketAddr>) -> Self {
        let instances = addrs
            .into_iter()
            .map(|addr| {
                Arc::new(Instance {
                    key: FastStr::from(addr.to_string()),
                    address: Address::Ip(addr),
                    weight: 1,
                    healthy: true,
                    tags: Default::default(),
                })
            })
            .collect();
        Self { instances }
    }
}

impl From<Vec<(SocketAddr, u32)>> for StaticDiscover {
    fn from(addrs: Vec<(SocketAddr, u32)>) -> Self {
        let instances = addrs
            .into_iter()
            .map(|(addr, weight)| {
                Arc::new(Instance {
                    key: FastStr::from(addr.to_string()),
                    address: Address::Ip(addr),
                    weight,
                    healthy: true,
                    tags: Default::default(),
                })
            })
            .collect();
        Self { instances }
    }
}

impl Discover for StaticDiscover {
    type Key = ();
    type Error = LoadBalanceError;

    async fn discover<'s>(&'s self, _: &'s Target) -> Result<Vec<Arc<Instance>>, Self::Error> {
        Ok(self.instances.clone())
    }

    fn key(&self, _: &Target) -> Self::Key {}

    fn watch(&self) -> Option<Receiver<Change<Self::Key>>> {
        None
    }
}
