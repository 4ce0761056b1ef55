//! Per-RPC instance selection over discovered instance sets.
//!
//! A [`LoadBalance`] caches the discovered set per service key and hands out
//! one picker per call; watch-driven discovers feed [`LoadBalance::rebalance`]
//! to replace the cache. Instances advertising `healthy=false` are never
//! routed to.

pub mod consistent_hash;
pub mod error;
pub mod ip_hash;
pub mod least_conn;
pub mod random;
pub mod round_robin;

use std::sync::Arc;

use faststr::FastStr;
use futures::future::BoxFuture;

pub use consistent_hash::ConsistentHashBalance;
pub use ip_hash::IpHashBalance;
pub use least_conn::LeastConnectionBalance;
pub use random::RandomBalance;
pub use round_robin::{RoundRobinBalance, WeightedRoundRobinBalance};

use self::error::LoadBalanceError;
use crate::{
    discovery::{Change, Discover, Instance, Target},
    net::Address,
};

/// Per-request routing key for [`ConsistentHashBalance`], carried in the
/// task-local [`metainfo`] (e.g. a user id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestKey(pub FastStr);

/// Caller IP for [`IpHashBalance`], carried in the task-local [`metainfo`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIp(pub FastStr);

/// [`LoadBalance`] promises the feature of the load balance policy.
pub trait LoadBalance<D>: Send + Sync + 'static
where
    D: Discover,
{
    /// Get an address iterator for one call; iteration order is the retry
    /// order.
    fn get_picker<'future>(
        &'future self,
        target: &'future Target,
        discover: &'future D,
    ) -> BoxFuture<
        'future,
        Result<Box<dyn Iterator<Item = Address> + Send>, LoadBalanceError>,
    >;

    /// Callback used in service discovering subscription.
    fn rebalance(&self, changes: Change<D::Key>);

    /// Completion hook for pickers that track per-call state; the default
    /// has nothing to track.
    fn release(&self, _addr: &Address) {}
}

/// 64-bit FNV-1a over raw bytes, the stable mixer shared by the hashing
/// pickers.
pub(crate) fn fnv1a_64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Addresses of routable (healthy) instances, in set order.
pub(crate) fn healthy_addresses(instances: &[Arc<Instance>]) -> Vec<Address> {
    instances
        .iter()
        .filter(|i| i.healthy)
        .map(|i| i.address)
        .collect()
}

#[derive(Clone, Debug)]
pub enum LoadBalanceStrategy {
    RoundRobin,
    Random,
    WeightedRoundRobin,
    LeastConnection,
    ConsistentHash,
    IpHash,
}

pub struct LoadBalanceFactory;

impl LoadBalanceFactory {
    pub fn create<D: Discover>(strategy: LoadBalanceStrategy) -> Box<dyn LoadBalance<D>> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => Box::new(RoundRobinBalance::<D::Key>::new()),
            LoadBalanceStrategy::Random => Box::new(RandomBalance::<D::Key>::new()),
            LoadBalanceStrategy::WeightedRoundRobin => {
                Box::new(WeightedRoundRobinBalance::<D::Key>::new())
            }
            LoadBalanceStrategy::LeastConnection => {
                Box::new(LeastConnectionBalance::<D::Key>::new())
            }
            LoadBalanceStrategy::ConsistentHash => {
                Box::new(ConsistentHashBalance::<D::Key>::new())
            }
            LoadBalanceStrategy::IpHash => Box::new(IpHashBalance::<D::Key>::new()),
        }
    }
}
