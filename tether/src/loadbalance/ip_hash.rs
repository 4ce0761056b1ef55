use std::{hash::Hash, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::BoxFuture;

use super::{
    consistent_hash::OffsetIterator, error::LoadBalanceError, fnv1a_64, healthy_addresses,
    CallerIp, LoadBalance,
};
use crate::{
    discovery::{Change, Discover, Target},
    net::Address,
};

/// Session affinity by caller address: `hash(ip) mod N`.
///
/// Unlike the consistent-hash picker there is no default to fall back to;
/// selection without a [`CallerIp`] is refused.
pub struct IpHashBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    router: DashMap<K, Arc<Vec<Address>>>,
}

impl<K> IpHashBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K> Default for IpHashBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self {
            router: DashMap::new(),
        }
    }
}

impl<D> LoadBalance<D> for IpHashBalance<D::Key>
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
            let caller_ip = metainfo::METAINFO
                .try_with(|m| m.borrow().get::<CallerIp>().cloned())
                .ok()
                .flatten()
                .ok_or(LoadBalanceError::MissingCallerIp)?;

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

            let start = (fnv1a_64(caller_ip.0.as_bytes()) % addresses.len() as u64) as usize;
            Ok(Box::new(OffsetIterator::new(addresses, start))
                as Box<dyn Iterator<Item = Address> + Send>)
        })
    }

    fn rebalance(&self, changes: Change<D::Key>) {
        if let Entry::Occupied(mut entry) = self.router.entry(changes.key.clone()) {
            entry.insert(Arc::new(healthy_addresses(&changes.all)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use futures::Future;
    use metainfo::{MetaInfo, METAINFO};

    use super::*;
    use crate::discovery::StaticDiscover;

    async fn with_metainfo<F, Fut>(f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        METAINFO
            .scope(RefCell::new(MetaInfo::new()), async move {
                f().await;
            })
            .await;
    }

    fn discover_of(n: u16) -> StaticDiscover {
        StaticDiscover::from(
            (0..n)
                .map(|i| {
                    format!("10.1.0.{}:9000", i + 1)
                        .parse::<std::net::SocketAddr>()
                        .unwrap()
                })
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_missing_ip_is_refused() {
        with_metainfo(|| async {
            let lb = IpHashBalance::new();
            let discover = discover_of(3);
            let target = Target::new("test");
            assert!(matches!(
                lb.get_picker(&target, &discover).await,
                Err(LoadBalanceError::MissingCallerIp)
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn test_same_ip_sticks_to_one_instance() {
        with_metainfo(|| async {
            let lb = IpHashBalance::new();
            let discover = discover_of(5);
            let target = Target::new("test");

            METAINFO
                .try_with(|m| m.borrow_mut().insert(CallerIp("203.0.113.7".into())))
                .unwrap();

            let mut first = lb.get_picker(&target, &discover).await.unwrap();
            let chosen = first.next().unwrap();
            for _ in 0..100 {
                let mut picker = lb.get_picker(&target, &discover).await.unwrap();
                assert_eq!(picker.next().unwrap(), chosen);
            }
        })
        .await;
    }
}
