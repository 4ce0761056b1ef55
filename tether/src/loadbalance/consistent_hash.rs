use std::{hash::Hash, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::BoxFuture;

use super::{error::LoadBalanceError, fnv1a_64, healthy_addresses, LoadBalance, RequestKey};
use crate::{
    discovery::{Change, Discover, Target},
    net::Address,
};

/// Maps the per-call [`RequestKey`] onto the instance at `hash(key) mod N`.
///
/// Plain modulo over the set order, no virtual nodes: the same key over the
/// same set always lands on the same instance, but a membership change may
/// remap far more keys than a classical hash ring would. When no key was
/// supplied the default (empty) key is hashed, so unkeyed calls still pick
/// deterministically.
pub struct ConsistentHashBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    router: DashMap<K, Arc<Vec<Address>>>,
}

impl<K> ConsistentHashBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K> Default for ConsistentHashBalance<K>
where
    K: Hash + PartialEq + Eq + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self {
            router: DashMap::new(),
        }
    }
}

/// Walks the address list once, starting at the hashed offset; the tail of
/// the walk is the retry fallback order.
pub(crate) struct OffsetIterator {
    addresses: Arc<Vec<Address>>,
    index: usize,
    remaining: usize,
}

impl OffsetIterator {
    pub(crate) fn new(addresses: Arc<Vec<Address>>, start: usize) -> Self {
        let remaining = addresses.len();
        Self {
            addresses,
            index: start,
            remaining,
        }
    }
}

impl Iterator for OffsetIterator {
    type Item = Address;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let addr = self.addresses[self.index];
        self.index = (self.index + 1) % self.addresses.len();
        self.remaining -= 1;
        Some(addr)
    }
}

impl<D> LoadBalance<D> for ConsistentHashBalance<D::Key>
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
            let request_key = metainfo::METAINFO
                .try_with(|m| m.borrow().get::<RequestKey>().cloned())
                .ok()
                .flatten();

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

            let hashed = fnv1a_64(
                request_key
                    .as_ref()
                    .map(|k| k.0.as_bytes())
                    .unwrap_or_default(),
            );
            let start = (hashed % addresses.len() as u64) as usize;
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

    fn set_request_key(key: &str) {
        METAINFO
            .try_with(|m| m.borrow_mut().insert(RequestKey(key.to_string().into())))
            .unwrap();
    }

    fn discover_of(n: u16) -> StaticDiscover {
        StaticDiscover::from(
            (0..n)
                .map(|i| {
                    format!("127.0.0.{}:80{:02}", i + 1, i)
                        .parse::<std::net::SocketAddr>()
                        .unwrap()
                })
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_same_key_same_instance() {
        with_metainfo(|| async {
            let lb = ConsistentHashBalance::new();
            let discover = discover_of(4);
            let target = Target::new("test");

            set_request_key("user:42");
            let mut first = lb.get_picker(&target, &discover).await.unwrap();
            let chosen = first.next().unwrap();

            for _ in 0..1000 {
                let mut picker = lb.get_picker(&target, &discover).await.unwrap();
                assert_eq!(picker.next().unwrap(), chosen);
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_different_keys_can_differ() {
        with_metainfo(|| async {
            let lb = ConsistentHashBalance::new();
            let discover = discover_of(8);
            let target = Target::new("test");

            let mut seen = std::collections::HashSet::new();
            for i in 0..64 {
                set_request_key(&format!("user:{i}"));
                let mut picker = lb.get_picker(&target, &discover).await.unwrap();
                seen.insert(picker.next().unwrap());
            }
            assert!(seen.len() > 1, "all keys mapped to one instance");
        })
        .await;
    }

    #[tokio::test]
    async fn test_missing_key_falls_back_to_default() {
        with_metainfo(|| async {
            let lb = ConsistentHashBalance::new();
            let discover = discover_of(4);
            let target = Target::new("test");

            let mut first = lb.get_picker(&target, &discover).await.unwrap();
            let chosen = first.next().unwrap();
            let mut second = lb.get_picker(&target, &discover).await.unwrap();
            assert_eq!(second.next().unwrap(), chosen);
        })
        .await;
    }

    #[tokio::test]
    async fn test_retry_order_covers_each_instance_once() {
        with_metainfo(|| async {
            let lb = ConsistentHashBalance::new();
            let discover = discover_of(3);
            let target = Target::new("test");

            set_request_key("user:42");
            let picker = lb.get_picker(&target, &discover).await.unwrap();
            let all: Vec<_> = picker.collect();
            assert_eq!(all.len(), 3);
            let unique: std::collections::HashSet<_> = all.iter().collect();
            assert_eq!(unique.len(), 3);
        })
        .await;
    }
}
