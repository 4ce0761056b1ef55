//! Client assembly: one call wires a [`Target`] to a resolver, a picker and
//! a pooled transport fleet.
//!
//! The factory keys pools by `name#fingerprint`, where the fingerprint
//! hashes the dial options, so the same service dialed with different
//! options gets its own pool. Discovery changes flow into the picker through
//! a subscription task; each new pooled transport dials whatever instance
//! the picker selects at creation time.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use faststr::FastStr;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{
    discovery::{Discover, EtcdDiscover, Target},
    loadbalance::{
        error::LoadBalanceError, fnv1a_64, LoadBalance, LoadBalanceFactory, LoadBalanceStrategy,
    },
    net::Address,
    pool::{Handle, MakeTransport, PoolConfig, PoolError, PoolRegistry, TcpTransport},
    registry::ConfigError,
    store::{EtcdStore, Store, StoreConfig, StoreError},
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    LoadBalance(#[from] LoadBalanceError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub strategy: LoadBalanceStrategy,
    /// Per-transport dial deadline.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            pool: PoolConfig::default(),
            strategy: LoadBalanceStrategy::RoundRobin,
            connect_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Dials one picker-selected instance per new pooled transport.
pub struct ServiceMakeTransport<S: Store = EtcdStore> {
    target: Target,
    discover: Arc<EtcdDiscover<S>>,
    lb: Arc<dyn LoadBalance<EtcdDiscover<S>>>,
    connect_timeout: Duration,
}

#[async_trait]
impl<S: Store> MakeTransport for ServiceMakeTransport<S> {
    type Conn = TcpTransport;

    async fn make_transport(&self) -> Result<TcpTransport, PoolError> {
        let mut picker = self
            .lb
            .get_picker(&self.target, self.discover.as_ref())
            .await?;
        let addr = picker
            .next()
            .ok_or(PoolError::LoadBalance(LoadBalanceError::NoAvailableService))?;
        TcpTransport::connect(addr, self.connect_timeout).await
    }
}

struct ClientInner<S: Store> {
    target: Target,
    discover: Arc<EtcdDiscover<S>>,
    lb: Arc<dyn LoadBalance<EtcdDiscover<S>>>,
    pool: crate::pool::ServicePool<ServiceMakeTransport<S>>,
}

/// Handle-vending client for one target service.
pub struct Client<S: Store = EtcdStore> {
    inner: Arc<ClientInner<S>>,
}

impl<S: Store> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Store> Client<S> {
    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// Check out a pooled transport for one call. Release the handle when
    /// the call finishes; dropping it releases too.
    pub async fn acquire(&self) -> Result<Handle<ServiceMakeTransport<S>>, ClientError> {
        Ok(self.inner.pool.acquire().await?)
    }

    /// Select a remote instance for one call.
    pub async fn pick(&self) -> Result<Address, ClientError> {
        let mut picker = self
            .inner
            .lb
            .get_picker(&self.inner.target, self.inner.discover.as_ref())
            .await?;
        picker
            .next()
            .ok_or(ClientError::LoadBalance(LoadBalanceError::NoAvailableService))
    }

    /// Tell pickers that track per-call state that the call to `addr` is
    /// done.
    pub fn finish(&self, addr: &Address) {
        self.inner.lb.release(addr);
    }
}

/// Assembles {resolver, picker, pool} per target service.
pub struct ClientFactory<S: Store = EtcdStore> {
    store: Arc<S>,
    cfg: ClientConfig,
    registry: PoolRegistry<ServiceMakeTransport<S>>,
    clients: DashMap<FastStr, Client<S>>,
}

impl ClientFactory<EtcdStore> {
    pub async fn new(cfg: ClientConfig) -> Result<Self, ClientError> {
        if cfg.store.endpoints.is_empty() {
            return Err(ConfigError::MissingEndpoints.into());
        }
        let store = EtcdStore::connect(cfg.store.clone()).await?;
        Ok(Self::assemble(Arc::new(store), cfg))
    }
}

impl<S: Store> ClientFactory<S> {
    /// Build over a caller-supplied store.
    pub fn with_store(store: Arc<S>, cfg: ClientConfig) -> Result<Self, ClientError> {
        if cfg.store.endpoints.is_empty() {
            return Err(ConfigError::MissingEndpoints.into());
        }
        Ok(Self::assemble(store, cfg))
    }

    fn assemble(store: Arc<S>, cfg: ClientConfig) -> Self {
        let registry = PoolRegistry::new(cfg.pool);
        Self {
            store,
            cfg,
            registry,
            clients: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Client for a target service, assembled on first use and cached by
    /// service id.
    pub async fn client(&self, target: Target) -> Result<Client<S>, ClientError> {
        let service_id = service_id(&target, &self.cfg);
        if let Some(client) = self.clients.get(&service_id) {
            return Ok(client.clone());
        }

        let discover = Arc::new(EtcdDiscover::new(self.store.clone(), target.clone()).await?);
        let lb: Arc<dyn LoadBalance<EtcdDiscover<S>>> =
            Arc::from(LoadBalanceFactory::create::<EtcdDiscover<S>>(
                self.cfg.strategy.clone(),
            ));

        // Feed discovery changes into the picker. The task ends when the
        // discover closes its change stream.
        if let Some(mut changes) = discover.watch() {
            let lb = lb.clone();
            tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => lb.rebalance(change),
                        Err(async_broadcast::RecvError::Overflowed(missed)) => {
                            tracing::warn!("discovery subscription lagged by {missed} changes");
                        }
                        Err(async_broadcast::RecvError::Closed) => return,
                    }
                }
            });
        }

        let maker = ServiceMakeTransport {
            target: target.clone(),
            discover: discover.clone(),
            lb: lb.clone(),
            connect_timeout: self.cfg.connect_timeout,
        };
        let pool = self.registry.get_or_create(service_id.clone(), || maker).await;

        let client = Client {
            inner: Arc::new(ClientInner {
                target,
                discover,
                lb,
                pool,
            }),
        };
        // Racing assemblers converge on whichever insert won.
        let client = self
            .clients
            .entry(service_id)
            .or_insert(client)
            .clone();
        Ok(client)
    }

    /// Tear down every pool this factory created.
    pub async fn close(&self) {
        self.clients.clear();
        self.registry.close().await;
    }
}

fn service_id(target: &Target, cfg: &ClientConfig) -> FastStr {
    let options = format!(
        "{:?}|{:?}|{:?}",
        cfg.strategy, cfg.pool, cfg.connect_timeout
    );
    let hash = fnv1a_64(format!("{}|{options}", target.prefix()).as_bytes());
    format!("{}#{hash:016x}", target.name).into()
}

static GLOBAL_FACTORY: OnceCell<ClientFactory> = OnceCell::const_new();

/// Initialize the process-wide factory. One-shot: later calls return the
/// factory built by the first, regardless of their config.
pub async fn init_global_factory(cfg: ClientConfig) -> Result<&'static ClientFactory, ClientError> {
    GLOBAL_FACTORY
        .get_or_try_init(|| ClientFactory::new(cfg))
        .await
}

pub fn global_factory() -> Option<&'static ClientFactory> {
    GLOBAL_FACTORY.get()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        registry::{Registrar, RegistryOptions},
        store::memory::MemoryStore,
    };

    fn store_config() -> StoreConfig {
        StoreConfig::new(["memory://test"])
    }

    async fn register(
        store: &Arc<MemoryStore>,
        name: &'static str,
        port: u16,
    ) -> Registrar<MemoryStore> {
        let options = RegistryOptions::new(name, store_config())
            .with_ip("127.0.0.1")
            .with_port(port);
        Registrar::with_store(store.clone(), options).await.unwrap()
    }

    #[test]
    fn test_service_id_fingerprints_options() {
        let target = Target::new("user");
        let cfg_a = ClientConfig::new(store_config());
        let cfg_b = cfg_a.clone().with_strategy(LoadBalanceStrategy::Random);
        let cfg_c = cfg_a
            .clone()
            .with_pool(PoolConfig::default().with_max_per_id(7));

        let id_a = service_id(&target, &cfg_a);
        assert!(id_a.starts_with("user#"));
        assert_ne!(id_a, service_id(&target, &cfg_b));
        assert_ne!(id_a, service_id(&target, &cfg_c));
        // Same options, same id.
        assert_eq!(id_a, service_id(&target, &cfg_a.clone()));
    }

    #[tokio::test]
    async fn test_register_pick_acquire_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registrar = register(&store, "user", port).await;

        let factory =
            ClientFactory::with_store(store.clone(), ClientConfig::new(store_config())).unwrap();
        let client = factory.client(Target::parse("etcd://user").unwrap()).await.unwrap();

        let addr = client.pick().await.unwrap();
        assert_eq!(addr, Address::Ip(listener.local_addr().unwrap()));

        let handle = client.acquire().await.unwrap();
        assert_eq!(handle.in_flight(), 1);
        handle.release();
        assert_eq!(handle.in_flight(), 0);

        registrar.stop().await;
        factory.close().await;
    }

    #[tokio::test]
    async fn test_clients_are_cached_by_service_id() {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registrar = register(&store, "user", port).await;

        let factory =
            ClientFactory::with_store(store.clone(), ClientConfig::new(store_config())).unwrap();
        let target = Target::parse("etcd://user").unwrap();
        let _a = factory.client(target.clone()).await.unwrap();
        let _b = factory.client(target).await.unwrap();
        assert_eq!(factory.client_count(), 1);

        registrar.stop().await;
        factory.close().await;
    }

    #[tokio::test]
    async fn test_rolling_restart_keeps_service_reachable() {
        let store = Arc::new(MemoryStore::new());
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = Address::Ip(listener_a.local_addr().unwrap());
        let addr_b = Address::Ip(listener_b.local_addr().unwrap());

        let reg_a = register(&store, "user", listener_a.local_addr().unwrap().port()).await;
        let _reg_b = register(&store, "user", listener_b.local_addr().unwrap().port()).await;

        let factory =
            ClientFactory::with_store(store.clone(), ClientConfig::new(store_config())).unwrap();
        let client = factory.client(Target::parse("etcd://user").unwrap()).await.unwrap();

        // Round robin over both instances.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            seen.insert(client.pick().await.unwrap());
        }
        assert!(seen.contains(&addr_a) && seen.contains(&addr_b));

        // A withdraws; picks must converge on B without ever failing.
        reg_a.stop().await;
        let mut converged = false;
        'outer: for _ in 0..100 {
            let mut streak = 0;
            for _ in 0..10 {
                let addr = client.pick().await.unwrap();
                if addr == addr_b {
                    streak += 1;
                } else {
                    break;
                }
            }
            if streak == 10 {
                converged = true;
                break 'outer;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(converged, "picks did not converge on the surviving instance");

        factory.close().await;
    }
}
