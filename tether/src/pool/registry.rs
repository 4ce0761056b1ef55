use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use faststr::FastStr;
use tokio::sync::{mpsc, RwLock};

use super::{MakeTransport, ServicePool};

/// Recognized pool options. Out-of-range values are clamped by
/// [`PoolConfig::normalized`] when the config enters a registry.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Transports idle longer than this are reaped (above the floor).
    pub max_idle_time: Duration,
    /// Reaper tick.
    pub cleanup_interval: Duration,
    /// In-flight count at which the pool prefers creating a new transport.
    pub concurrency_threshold: u32,
    /// Cap on transports per service pool.
    pub max_per_id: usize,
    /// Floor on transports per service pool.
    pub min_per_id: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            concurrency_threshold: 500,
            max_per_id: 5,
            min_per_id: 1,
        }
    }
}

impl PoolConfig {
    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    pub fn with_cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }

    pub fn with_concurrency_threshold(mut self, threshold: u32) -> Self {
        self.concurrency_threshold = threshold;
        self
    }

    pub fn with_max_per_id(mut self, max_per_id: usize) -> Self {
        self.max_per_id = max_per_id;
        self
    }

    pub fn with_min_per_id(mut self, min_per_id: usize) -> Self {
        self.min_per_id = min_per_id;
        self
    }

    /// Clamp options to their supported ranges: a threshold below 10 resets
    /// to the default 500, the cap floors at 5, the floor at 1, and the
    /// floor never exceeds the cap.
    pub fn normalized(mut self) -> Self {
        if self.concurrency_threshold < 10 {
            self.concurrency_threshold = 500;
        }
        if self.max_per_id < 5 {
            self.max_per_id = 5;
        }
        if self.min_per_id < 1 {
            self.min_per_id = 1;
        }
        if self.min_per_id > self.max_per_id {
            self.min_per_id = self.max_per_id;
        }
        self
    }
}

struct RegistryShared<M: MakeTransport> {
    cfg: PoolConfig,
    pools: RwLock<HashMap<FastStr, ServicePool<M>>>,
}

/// Process-wide map of service id to [`ServicePool`], with a background
/// reaper that ticks every `cleanup_interval`: it reaps each pool and retires
/// pools that have sat empty for more than twice the idle threshold.
///
/// The reaper holds only a weak reference, so dropping the last registry
/// clone stops it.
pub struct PoolRegistry<M: MakeTransport> {
    shared: Arc<RegistryShared<M>>,
    stop_tx: mpsc::Sender<()>,
}

impl<M: MakeTransport> Clone for PoolRegistry<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            stop_tx: self.stop_tx.clone(),
        }
    }
}

impl<M: MakeTransport> PoolRegistry<M> {
    pub fn new(cfg: PoolConfig) -> Self {
        let shared = Arc::new(RegistryShared {
            cfg: cfg.normalized(),
            pools: RwLock::new(HashMap::new()),
        });
        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(reaper(Arc::downgrade(&shared), stop_rx));
        Self { shared, stop_tx }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.cfg
    }

    /// Fetch the pool for `service_id`, creating it on first use. Lookup
    /// takes the read lock; a miss upgrades to the write lock with a
    /// double-check so racing creators converge on one pool.
    pub async fn get_or_create(
        &self,
        service_id: FastStr,
        make: impl FnOnce() -> M,
    ) -> ServicePool<M> {
        {
            let pools = self.shared.pools.read().await;
            if let Some(pool) = pools.get(&service_id) {
                pool.touch();
                return pool.clone();
            }
        }
        let mut pools = self.shared.pools.write().await;
        if let Some(pool) = pools.get(&service_id) {
            return pool.clone();
        }
        tracing::debug!(service_id = %service_id, "creating service pool");
        let pool = ServicePool::new(service_id.clone(), make(), self.shared.cfg);
        pools.insert(service_id, pool.clone());
        pool
    }

    pub async fn pool_count(&self) -> usize {
        self.shared.pools.read().await.len()
    }

    /// Stop the reaper and close every pool.
    pub async fn close(&self) {
        let _ = self.stop_tx.try_send(());
        let mut pools = self.shared.pools.write().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}

async fn reaper<M: MakeTransport>(weak: Weak<RegistryShared<M>>, mut stop_rx: mpsc::Receiver<()>) {
    let interval = match weak.upgrade() {
        Some(shared) => shared.cfg.cleanup_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = ticker.tick() => {}
        }
        let Some(shared) = weak.upgrade() else { return };

        let pools: Vec<(FastStr, ServicePool<M>)> = {
            let map = shared.pools.read().await;
            map.iter().map(|(id, p)| (id.clone(), p.clone())).collect()
        };
        for (_, pool) in &pools {
            pool.reap().await;
        }

        let mut doomed = Vec::new();
        for (id, pool) in &pools {
            if pool.is_expired(shared.cfg.max_idle_time).await {
                doomed.push(id.clone());
            }
        }
        if !doomed.is_empty() {
            let mut map = shared.pools.write().await;
            for id in doomed {
                // Re-check under the write lock; the pool may have been
                // touched since the scan.
                let expired = match map.get(&id) {
                    Some(pool) => pool.is_expired(shared.cfg.max_idle_time).await,
                    None => false,
                };
                if expired {
                    tracing::debug!(service_id = %id, "removing idle service pool");
                    map.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pool::testing::TestMaker;

    #[test]
    fn test_config_normalization() {
        let cfg = PoolConfig::default()
            .with_concurrency_threshold(2)
            .with_max_per_id(1)
            .with_min_per_id(0)
            .normalized();
        assert_eq!(cfg.concurrency_threshold, 500);
        assert_eq!(cfg.max_per_id, 5);
        assert_eq!(cfg.min_per_id, 1);

        let cfg = PoolConfig::default()
            .with_concurrency_threshold(10)
            .with_min_per_id(8)
            .normalized();
        assert_eq!(cfg.concurrency_threshold, 10);
        assert_eq!(cfg.min_per_id, 5);
    }

    #[tokio::test]
    async fn test_get_or_create_converges() {
        let registry: PoolRegistry<Arc<TestMaker>> = PoolRegistry::new(PoolConfig::default());
        let maker = Arc::new(TestMaker::default());

        let pool_a = registry
            .get_or_create("user#abc".into(), || maker.clone())
            .await;
        let handle = pool_a.acquire().await.unwrap();
        handle.release();

        let pool_b = registry
            .get_or_create("user#abc".into(), || maker.clone())
            .await;
        // Same underlying pool: the transport created through `pool_a` is
        // visible through `pool_b`.
        assert_eq!(pool_b.transport_count().await, 1);
        assert_eq!(registry.pool_count().await, 1);

        registry
            .get_or_create("order#def".into(), || maker.clone())
            .await;
        assert_eq!(registry.pool_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_retires_empty_idle_pools() {
        let cfg = PoolConfig::default()
            .with_max_idle_time(Duration::from_secs(1))
            .with_cleanup_interval(Duration::from_millis(200));
        let registry: PoolRegistry<Arc<TestMaker>> = PoolRegistry::new(cfg);
        let maker = Arc::new(TestMaker::default());

        registry
            .get_or_create("user#abc".into(), || maker.clone())
            .await;
        assert_eq!(registry.pool_count().await, 1);

        // Empty and untouched past 2 x max_idle: the reaper drops it.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.pool_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_keeps_active_pools() {
        let cfg = PoolConfig::default()
            .with_max_idle_time(Duration::from_secs(1))
            .with_cleanup_interval(Duration::from_millis(200));
        let registry: PoolRegistry<Arc<TestMaker>> = PoolRegistry::new(cfg);
        let maker = Arc::new(TestMaker::default());

        let pool = registry
            .get_or_create("user#abc".into(), || maker.clone())
            .await;
        let handle = pool.acquire().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        // Holding a transport keeps the pool out of the empty-idle sweep.
        assert_eq!(registry.pool_count().await, 1);
        handle.release();
    }

    #[tokio::test]
    async fn test_close_shuts_pools() {
        let registry: PoolRegistry<Arc<TestMaker>> = PoolRegistry::new(PoolConfig::default());
        let maker = Arc::new(TestMaker::default());

        let pool = registry
            .get_or_create("user#abc".into(), || maker.clone())
            .await;
        let handle = pool.acquire().await.unwrap();
        handle.release();

        registry.close().await;
        assert_eq!(registry.pool_count().await, 0);
        assert!(matches!(
            pool.acquire().await,
            Err(crate::pool::PoolError::Closed)
        ));
    }
}
