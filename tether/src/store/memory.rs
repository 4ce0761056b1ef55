//! In-memory [`Store`] used by unit tests: scriptable outages and lease
//! expiry with the same observable behavior as the etcd implementation.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use faststr::FastStr;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{KeepAliveAck, LeaseId, Store, StoreError, WatchEvent};

#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    online: bool,
    next_lease: LeaseId,
    data: BTreeMap<String, (Vec<u8>, Option<LeaseId>)>,
    leases: HashMap<LeaseId, Arc<AtomicBool>>,
    watchers: Vec<(String, mpsc::Sender<Vec<WatchEvent>>)>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            online: true,
            next_lease: 7_587_848_000,
            data: BTreeMap::new(),
            leases: HashMap::new(),
            watchers: Vec::new(),
        }
    }
}

impl Inner {
    fn notify(&mut self, event: WatchEvent) {
        let key = match &event {
            WatchEvent::Put { key, .. } => key.clone(),
            WatchEvent::Delete { key } => key.clone(),
        };
        self.watchers.retain(|(prefix, tx)| {
            if !key.starts_with(prefix.as_str()) {
                return true;
            }
            // A full channel is a slow consumer, not a gone one; only a
            // closed receiver deregisters the watcher.
            match tx.try_send(vec![event.clone()]) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn kill_lease(&mut self, lease: LeaseId) {
        if let Some(alive) = self.leases.remove(&lease) {
            alive.store(false, Ordering::SeqCst);
        }
        let doomed: Vec<String> = self
            .data
            .iter()
            .filter(|(_, (_, l))| *l == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.data.remove(&key);
            self.notify(WatchEvent::Delete {
                key: FastStr::new(&key),
            });
        }
    }
}

fn offline() -> StoreError {
    StoreError::Unavailable("store offline".into())
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub(crate) fn set_online(&self, online: bool) {
        self.inner.lock().online = online;
    }

    /// Expire a lease server-side: removes its keys and stops its renewals.
    pub(crate) fn expire_lease(&self, lease: LeaseId) {
        self.inner.lock().kill_lease(lease);
    }

    /// Expire every outstanding lease, as a real store would after an outage
    /// longer than the TTL.
    pub(crate) fn expire_all_leases(&self) {
        let leases: Vec<LeaseId> = self.inner.lock().leases.keys().copied().collect();
        for lease in leases {
            self.inner.lock().kill_lease(lease);
        }
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.inner.lock().data.keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn grant(&self, _ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(offline());
        }
        inner.next_lease += 1;
        let lease = inner.next_lease;
        inner.leases.insert(lease, Arc::new(AtomicBool::new(true)));
        Ok(lease)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(offline());
        }
        inner.kill_lease(lease);
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> Result<mpsc::Receiver<KeepAliveAck>, StoreError> {
        let (alive, store) = {
            let inner = self.inner.lock();
            if !inner.online {
                return Err(offline());
            }
            let alive = inner
                .leases
                .get(&lease)
                .cloned()
                .ok_or_else(|| StoreError::KeepAlive("unknown lease".into()))?;
            (alive, self.clone())
        };
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let online = store.inner.lock().online;
                if !online || !alive.load(Ordering::SeqCst) {
                    return;
                }
                if tx.send(KeepAliveAck { ttl: 10 }).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(offline());
        }
        inner.data.insert(key.to_string(), (value.clone(), lease));
        inner.notify(WatchEvent::Put {
            key: FastStr::new(key),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(offline());
        }
        if inner.data.remove(key).is_some() {
            inner.notify(WatchEvent::Delete {
                key: FastStr::new(key),
            });
        }
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(FastStr, Vec<u8>)>, StoreError> {
        let inner = self.inner.lock();
        if !inner.online {
            return Err(offline());
        }
        Ok(inner
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (FastStr::new(k), v.clone()))
            .collect())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::Receiver<Vec<WatchEvent>>, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(offline());
        }
        let (tx, rx) = mpsc::channel(64);
        inner.watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }

    async fn status(&self) -> Result<(), StoreError> {
        if self.inner.lock().online {
            Ok(())
        } else {
            Err(offline())
        }
    }
}
