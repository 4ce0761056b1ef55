use std::{collections::HashMap, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use async_broadcast::Receiver;
use faststr::FastStr;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{diff_keyed, Change, Discover, Instance, Target};
use crate::{
    loadbalance::error::LoadBalanceError,
    net::Address,
    registry::InstanceRecord,
    store::{EtcdStore, Store, StoreError, WatchEvent},
};

/// Delay before re-establishing a lost watch stream.
const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// Store-backed [`Discover`]: reads the service prefix once, then keeps the
/// instance set current from watch events and broadcasts every change.
///
/// Events are applied in delivery order by stable key: a PUT upserts, a
/// DELETE removes, and a PUT followed by a DELETE of the same key leaves the
/// key gone. Malformed values are skipped without disturbing the rest of the
/// set. An empty set is never broadcast; it surfaces as
/// [`LoadBalanceError::NoAvailableService`] on the next pick instead.
pub struct EtcdDiscover<S: Store = EtcdStore> {
    target: Target,
    snapshot: Arc<ArcSwap<Vec<Arc<Instance>>>>,
    change_rx: async_broadcast::Receiver<Change<FastStr>>,
    stop_tx: mpsc::Sender<()>,
    _store: Arc<S>,
}

impl<S: Store> EtcdDiscover<S> {
    /// Read the initial instance set and start the watch loop.
    pub async fn new(store: Arc<S>, target: Target) -> Result<Self, StoreError> {
        let prefix = target.prefix();

        let pairs = store.get_prefix(&prefix).await?;
        let mut initial = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            apply_event(&mut initial, &WatchEvent::Put { key, value });
        }

        let events = store.watch_prefix(&prefix).await?;

        let (mut change_tx, change_rx) = async_broadcast::broadcast(64);
        change_tx.set_overflow(true);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let snapshot = Arc::new(ArcSwap::from_pointee(initial.clone()));
        if !initial.is_empty() {
            let _ = change_tx.try_broadcast(Change {
                key: target.name.clone(),
                all: initial.clone(),
                added: initial,
                updated: Vec::new(),
                removed: Vec::new(),
            });
        }

        // The watch loop owns the sender; when it exits the change stream
        // closes, which tells subscribers the discover is gone.
        tokio::spawn(watch_loop(
            store.clone(),
            prefix,
            target.name.clone(),
            snapshot.clone(),
            change_tx,
            events,
            stop_rx,
        ));

        Ok(Self {
            target,
            snapshot,
            change_rx,
            stop_tx,
            _store: store,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Resolution is watch-driven; there is nothing to kick.
    pub fn resolve_now(&self) {}

    /// Stop the watch loop. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

impl<S: Store> Drop for EtcdDiscover<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: Store> Discover for EtcdDiscover<S> {
    type Key = FastStr;
    type Error = LoadBalanceError;

    async fn discover<'s>(&'s self, _: &'s Target) -> Result<Vec<Arc<Instance>>, Self::Error> {
        let set = self.snapshot.load_full();
        if set.is_empty() {
            return Err(LoadBalanceError::NoAvailableService);
        }
        Ok(set.as_ref().clone())
    }

    fn key(&self, _: &Target) -> Self::Key {
        self.target.name.clone()
    }

    fn watch(&self) -> Option<Receiver<Change<Self::Key>>> {
        Some(self.change_rx.clone())
    }
}

async fn watch_loop<S: Store>(
    store: Arc<S>,
    prefix: String,
    service: FastStr,
    snapshot: Arc<ArcSwap<Vec<Arc<Instance>>>>,
    change_tx: async_broadcast::Sender<Change<FastStr>>,
    mut events: mpsc::Receiver<Vec<WatchEvent>>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return,
            batch = events.recv() => match batch {
                Some(batch) => apply_batch(&service, &snapshot, &change_tx, batch),
                None => {
                    tracing::warn!(service = %service, "watch stream lost, re-establishing");
                    match rewatch(&store, &prefix, &service, &snapshot, &change_tx, &mut stop_rx).await {
                        Some(new_events) => events = new_events,
                        None => return,
                    }
                }
            }
        }
    }
}

/// Re-open the watch and resync the set from a fresh prefix read; the time
/// between streams may have dropped events.
async fn rewatch<S: Store>(
    store: &Arc<S>,
    prefix: &str,
    service: &FastStr,
    snapshot: &ArcSwap<Vec<Arc<Instance>>>,
    change_tx: &async_broadcast::Sender<Change<FastStr>>,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Option<mpsc::Receiver<Vec<WatchEvent>>> {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return None,
            _ = tokio::time::sleep(REWATCH_DELAY) => {}
        }
        let events = match store.watch_prefix(prefix).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(service = %service, "re-watch failed: {e}");
                continue;
            }
        };
        match store.get_prefix(prefix).await {
            Ok(pairs) => {
                let mut next = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    apply_event(&mut next, &WatchEvent::Put { key, value });
                }
                let prev = snapshot.load_full();
                let (change, changed) = diff_keyed(service.clone(), &prev, next);
                snapshot.store(Arc::new(change.all.clone()));
                if changed && !change.all.is_empty() {
                    let _ = change_tx.try_broadcast(change);
                }
            }
            Err(e) => tracing::warn!(service = %service, "resync read failed: {e}"),
        }
        return Some(events);
    }
}

fn apply_batch(
    service: &FastStr,
    snapshot: &ArcSwap<Vec<Arc<Instance>>>,
    change_tx: &async_broadcast::Sender<Change<FastStr>>,
    batch: Vec<WatchEvent>,
) {
    let mut set = snapshot.load_full().as_ref().clone();
    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut removed = Vec::new();

    for event in &batch {
        match apply_event(&mut set, event) {
            Applied::Added(i) => added.push(i),
            Applied::Updated(i) => updated.push(i),
            Applied::Removed(i) => removed.push(i),
            Applied::Skipped => {}
        }
    }

    snapshot.store(Arc::new(set.clone()));

    if set.is_empty() {
        tracing::warn!(service = %service, "instance set drained; reporting no available service");
        return;
    }
    if added.is_empty() && updated.is_empty() && removed.is_empty() {
        return;
    }
    let _ = change_tx.try_broadcast(Change {
        key: service.clone(),
        all: set,
        added,
        updated,
        removed,
    });
}

pub(crate) enum Applied {
    Added(Arc<Instance>),
    Updated(Arc<Instance>),
    Removed(Arc<Instance>),
    Skipped,
}

/// Apply one watch event to the ordered instance set.
///
/// PUT of a known key replaces in place (identity survives weight and
/// metadata updates); PUT of a new key appends; DELETE of an unknown key is
/// ignored. Undecodable values are logged and skipped so one bad entry never
/// poisons the batch.
pub(crate) fn apply_event(set: &mut Vec<Arc<Instance>>, event: &WatchEvent) -> Applied {
    match event {
        WatchEvent::Put { key, value } => {
            let record = match InstanceRecord::decode(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, "skipping malformed instance record: {e}");
                    return Applied::Skipped;
                }
            };
            let address: Address = match record.address_str().parse() {
                Ok(address) => address,
                Err(e) => {
                    tracing::warn!(key = %key, "skipping instance with bad address: {e}");
                    return Applied::Skipped;
                }
            };
            let instance = Arc::new(Instance {
                key: key.clone(),
                address,
                weight: record.weight(),
                healthy: record.healthy(),
                tags: project_tags(&record),
            });
            match set.iter().position(|i| i.key == *key) {
                Some(pos) => {
                    set[pos] = instance.clone();
                    Applied::Updated(instance)
                }
                None => {
                    set.push(instance.clone());
                    Applied::Added(instance)
                }
            }
        }
        WatchEvent::Delete { key } => match set.iter().position(|i| i.key == *key) {
            Some(pos) => Applied::Removed(set.remove(pos)),
            None => Applied::Skipped,
        },
    }
}

/// Scalar metadata entries become string tags; nested values are not
/// attributes and are dropped.
fn project_tags(record: &InstanceRecord) -> HashMap<FastStr, FastStr> {
    let mut tags = HashMap::new();
    if let Some(meta) = &record.meta {
        for (key, value) in meta {
            let text = match value {
                Value::String(s) => FastStr::from(s.clone()),
                Value::Number(n) => FastStr::from(n.to_string()),
                Value::Bool(b) => FastStr::from_static_str(if *b { "true" } else { "false" }),
                _ => continue,
            };
            tags.insert(FastStr::from(key.clone()), text);
        }
    }
    tags
}
