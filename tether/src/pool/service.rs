use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use faststr::FastStr;
use tokio::{sync::RwLock, time::Instant};

use super::{registry::PoolConfig, ConnState, MakeTransport, PoolError, Transport};

/// Grace period a transport in transient failure gets before eviction.
const TRANSIENT_GRACE: Duration = Duration::from_secs(30);

/// One transport plus its pooling state.
pub struct PooledTransport<T> {
    conn: T,
    in_flight: AtomicU32,
    last_used: parking_lot::Mutex<Instant>,
}

impl<T: Transport> PooledTransport<T> {
    fn new(conn: T, in_flight: u32) -> Self {
        Self {
            conn,
            in_flight: AtomicU32::new(in_flight),
            last_used: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn conn(&self) -> &T {
        &self.conn
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn checkout(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// Decrement in-flight; saturates at zero so no release interleaving can
    /// underflow.
    fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Selectable: ready or still connecting. Transient failure and shutdown
    /// are both off the table for new calls.
    fn usable(&self) -> bool {
        matches!(self.conn.state(), ConnState::Ready | ConnState::Connecting)
    }
}

struct PoolShared<M: MakeTransport> {
    service_id: FastStr,
    maker: M,
    cfg: PoolConfig,
    transports: RwLock<Vec<Arc<PooledTransport<M::Conn>>>>,
    last_active: parking_lot::Mutex<Instant>,
    closed: AtomicBool,
}

/// Fleet of transports for one service id.
pub struct ServicePool<M: MakeTransport> {
    shared: Arc<PoolShared<M>>,
}

impl<M: MakeTransport> Clone for ServicePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: MakeTransport> ServicePool<M> {
    /// The config is taken as given; clamping recognized option ranges is the
    /// registry's concern.
    pub fn new(service_id: impl Into<FastStr>, maker: M, cfg: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                service_id: service_id.into(),
                maker,
                cfg,
                transports: RwLock::new(Vec::new()),
                last_active: parking_lot::Mutex::new(Instant::now()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn service_id(&self) -> &FastStr {
        &self.shared.service_id
    }

    /// Check out a transport for one call.
    ///
    /// Fast path: the least-loaded usable transport under the concurrency
    /// threshold, found under the read lock. Under pressure the pool grows up
    /// to `max_per_id`; the dial runs inside the write critical section so
    /// simultaneous creators back-pressure each other. At cap, the
    /// least-loaded transport is returned even above threshold.
    pub async fn acquire(&self) -> Result<Handle<M>, PoolError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        self.touch();

        {
            let transports = self.shared.transports.read().await;
            if let Some(best) = least_loaded(&transports) {
                if best.in_flight() < self.shared.cfg.concurrency_threshold {
                    best.checkout();
                    return Ok(Handle::new(best.clone(), self.clone()));
                }
            }
        }

        let mut transports = self.shared.transports.write().await;
        if transports.len() < self.shared.cfg.max_per_id {
            match self.shared.maker.make_transport().await {
                Ok(conn) => {
                    // The first use is the one we were asked for.
                    let entry = Arc::new(PooledTransport::new(conn, 1));
                    transports.push(entry.clone());
                    tracing::debug!(
                        service_id = %self.shared.service_id,
                        count = transports.len(),
                        "created pooled transport"
                    );
                    drop(transports);
                    self.spawn_health_watcher(entry.clone());
                    return Ok(Handle::new(entry, self.clone()));
                }
                Err(e) => {
                    // Dial failed; fall back to whatever is usable.
                    if let Some(best) = least_loaded(&transports) {
                        tracing::warn!(
                            service_id = %self.shared.service_id,
                            "transport dial failed, reusing pooled transport: {e}"
                        );
                        best.checkout();
                        return Ok(Handle::new(best.clone(), self.clone()));
                    }
                    return Err(e);
                }
            }
        }

        match least_loaded(&transports) {
            Some(best) => {
                best.checkout();
                Ok(Handle::new(best.clone(), self.clone()))
            }
            None => Err(PoolError::NoHealthyConnections),
        }
    }

    /// Close every transport and refuse further acquires. One-shot.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut transports = self.shared.transports.write().await;
        for entry in transports.drain(..) {
            entry.conn().shutdown();
        }
        tracing::debug!(service_id = %self.shared.service_id, "service pool closed");
    }

    /// Evict idle and unusable transports, never below the floor and never
    /// one with calls in flight.
    pub(crate) async fn reap(&self) {
        let cfg = &self.shared.cfg;
        let mut transports = self.shared.transports.write().await;
        let now = Instant::now();
        // Tail-first so removal never shifts an index we have yet to visit.
        for i in (0..transports.len()).rev() {
            if transports.len() <= cfg.min_per_id {
                break;
            }
            let entry = &transports[i];
            let idle = now.saturating_duration_since(entry.last_used()) > cfg.max_idle_time;
            if entry.in_flight() == 0 && (idle || !entry.usable()) {
                tracing::debug!(
                    service_id = %self.shared.service_id,
                    "reaping pooled transport"
                );
                entry.conn().shutdown();
                transports.remove(i);
            }
        }
    }

    /// Empty and untouched for more than twice the idle threshold; the
    /// registry retires such pools.
    pub(crate) async fn is_expired(&self, max_idle: Duration) -> bool {
        if !self.shared.transports.read().await.is_empty() {
            return false;
        }
        self.last_active().elapsed() > max_idle * 2
    }

    pub async fn transport_count(&self) -> usize {
        self.shared.transports.read().await.len()
    }

    /// In-flight counts per transport, for observation.
    pub async fn loads(&self) -> Vec<u32> {
        self.shared
            .transports
            .read()
            .await
            .iter()
            .map(|t| t.in_flight())
            .collect()
    }

    pub(crate) fn touch(&self) {
        *self.shared.last_active.lock() = Instant::now();
    }

    fn last_active(&self) -> Instant {
        *self.shared.last_active.lock()
    }

    /// Watch one transport's connectivity for its lifetime in the pool:
    /// shutdown means immediate removal, transient failure gets a grace
    /// period and a re-check.
    fn spawn_health_watcher(&self, entry: Arc<PooledTransport<M::Conn>>) {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut state = entry.conn().state();
            loop {
                match state {
                    ConnState::Shutdown => {
                        remove_entry(&weak, &entry).await;
                        return;
                    }
                    ConnState::TransientFailure => {
                        tokio::time::sleep(TRANSIENT_GRACE).await;
                        let now = entry.conn().state();
                        if matches!(now, ConnState::TransientFailure | ConnState::Shutdown) {
                            entry.conn().shutdown();
                            remove_entry(&weak, &entry).await;
                            return;
                        }
                        state = now;
                    }
                    _ => {
                        tokio::select! {
                            next = entry.conn().state_changed(state) => state = next,
                            _ = tokio::time::sleep(Duration::from_secs(60)) => {
                                // Periodic liveness check so the task dies
                                // with the pool even on a quiet connection.
                                if weak.upgrade().is_none() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

fn least_loaded<T: Transport>(
    transports: &[Arc<PooledTransport<T>>],
) -> Option<&Arc<PooledTransport<T>>> {
    transports
        .iter()
        .filter(|t| t.usable())
        .min_by_key(|t| t.in_flight())
}

async fn remove_entry<M: MakeTransport>(
    weak: &Weak<PoolShared<M>>,
    entry: &Arc<PooledTransport<M::Conn>>,
) {
    if let Some(shared) = weak.upgrade() {
        let mut transports = shared.transports.write().await;
        transports.retain(|t| !Arc::ptr_eq(t, entry));
    }
}

/// What callers hold while a call is in flight.
///
/// Releasing decrements the transport's in-flight count without closing
/// anything; a second release is a no-op. Dropping an unreleased handle
/// releases it.
pub struct Handle<M: MakeTransport> {
    entry: Arc<PooledTransport<M::Conn>>,
    pool: ServicePool<M>,
    released: AtomicBool,
}

impl<M: MakeTransport> Handle<M> {
    fn new(entry: Arc<PooledTransport<M::Conn>>, pool: ServicePool<M>) -> Self {
        Self {
            entry,
            pool,
            released: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &M::Conn {
        self.entry.conn()
    }

    pub fn in_flight(&self) -> u32 {
        self.entry.in_flight()
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // Keep the pool off the reaper's empty-idle radar while in use.
        self.pool.touch();
        self.entry.release();
    }
}

impl<M: MakeTransport> Drop for Handle<M> {
    fn drop(&mut self) {
        self.release();
    }
}
