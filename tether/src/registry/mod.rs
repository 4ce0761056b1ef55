//! Lease-backed service registration.
//!
//! A [`Registrar`] advertises one instance under
//! `/<namespace>/services/<type>/<name>/<lease-id>` and keeps the lease
//! renewed for the lifetime of the service. Renewal loss triggers
//! re-registration with bounded exponential backoff; a finite retry budget
//! turns into a quit signal once exhausted.

pub mod backoff;
pub mod record;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use faststr::FastStr;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

pub use record::InstanceRecord;

use crate::{
    net::outbound_ip,
    store::{EtcdStore, KeepAliveAck, LeaseId, Store, StoreConfig, StoreError},
};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Shutdown paths must never block indefinitely.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Api,
    #[default]
    Rpc,
}

impl ServiceType {
    /// Case-insensitive; anything that is not `api` registers as `rpc`.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("api") {
            Self::Api
        } else {
            Self::Rpc
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Rpc => "rpc",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("service name must not be empty")]
    MissingName,
    #[error("service port must not be zero")]
    InvalidPort,
    #[error("service ip must not be empty")]
    MissingIp,
    #[error("at least one store endpoint is required")]
    MissingEndpoints,
    #[error("invalid target `{0}`")]
    InvalidTarget(FastStr),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    pub namespace: FastStr,
    pub service_type: ServiceType,
    pub name: FastStr,
    /// Advertised IP; the sentinel `"*"` auto-detects the outbound address.
    pub ip: FastStr,
    pub port: u16,
    pub ttl: Duration,
    /// 0 means never give up.
    pub max_retry_attempts: u32,
    pub metadata: Option<Map<String, Value>>,
    pub store: StoreConfig,
}

impl RegistryOptions {
    pub fn new(name: impl Into<FastStr>, store: StoreConfig) -> Self {
        Self {
            namespace: FastStr::from_static_str(DEFAULT_NAMESPACE),
            service_type: ServiceType::default(),
            name: name.into(),
            ip: FastStr::from_static_str("*"),
            port: 0,
            ttl: DEFAULT_TTL,
            max_retry_attempts: 0,
            metadata: None,
            store,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<FastStr>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<FastStr>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.store.endpoints.is_empty() {
            return Err(ConfigError::MissingEndpoints);
        }
        if self.ttl < Duration::from_secs(1) {
            self.ttl = DEFAULT_TTL;
        }
        if self.ip == "*" {
            self.ip = outbound_ip().to_string().into();
        }
        if self.ip.is_empty() {
            return Err(ConfigError::MissingIp);
        }
        Ok(())
    }
}

/// Key prefix shared by every instance of one service.
pub fn service_prefix(namespace: &str, service_type: ServiceType, name: &str) -> String {
    format!("/{namespace}/services/{}/{name}/", service_type.as_str())
}

/// Full key for one instance; the lease id keeps same-name processes apart.
pub fn service_key(prefix: &str, lease: LeaseId) -> String {
    format!("{prefix}{lease}")
}

struct Shared<S> {
    store: Arc<S>,
    opts: RegistryOptions,
    prefix: String,
    lease: AtomicI64,
}

/// Advertises one service instance and keeps it advertised.
pub struct Registrar<S: Store = EtcdStore> {
    shared: Arc<Shared<S>>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stop_tx: mpsc::Sender<()>,
    stopped: AtomicBool,
    quit_rx: watch::Receiver<bool>,
}

impl<S: Store> fmt::Debug for Registrar<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar").finish_non_exhaustive()
    }
}

impl Registrar<EtcdStore> {
    /// Validate options, connect the store, perform the first registration
    /// and start the heartbeat loop. Blocks until registration succeeds or
    /// definitively fails.
    pub async fn new(mut options: RegistryOptions) -> Result<Self, RegistryError> {
        options.validate()?;
        let store = EtcdStore::connect(options.store.clone()).await?;
        Self::start(Arc::new(store), options).await
    }
}

impl<S: Store> Registrar<S> {
    /// Same as [`Registrar::new`] but over a caller-supplied store.
    pub async fn with_store(store: Arc<S>, mut options: RegistryOptions) -> Result<Self, RegistryError> {
        options.validate()?;
        Self::start(store, options).await
    }

    async fn start(store: Arc<S>, opts: RegistryOptions) -> Result<Self, RegistryError> {
        let prefix = service_prefix(&opts.namespace, opts.service_type, &opts.name);
        let shared = Arc::new(Shared {
            store,
            opts,
            prefix,
            lease: AtomicI64::new(0),
        });
        let acks = register(&shared).await?;

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(shared.clone(), acks, stop_rx, quit_tx));
        Ok(Self {
            shared,
            handle: parking_lot::Mutex::new(Some(handle)),
            stop_tx,
            stopped: AtomicBool::new(false),
            quit_rx,
        })
    }

    /// Flips to `true` exactly once, when a finite retry budget is exhausted.
    pub fn quit_signal(&self) -> watch::Receiver<bool> {
        self.quit_rx.clone()
    }

    pub fn lease_id(&self) -> LeaseId {
        self.shared.lease.load(Ordering::SeqCst)
    }

    /// The currently advertised full key.
    pub fn key(&self) -> String {
        service_key(&self.shared.prefix, self.lease_id())
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.shared.opts
    }

    /// Stop heartbeating, revoke the lease and delete the key. Idempotent;
    /// each teardown step runs under a short deadline.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.try_send(());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let lease = self.shared.lease.swap(0, Ordering::SeqCst);
        if lease != 0 {
            if let Err(e) =
                tokio::time::timeout(STOP_DEADLINE, self.shared.store.revoke(lease)).await
            {
                tracing::warn!("lease revoke timed out on stop: {e}");
            }
            // The revoke already removes the key; deleting again covers a
            // store that dropped the lease binding.
            let key = service_key(&self.shared.prefix, lease);
            let _ = tokio::time::timeout(STOP_DEADLINE, self.shared.store.delete(&key)).await;
        }
        tracing::info!(service = %self.shared.opts.name, "registrar stopped");
    }
}

impl<S: Store> Drop for Registrar<S> {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// One full registration pass: revoke any prior lease (best effort), grant a
/// fresh one, write the instance record bound to it and start renewals.
async fn register<S: Store>(shared: &Shared<S>) -> Result<mpsc::Receiver<KeepAliveAck>, StoreError> {
    let opts = &shared.opts;

    let old = shared.lease.load(Ordering::SeqCst);
    if old != 0 {
        // Ignoring failures here can orphan a key until its TTL runs out;
        // the fresh key below never collides with it.
        let _ = tokio::time::timeout(opts.store.op_timeout, shared.store.revoke(old)).await;
    }

    let lease = shared.store.grant(opts.ttl).await?;
    shared.lease.store(lease, Ordering::SeqCst);

    let key = service_key(&shared.prefix, lease);
    let record = InstanceRecord {
        timestamp: unix_now(),
        ip: opts.ip.clone(),
        port: opts.port.to_string().into(),
        meta: opts.metadata.clone(),
    };
    let value = record.encode().map_err(|e| StoreError::Put {
        key: FastStr::new(&key),
        source: Box::new(e),
    })?;
    shared.store.put(&key, value, Some(lease)).await?;

    let interval = (opts.ttl / 3).max(Duration::from_secs(1));
    let acks = shared.store.keep_alive(lease, interval).await?;
    tracing::info!(key = %key, lease, "service registered");
    Ok(acks)
}

enum Recovery {
    Recovered(mpsc::Receiver<KeepAliveAck>),
    Stopped,
    GiveUp,
}

async fn heartbeat_loop<S: Store>(
    shared: Arc<Shared<S>>,
    mut acks: mpsc::Receiver<KeepAliveAck>,
    mut stop_rx: mpsc::Receiver<()>,
    quit_tx: watch::Sender<bool>,
) {
    let mut attempts: u32 = 0;
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return,
            ack = acks.recv() => match ack {
                Some(_) => {
                    attempts = 0;
                }
                None => {
                    tracing::warn!(service = %shared.opts.name, "lease renewal lost, re-registering");
                    match recover(&shared, &mut attempts, &mut stop_rx).await {
                        Recovery::Recovered(new_acks) => acks = new_acks,
                        Recovery::Stopped => return,
                        Recovery::GiveUp => {
                            tracing::error!(
                                service = %shared.opts.name,
                                attempts,
                                "registration retries exhausted, giving up"
                            );
                            let _ = quit_tx.send(true);
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn recover<S: Store>(
    shared: &Shared<S>,
    attempts: &mut u32,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Recovery {
    let opts = &shared.opts;
    loop {
        *attempts += 1;
        if opts.max_retry_attempts > 0 && *attempts > opts.max_retry_attempts {
            return Recovery::GiveUp;
        }

        if shared.store.status().await.is_ok() {
            match register(shared).await {
                Ok(acks) => return Recovery::Recovered(acks),
                Err(err) => {
                    tracing::warn!(attempt = *attempts, "re-registration failed: {err}");
                    if matches!(err, StoreError::Timeout(_)) {
                        // A hung grant usually means a dead connection.
                        if let Err(err) = shared.store.reconnect().await {
                            tracing::warn!("store reconnect failed: {err}");
                        }
                    }
                }
            }
        } else {
            tracing::debug!(attempt = *attempts, "store unreachable, backing off");
        }

        let delay = backoff::retry_delay(*attempts);
        tokio::select! {
            _ = stop_rx.recv() => return Recovery::Stopped,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
