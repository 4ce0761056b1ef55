//! Contract for the coordination store backing registration and discovery.
//!
//! The store must provide leases (grant/revoke/keep-alive), key-value access
//! with lease binding, prefix reads and prefix watches, and a liveness probe.
//! [`etcd::EtcdStore`] is the production implementation; tests run against an
//! in-memory stand-in.

pub mod etcd;
#[cfg(test)]
pub(crate) mod memory;

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use faststr::FastStr;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::BoxError;

pub use etcd::EtcdStore;

/// Lease identifier issued by the coordination store.
pub type LeaseId = i64;

/// One acknowledged lease renewal.
#[derive(Clone, Copy, Debug)]
pub struct KeepAliveAck {
    /// Remaining time-to-live granted by this renewal, in seconds.
    pub ttl: i64,
}

/// A single change observed under a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: FastStr, value: Vec<u8> },
    Delete { key: FastStr },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connect failed: {0}")]
    Connect(#[source] BoxError),
    #[error("lease grant failed: {0}")]
    Grant(#[source] BoxError),
    #[error("lease revoke failed: {0}")]
    Revoke(#[source] BoxError),
    #[error("keep-alive stream failed: {0}")]
    KeepAlive(#[source] BoxError),
    #[error("put `{key}` failed: {source}")]
    Put {
        key: FastStr,
        #[source]
        source: BoxError,
    },
    #[error("delete `{key}` failed: {source}")]
    Delete {
        key: FastStr,
        #[source]
        source: BoxError,
    },
    #[error("read prefix `{prefix}` failed: {source}")]
    GetPrefix {
        prefix: FastStr,
        #[source]
        source: BoxError,
    },
    #[error("watch `{prefix}` failed: {source}")]
    Watch {
        prefix: FastStr,
        #[source]
        source: BoxError,
    },
    #[error("store endpoint unreachable: {0}")]
    Unavailable(#[source] BoxError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Transport security applied to the store connection. Pass-through to the
/// underlying client; the core contract only validates it.
#[derive(Clone, Debug, Default)]
pub enum Security {
    #[default]
    Insecure,
    /// Server-verified TLS. `ca_cert` overrides the system roots.
    Tls {
        ca_cert: Option<PathBuf>,
        domain: Option<FastStr>,
    },
    /// Mutual TLS with a client identity.
    MutualTls {
        ca_cert: PathBuf,
        client_cert: PathBuf,
        client_key: PathBuf,
        domain: Option<FastStr>,
    },
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub endpoints: Vec<FastStr>,
    /// Deadline for establishing the client connection.
    pub dial_timeout: Duration,
    /// Deadline for grant/put/revoke/delete round trips.
    pub op_timeout: Duration,
    /// Deadline for the liveness probe.
    pub status_timeout: Duration,
    pub security: Security,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(3),
            security: Security::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(endpoints: impl IntoIterator<Item = impl Into<FastStr>>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }
}

/// Coordination-store operations required by the registrar and the resolver.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Grant a lease with the given time-to-live.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Revoke a lease; the store removes every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Start renewing a lease. The returned channel yields one ack per
    /// renewal and closes when the lease dies or renewal stops succeeding.
    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> Result<mpsc::Receiver<KeepAliveAck>, StoreError>;

    /// Write a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Read every key-value pair under a prefix.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(FastStr, Vec<u8>)>, StoreError>;

    /// Watch a prefix. Each received batch preserves the store's delivery
    /// order; the channel closes when the watch stream ends.
    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::Receiver<Vec<WatchEvent>>, StoreError>;

    /// Probe at least one endpoint for liveness.
    async fn status(&self) -> Result<(), StoreError>;

    /// Rebuild the underlying client connection. Implementations without a
    /// persistent connection may ignore this.
    async fn reconnect(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
