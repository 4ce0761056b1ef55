use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, GetOptions, Identity, PutOptions, TlsOptions,
};
use faststr::FastStr;
use tokio::{
    sync::mpsc,
    time::{timeout, MissedTickBehavior},
};

use super::{KeepAliveAck, LeaseId, Security, Store, StoreConfig, StoreError, WatchEvent};

/// Production [`Store`] over an etcd cluster.
///
/// The underlying client is replaceable at runtime: [`Store::reconnect`]
/// swaps in a freshly dialed client without interrupting holders of the old
/// one, which the registrar relies on when a lease grant times out.
pub struct EtcdStore {
    config: StoreConfig,
    client: ArcSwap<Client>,
}

impl EtcdStore {
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        let client = Self::dial(&config).await?;
        Ok(Self {
            config,
            client: ArcSwap::from_pointee(client),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn dial(config: &StoreConfig) -> Result<Client, StoreError> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout)
            .with_timeout(config.op_timeout);
        if let Some(tls) = tls_options(&config.security)? {
            options = options.with_tls(tls);
        }
        let endpoints: Vec<&str> = config.endpoints.iter().map(FastStr::as_str).collect();
        timeout(config.dial_timeout, Client::connect(&endpoints, Some(options)))
            .await
            .map_err(|_| StoreError::Timeout(config.dial_timeout))?
            .map_err(|e| StoreError::Connect(Box::new(e)))
    }

    fn client(&self) -> Client {
        let guard = self.client.load();
        (**guard).clone()
    }
}

#[async_trait::async_trait]
impl Store for EtcdStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut client = self.client();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = timeout(self.config.op_timeout, client.lease_grant(ttl_secs, None))
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
            .map_err(|e| StoreError::Grant(Box::new(e)))?;
        Ok(resp.id())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client();
        timeout(self.config.op_timeout, client.lease_revoke(lease))
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
            .map_err(|e| StoreError::Revoke(Box::new(e)))?;
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> Result<mpsc::Receiver<KeepAliveAck>, StoreError> {
        let mut client = self.client();
        let (mut keeper, mut stream) = timeout(self.config.op_timeout, client.lease_keep_alive(lease))
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
            .map_err(|e| StoreError::KeepAlive(Box::new(e)))?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if keeper.keep_alive().await.is_err() {
                            break;
                        }
                    }
                    msg = stream.message() => match msg {
                        Ok(Some(ack)) => {
                            // A zero TTL in the ack means the lease is gone.
                            if ack.ttl() <= 0 {
                                break;
                            }
                            if tx.send(KeepAliveAck { ttl: ack.ttl() }).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                }
            }
            // Dropping `tx` closes the channel; the consumer treats that as
            // lease death.
        });
        Ok(rx)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let mut client = self.client();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        timeout(self.config.op_timeout, client.put(key, value, options))
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
            .map_err(|e| StoreError::Put {
                key: FastStr::new(key),
                source: Box::new(e),
            })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client();
        timeout(self.config.op_timeout, client.delete(key, None))
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
            .map_err(|e| StoreError::Delete {
                key: FastStr::new(key),
                source: Box::new(e),
            })?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(FastStr, Vec<u8>)>, StoreError> {
        let mut client = self.client();
        let resp = timeout(
            self.config.op_timeout,
            client.get(prefix, Some(GetOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
        .map_err(|e| StoreError::GetPrefix {
            prefix: FastStr::new(prefix),
            source: Box::new(e),
        })?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(|e| StoreError::GetPrefix {
                prefix: FastStr::new(prefix),
                source: Box::new(e),
            })?;
            pairs.push((FastStr::new(key), kv.value().to_vec()));
        }
        Ok(pairs)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::Receiver<Vec<WatchEvent>>, StoreError> {
        let mut client = self.client();
        let (watcher, mut stream) = timeout(
            self.config.op_timeout,
            client.watch(prefix, Some(etcd_client::WatchOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
        .map_err(|e| StoreError::Watch {
            prefix: FastStr::new(prefix),
            source: Box::new(e),
        })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the stream; dropping
            // it cancels the watch server-side.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!("watch stream terminated: {e}");
                        return;
                    }
                };
                if resp.canceled() {
                    return;
                }
                let mut batch = Vec::with_capacity(resp.events().len());
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    match event.event_type() {
                        EventType::Put => batch.push(WatchEvent::Put {
                            key: FastStr::new(key),
                            value: kv.value().to_vec(),
                        }),
                        EventType::Delete => batch.push(WatchEvent::Delete {
                            key: FastStr::new(key),
                        }),
                    }
                }
                if !batch.is_empty() && tx.send(batch).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn status(&self) -> Result<(), StoreError> {
        let mut client = self.client();
        timeout(self.config.status_timeout, client.status())
            .await
            .map_err(|_| StoreError::Timeout(self.config.status_timeout))?
            .map_err(|e| StoreError::Unavailable(Box::new(e)))?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let client = Self::dial(&self.config).await?;
        self.client.store(Arc::new(client));
        Ok(())
    }
}

fn tls_options(security: &Security) -> Result<Option<TlsOptions>, StoreError> {
    let read = |path: &std::path::Path| {
        std::fs::read(path).map_err(|e| StoreError::Connect(Box::new(e)))
    };
    match security {
        Security::Insecure => Ok(None),
        Security::Tls { ca_cert, domain } => {
            let mut tls = TlsOptions::new();
            if let Some(ca) = ca_cert {
                tls = tls.ca_certificate(Certificate::from_pem(read(ca)?));
            }
            if let Some(domain) = domain {
                tls = tls.domain_name(domain.as_str());
            }
            Ok(Some(tls))
        }
        Security::MutualTls {
            ca_cert,
            client_cert,
            client_key,
            domain,
        } => {
            let mut tls = TlsOptions::new()
                .ca_certificate(Certificate::from_pem(read(ca_cert)?))
                .identity(Identity::from_pem(read(client_cert)?, read(client_key)?));
            if let Some(domain) = domain {
                tls = tls.domain_name(domain.as_str());
            }
            Ok(Some(tls))
        }
    }
}
