//! etcd-backed datastore binding
//!
//! One client per process, created at startup from the first cluster
//! member and injected wherever the [`KvStore`] port is needed. Watches
//! are pumped from the gRPC stream into a channel so consumers never
//! touch the backend types.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, DeleteOptions, EventType, GetOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{KvStore, StoreError, WatchEvent};

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// etcd implementation of the datastore port.
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to one datastore member (`host:port`). Large topologies
    /// produce large key ranges, so requests get a generous timeout; the
    /// 16 MiB message ceiling is negotiated by the backend.
    pub async fn connect(endpoint: &str) -> Result<Self, StoreError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(30))
            .with_keep_alive(Duration::from_secs(10), Duration::from_secs(5));
        let client = Client::connect([endpoint], Some(options)).await?;
        debug!("connected to datastore member {endpoint}");
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for item in resp.kvs() {
            pairs.push((item.key_str()?.to_string(), item.value_str()?.to_string()));
        }
        Ok(pairs)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, None).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut kv = self.client.kv_client();
        kv.delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }

    async fn watch_key(&self, key: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        let mut watch_client = self.client.watch_client();
        let (watcher, mut stream) = watch_client.watch(key, None).await?;
        let (tx, rx) = mpsc::channel(16);
        let watched = key.to_string();

        tokio::spawn(async move {
            // The watcher handle must live as long as the stream or the
            // server cancels the watch.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            if event.event_type() != EventType::Put {
                                continue;
                            }
                            let Some(kv) = event.kv() else { continue };
                            let (Ok(k), Ok(v)) = (kv.key_str(), kv.value_str()) else {
                                continue;
                            };
                            let sent = tx
                                .send(WatchEvent {
                                    key: k.to_string(),
                                    value: v.to_string(),
                                })
                                .await;
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("watch stream for '{watched}' closed by server");
                        return;
                    }
                    Err(e) => {
                        warn!("watch stream for '{watched}' failed: {e}");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
