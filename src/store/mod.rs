//! Datastore access
//!
//! The consensus datastore is an external collaborator; everything in the
//! control plane reaches it through the [`KvStore`] port. The etcd-backed
//! implementation lives in [`etcd`]; [`MemStore`] is a substitutable
//! in-memory implementation used by tests and scenario suites.
//!
//! A full save deletes every key under `/<prefix>/`, re-emits the graph
//! best-effort per key, and finishes with the single `last_updated` write.
//! That final write is the atomic commit point watchers observe.

pub mod etcd;

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::kvtree;
use crate::model::{DesiredState, TopologyError};

/// Errors from the datastore backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("datastore error: {0}")]
    Backend(String),
}

/// Errors from loading a desired state out of the datastore.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// A key change observed by a watcher. Only puts are delivered; the
/// commit sentinel is never deleted in place.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub value: String,
}

/// Minimal async port over the consensus datastore.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError>;

    /// Watch a single key for puts. Events arrive on the returned channel
    /// for as long as the receiver is held.
    async fn watch_key(&self, key: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError>;
}

/// Normalize a cluster prefix into its key base (`tel` → `/tel`).
pub fn key_base(prefix: &str) -> String {
    format!("/{}", prefix.trim_matches('/'))
}

/// Key of the commit sentinel for a prefix.
pub fn sentinel_key(prefix: &str) -> String {
    format!("{}/last_updated", key_base(prefix))
}

/// Project a desired state into the datastore.
///
/// Per-key failures are logged and the save continues; only a failed
/// sentinel write fails the save, since without it watchers never observe
/// the commit. Returns the committed timestamp.
pub async fn save_config(
    store: &dyn KvStore,
    prefix: &str,
    state: &DesiredState,
) -> Result<f64, StoreError> {
    let base = key_base(prefix);

    if let Err(e) = store.delete_prefix(&format!("{base}/")).await {
        warn!("failed to clear '{base}/' before save: {e}");
    }

    let pairs = state.to_tree().walk(&base);
    let total = pairs.len();
    let mut written = 0usize;
    for (key, value) in pairs {
        match store.put(&key, &value).await {
            Ok(()) => written += 1,
            Err(e) => error!("failed to write '{key}': {e}"),
        }
    }
    debug!("wrote {written}/{total} keys under {base}/");

    let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    store
        .put(&sentinel_key(prefix), &format!("{now:.6}"))
        .await?;
    Ok(now)
}

/// Read the desired state back out of the datastore.
pub async fn load_config(store: &dyn KvStore, prefix: &str) -> Result<DesiredState, LoadError> {
    let base = key_base(prefix);
    let range = format!("{base}/");
    let pairs = store.get_prefix(&range).await?;
    let relative = pairs
        .into_iter()
        .map(|(k, v)| (k.strip_prefix(&range).unwrap_or(&k).to_string(), v));
    let tree = kvtree::reflect(relative);
    Ok(DesiredState::from_tree(&tree)?)
}

/// In-memory datastore with single-key watch support.
#[derive(Default)]
pub struct MemStore {
    data: Mutex<BTreeMap<String, String>>,
    watchers: Mutex<Vec<(String, mpsc::Sender<WatchEvent>)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the full keyspace, for assertions.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.data.lock().unwrap().clone()
    }

    fn notify(&self, key: &str, value: &str) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|(watched, tx)| {
            if watched == key {
                // A backlogged watcher just misses the event; the next
                // commit delivers a fresh one.
                let _ = tx.try_send(WatchEvent {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
            !tx.is_closed()
        });
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.notify(key, value);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn watch_key(&self, key: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        let (tx, rx) = mpsc::channel(16);
        self.watchers.lock().unwrap().push((key.to_string(), tx));
        Ok(rx)
    }
}
