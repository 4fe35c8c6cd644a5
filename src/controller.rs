//! Controller lifecycles
//!
//! Two supervisors share this module. The configurer loads a declarative
//! description, expands it, and rewrites the datastore keyspace. The
//! monitor loads the expanded state back, opens one long-lived channel
//! per daemon, watches the commit sentinel, and drains a single event
//! queue (1 Hz ticks plus datastore changes) so that no two
//! reconciliation passes ever overlap and no pass overlaps a change
//! handler.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::comm::{CommFactory, CommSet, ConnState};
use crate::kvtree::KvNode;
use crate::model::{DesiredState, TopologyError};
use crate::reconcile::Reconciler;
use crate::store::{self, KvStore, LoadError, StoreError, WatchEvent};

/// Seconds between reconciliation ticks.
pub const RECONCILE_INTERVAL_SECS: u64 = 1;

/// Daemon binary spawned by `--start-aggregators`.
pub const AGGREGATOR_BIN: &str = "ldmsd";

/// Memory reservation passed to spawned aggregators.
const AGGREGATOR_MEM: &str = "2g";

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cluster file '{0}' lists no members")]
    NoMembers(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// One datastore member endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterMember {
    pub host: String,
    pub port: u16,
}

/// The datastore members document: `cluster: <name>` plus `members`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub cluster: String,
    #[serde(default)]
    pub members: Vec<ClusterMember>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        let content = std::fs::read_to_string(path).map_err(|source| ControllerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: ClusterConfig =
            serde_yaml::from_str(&content).map_err(|source| ControllerError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if config.members.is_empty() {
            return Err(ControllerError::NoMembers(path.display().to_string()));
        }
        Ok(config)
    }

    /// The member the controller connects to. Remaining members are
    /// reserved for future failover.
    pub fn primary_endpoint(&self) -> String {
        let member = &self.members[0];
        format!("{}:{}", member.host, member.port)
    }
}

/// Read a declarative description file into the generic tree.
pub fn load_description(path: &Path) -> Result<KvNode, ControllerError> {
    let content = std::fs::read_to_string(path).map_err(|source| ControllerError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|source| ControllerError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    Ok(KvNode::from_yaml(&value).unwrap_or_else(KvNode::map))
}

/// Configure-once: expand the description and rewrite `/<prefix>/`.
pub async fn run_configure(
    store: &dyn KvStore,
    prefix: &str,
    description: &Path,
) -> Result<(), ControllerError> {
    let tree = load_description(description)?;
    let state = DesiredState::from_description(&tree)?;
    let committed = store::save_config(store, prefix, &state).await?;
    info!(
        "saved configuration under /{}/ ({} hosts, {} aggregator groups, committed {committed:.6})",
        prefix.trim_matches('/'),
        state.hosts.len(),
        state.aggregators.len(),
    );
    Ok(())
}

/// Monitor-forever supervisor.
pub struct Monitor {
    store: Arc<dyn KvStore>,
    prefix: String,
    comms: CommSet,
    reconciler: Reconciler,
    desired: DesiredState,
    changed: bool,
    start_aggregators: bool,
}

impl Monitor {
    /// Load the current desired state and prepare the channel set.
    /// Configuration errors here are fatal at startup.
    pub async fn new(
        store: Arc<dyn KvStore>,
        prefix: &str,
        factory: CommFactory,
        start_aggregators: bool,
    ) -> Result<Self, ControllerError> {
        let desired = store::load_config(store.as_ref(), prefix).await?;
        info!(
            "loaded desired state: {} hosts, {} aggregator groups, {} sampler groups",
            desired.hosts.len(),
            desired.aggregators.len(),
            desired.samplers.len(),
        );

        // One long-lived channel per aggregator, reused across passes.
        let comms = CommSet::new(factory);
        for agg in desired.all_aggregators() {
            match desired.host(&agg.host) {
                Some(host) => {
                    comms.get_or_create(&agg.name, host);
                }
                None => warn!("aggregator {}: unknown host '{}'", agg.name, agg.host),
            }
        }

        Ok(Self {
            store,
            prefix: prefix.to_string(),
            comms,
            reconciler: Reconciler::new(),
            desired,
            changed: true,
            start_aggregators,
        })
    }

    /// Run until interrupted. One worker drains the tick/change queue;
    /// a pass runs at most once per tick and only when a peer transition
    /// or a datastore change was observed.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        if self.start_aggregators {
            self.spawn_aggregators().await;
        }

        let sentinel = store::sentinel_key(&self.prefix);
        let mut watch_rx = self.store.watch_key(&sentinel).await?;
        let mut ticker = tokio::time::interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let changed = std::mem::take(&mut self.changed);
                    self.reconciler.pass(&self.desired, &self.comms, changed).await;
                }
                event = watch_rx.recv() => {
                    match event {
                        Some(event) => {
                            // The watch boundary never propagates; a bad
                            // handler run is logged and retried on the
                            // next commit.
                            if let Err(e) = self.handle_change(&event).await {
                                error!("change handler ({}): {e}", event.key);
                            }
                        }
                        None => {
                            warn!("datastore watch closed, re-establishing");
                            match self.store.watch_key(&sentinel).await {
                                Ok(rx) => watch_rx = rx,
                                Err(e) => {
                                    error!("re-watch failed: {e}");
                                    tokio::time::sleep(Duration::from_secs(
                                        RECONCILE_INTERVAL_SECS,
                                    ))
                                    .await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Reload the desired state after a commit and run the per-section
    /// handlers. Only samplers need work: stale plugins are stopped here
    /// and the new set is brought up by the next pass, which re-reads
    /// and re-applies everything else anyway.
    async fn handle_change(&mut self, event: &WatchEvent) -> Result<(), ControllerError> {
        info!("configuration commit observed ({} = {})", event.key, event.value);
        let next = store::load_config(self.store.as_ref(), &self.prefix).await?;
        self.stop_stale_samplers(&next).await;
        self.desired = next;
        self.changed = true;
        Ok(())
    }

    async fn stop_stale_samplers(&self, next: &DesiredState) {
        for (key, old_group) in &self.desired.samplers {
            let next_group = next.samplers.get(key);
            for host_name in &old_group.hosts {
                let kept_host =
                    next_group.is_some_and(|g| g.hosts.iter().any(|h| h == host_name));
                for plugin in &old_group.plugins {
                    let unchanged = kept_host
                        && next_group.is_some_and(|g| g.plugins.iter().any(|p| p == plugin));
                    if unchanged {
                        continue;
                    }
                    let Some(comm) = self.comms.get(host_name) else {
                        continue;
                    };
                    if comm.state() != ConnState::Connected {
                        continue;
                    }
                    match comm.plugn_stop(&plugin.name).await {
                        Ok(reply) if reply.ok() || reply.benign() => {
                            info!("{host_name}: stopped sampler plugin {}", plugin.name);
                        }
                        Ok(reply) => {
                            warn!("{host_name}: plugn_stop {} rc={}", plugin.name, reply.rc);
                        }
                        Err(e) => {
                            warn!("{host_name}: plugn_stop {}: {e}", plugin.name);
                        }
                    }
                }
            }
        }
    }

    /// Spawn one aggregator daemon per aggregator host. Failures are
    /// logged; the reconciler keeps retrying the peer either way.
    async fn spawn_aggregators(&self) {
        for agg in self.desired.all_aggregators() {
            let Some(host) = self.desired.host(&agg.host) else {
                warn!("aggregator {}: unknown host '{}'", agg.name, agg.host);
                continue;
            };
            let spawned = tokio::process::Command::new(AGGREGATOR_BIN)
                .arg("-x")
                .arg(format!("{}:{}", host.xprt, host.port))
                .arg("-a")
                .arg(&host.auth.name)
                .arg("-l")
                .arg(format!("log/{}.log", agg.name))
                .arg("-m")
                .arg(AGGREGATOR_MEM)
                .arg("-r")
                .arg(format!("log/{}.pid", agg.name))
                .spawn();
            match spawned {
                Ok(child) => info!(
                    "spawned {AGGREGATOR_BIN} for {} (pid {:?})",
                    agg.name,
                    child.id()
                ),
                Err(e) => warn!("failed to spawn {AGGREGATOR_BIN} for {}: {e}", agg.name),
            }
        }
    }
}
