//! Scriptable in-memory daemon for tests
//!
//! [`MockDaemon`] models just enough of a daemon to exercise the
//! reconciler: a reported state, a producer table with start/stop
//! transitions, and duplicate-detection that answers with the benign
//! codes a real peer would. Every verb is appended to a command log so
//! tests can assert exact command streams.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::model::Host;

use super::{CmdReply, CommError, CommFactory, ConnState, Communicator, SharedComm, EBUSY, EEXIST};

const ENOENT: i32 = 2;

/// Shared state of one simulated daemon.
pub struct MockDaemon {
    pub name: String,
    state: Mutex<String>,
    reachable: AtomicBool,
    producers: Mutex<BTreeMap<String, String>>,
    updaters: Mutex<BTreeSet<String>>,
    started_updaters: Mutex<BTreeSet<String>>,
    plugins: Mutex<BTreeSet<String>>,
    running_plugins: Mutex<BTreeSet<String>>,
    storage_policies: Mutex<BTreeSet<String>>,
    started_policies: Mutex<BTreeSet<String>>,
    log: Mutex<Vec<String>>,
}

impl MockDaemon {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new("ready".to_string()),
            reachable: AtomicBool::new(true),
            producers: Mutex::new(BTreeMap::new()),
            updaters: Mutex::new(BTreeSet::new()),
            started_updaters: Mutex::new(BTreeSet::new()),
            plugins: Mutex::new(BTreeSet::new()),
            running_plugins: Mutex::new(BTreeSet::new()),
            storage_policies: Mutex::new(BTreeSet::new()),
            started_policies: Mutex::new(BTreeSet::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: &str) {
        *self.state.lock().unwrap() = state.to_string();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn producer_states(&self) -> BTreeMap<String, String> {
        self.producers.lock().unwrap().clone()
    }

    /// Producers currently started on this daemon, in name order.
    pub fn started_producers(&self) -> Vec<String> {
        self.producers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| state.as_str() != "STOPPED")
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn running_samplers(&self) -> Vec<String> {
        self.running_plugins.lock().unwrap().iter().cloned().collect()
    }

    fn reply(rc: i32) -> CmdReply {
        CmdReply {
            rc,
            payload: Value::Null,
        }
    }

    fn handle(&self, verb: &str, attrs: &BTreeMap<String, String>) -> CmdReply {
        let name = attrs.get("name").cloned().unwrap_or_default();
        match verb {
            "daemon_status" => CmdReply {
                rc: 0,
                payload: json!({ "state": *self.state.lock().unwrap() }),
            },
            "prdcr_status" => {
                let producers = self.producers.lock().unwrap();
                let list: Vec<Value> = producers
                    .iter()
                    .map(|(n, s)| json!({ "name": n, "state": s }))
                    .collect();
                CmdReply {
                    rc: 0,
                    payload: Value::Array(list),
                }
            }
            "smplr_status" => {
                let running = self.running_plugins.lock().unwrap();
                let list: Vec<Value> = running
                    .iter()
                    .map(|n| json!({ "name": n, "state": "running" }))
                    .collect();
                CmdReply {
                    rc: 0,
                    payload: Value::Array(list),
                }
            }
            "prdcr_add" => {
                let mut producers = self.producers.lock().unwrap();
                if producers.contains_key(&name) {
                    Self::reply(EEXIST)
                } else {
                    producers.insert(name, "STOPPED".to_string());
                    Self::reply(0)
                }
            }
            "prdcr_start" => {
                let mut producers = self.producers.lock().unwrap();
                match producers.get_mut(&name) {
                    None => Self::reply(ENOENT),
                    Some(state) if state == "STOPPED" => {
                        *state = "CONNECTED".to_string();
                        Self::reply(0)
                    }
                    Some(_) => Self::reply(EBUSY),
                }
            }
            "prdcr_stop" => {
                let mut producers = self.producers.lock().unwrap();
                match producers.get_mut(&name) {
                    None => Self::reply(ENOENT),
                    Some(state) if state == "STOPPED" => Self::reply(EBUSY),
                    Some(state) => {
                        *state = "STOPPED".to_string();
                        Self::reply(0)
                    }
                }
            }
            "updtr_add" => {
                if self.updaters.lock().unwrap().insert(name) {
                    Self::reply(0)
                } else {
                    Self::reply(EEXIST)
                }
            }
            "updtr_prdcr_add" | "updtr_match_add" | "plugn_config" | "strgp_prdcr_add" => {
                Self::reply(0)
            }
            "updtr_start" => {
                if self.started_updaters.lock().unwrap().insert(name) {
                    Self::reply(0)
                } else {
                    Self::reply(EBUSY)
                }
            }
            "plugn_load" => {
                if self.plugins.lock().unwrap().insert(name) {
                    Self::reply(0)
                } else {
                    Self::reply(EEXIST)
                }
            }
            "plugn_stop" => {
                if self.running_plugins.lock().unwrap().remove(&name) {
                    Self::reply(0)
                } else {
                    Self::reply(EBUSY)
                }
            }
            "smplr_start" => {
                if self.running_plugins.lock().unwrap().insert(name) {
                    Self::reply(0)
                } else {
                    Self::reply(EBUSY)
                }
            }
            "strgp_add" => {
                if self.storage_policies.lock().unwrap().insert(name) {
                    Self::reply(0)
                } else {
                    Self::reply(EEXIST)
                }
            }
            "strgp_start" => {
                if self.started_policies.lock().unwrap().insert(name) {
                    Self::reply(0)
                } else {
                    Self::reply(EBUSY)
                }
            }
            _ => Self::reply(0),
        }
    }
}

/// Communicator bound to one [`MockDaemon`].
pub struct MockCommunicator {
    daemon: Arc<MockDaemon>,
    conn: Mutex<ConnState>,
}

impl MockCommunicator {
    pub fn new(daemon: Arc<MockDaemon>) -> Self {
        Self {
            daemon,
            conn: Mutex::new(ConnState::Disconnected),
        }
    }
}

#[async_trait]
impl Communicator for MockCommunicator {
    fn name(&self) -> &str {
        &self.daemon.name
    }

    fn state(&self) -> ConnState {
        *self.conn.lock().unwrap()
    }

    async fn connect(&self) -> Result<(), CommError> {
        if self.daemon.reachable.load(Ordering::SeqCst) {
            *self.conn.lock().unwrap() = ConnState::Connected;
            Ok(())
        } else {
            *self.conn.lock().unwrap() = ConnState::Disconnected;
            Err(CommError::Transport(format!(
                "{}: unreachable",
                self.daemon.name
            )))
        }
    }

    async fn reconnect(&self) -> Result<(), CommError> {
        *self.conn.lock().unwrap() = ConnState::Disconnected;
        self.connect().await
    }

    async fn close(&self) -> Result<(), CommError> {
        *self.conn.lock().unwrap() = ConnState::Disconnected;
        Ok(())
    }

    async fn command(
        &self,
        verb: &str,
        attrs: &BTreeMap<String, String>,
    ) -> Result<CmdReply, CommError> {
        if !self.daemon.reachable.load(Ordering::SeqCst) {
            *self.conn.lock().unwrap() = ConnState::Disconnected;
            return Err(CommError::Transport(format!(
                "{}: unreachable",
                self.daemon.name
            )));
        }
        let rendered: Vec<String> = attrs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.daemon
            .log
            .lock()
            .unwrap()
            .push(format!("{verb} {}", rendered.join(" ")).trim().to_string());
        Ok(self.daemon.handle(verb, attrs))
    }
}

/// A fleet of simulated daemons keyed by channel name, with a factory
/// the controller-side channel set can use directly.
#[derive(Default)]
pub struct MockFleet {
    daemons: Mutex<BTreeMap<String, Arc<MockDaemon>>>,
}

impl MockFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Daemon for `name`, created reachable and `ready` on first use.
    pub fn daemon(&self, name: &str) -> Arc<MockDaemon> {
        self.daemons
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| MockDaemon::new(name))
            .clone()
    }

    pub fn factory(self: &Arc<Self>) -> CommFactory {
        let fleet = Arc::clone(self);
        Box::new(move |name: &str, _host: &Host| -> SharedComm {
            Arc::new(MockCommunicator::new(fleet.daemon(name)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_commands() {
        let daemon = MockDaemon::new("agg-1");
        let comm = MockCommunicator::new(Arc::clone(&daemon));
        comm.connect().await.unwrap();
        comm.prdcr_start("p1").await.unwrap();
        assert_eq!(daemon.log(), vec!["prdcr_start name=p1"]);
    }

    #[tokio::test]
    async fn test_mock_producer_lifecycle() {
        let daemon = MockDaemon::new("agg-1");
        let comm = MockCommunicator::new(Arc::clone(&daemon));

        let reply = comm
            .prdcr_add("p1", crate::model::ProducerType::Active, "sock", "n1", 411, 20_000_000)
            .await
            .unwrap();
        assert!(reply.ok());

        // Re-add reports EEXIST, start transitions, double start is busy
        assert!(comm
            .prdcr_add("p1", crate::model::ProducerType::Active, "sock", "n1", 411, 20_000_000)
            .await
            .unwrap()
            .benign());
        assert!(comm.prdcr_start("p1").await.unwrap().ok());
        assert!(comm.prdcr_start("p1").await.unwrap().benign());
        assert_eq!(daemon.started_producers(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_mock_unreachable() {
        let daemon = MockDaemon::new("agg-1");
        daemon.set_reachable(false);
        let comm = MockCommunicator::new(Arc::clone(&daemon));
        assert!(comm.connect().await.is_err());
        assert!(comm.daemon_status().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_daemon_status_payload() {
        let daemon = MockDaemon::new("agg-1");
        daemon.set_state("running");
        let comm = MockCommunicator::new(Arc::clone(&daemon));
        comm.connect().await.unwrap();
        let status = comm.daemon_status().await.unwrap();
        assert_eq!(status.state, "running");
    }
}
