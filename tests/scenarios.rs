//! End-to-end scenarios over the in-memory datastore and mock daemons
//!
//! These tests run the full path a deployment exercises: a description
//! file is expanded and saved, the monitor loads it back, and
//! reconciliation passes drive a fleet of simulated daemons. No network
//! and no real datastore are involved.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;

use ldmsctl::comm::mock::MockFleet;
use ldmsctl::comm::CommSet;
use ldmsctl::controller::{self, Monitor};
use ldmsctl::model::{DaemonState, DesiredState};
use ldmsctl::reconcile::Reconciler;
use ldmsctl::store::{self, KvStore, MemStore};

fn temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const FLEET: &str = r#"
hosts:
  - names: "nid[0001-0005]-[10001-10002]"
    hosts: "nid[0001-0005]"
    ports: "[10001-10002]"
  - names: "agg-[1-4]"
    hosts: "head[1-4]"
    ports: "411"
aggregators:
  - names: "l1-agg-[1-4]"
    group: l1
    hosts: "agg-[1-4]"
producers:
  - names: "nid[0001-0005]-[10001-10002]"
    hosts: "nid[0001-0005]-[10001-10002]"
    group: l1
    updaters: all
    reconnect: 20s
    type: active
updaters:
  - name: all
    group: l1
    interval: 1s
    sets:
      - regex: ".*"
    producers:
      - regex: ".*"
"#;

const SAMPLER_FLEET_V1: &str = r#"
hosts:
  - names: "nid[01-02]"
    hosts: "nid[01-02]"
    ports: "10001"
samplers:
  - names: "nid[01-02]"
    config:
      - name: meminfo
        interval: "1.0s:0ms"
"#;

const SAMPLER_FLEET_V2: &str = r#"
hosts:
  - names: "nid[01-02]"
    hosts: "nid[01-02]"
    ports: "10001"
samplers:
  - names: "nid[01-02]"
    config:
      - name: vmstat
        interval: "2.0s:0ms"
"#;

/// S1: row-major name assignment across the host x port grid.
#[tokio::test]
async fn scenario_expansion_row_major() {
    let store = MemStore::new();
    let file = temp_file(
        r#"
hosts:
  - names: "nid[0001-0002]-[10001-10002]"
    hosts: "nid[0001-0002]"
    ports: "[10001-10002]"
"#,
    );
    controller::run_configure(&store, "tel", file.path())
        .await
        .unwrap();

    let state = store::load_config(&store, "tel").await.unwrap();
    assert_eq!(state.hosts.len(), 4);
    for (name, addr, port) in [
        ("nid0001-10001", "nid0001", 10001),
        ("nid0001-10002", "nid0001", 10002),
        ("nid0002-10001", "nid0002", 10001),
        ("nid0002-10002", "nid0002", 10002),
    ] {
        let host = &state.hosts[name];
        assert_eq!(host.addr, addr);
        assert_eq!(host.port, port);
    }
}

/// S3: ten producers over four ready aggregators split 3,3,2,2.
#[tokio::test]
async fn scenario_uneven_split() {
    let store = MemStore::new();
    let file = temp_file(FLEET);
    controller::run_configure(&store, "tel", file.path())
        .await
        .unwrap();
    let desired = store::load_config(&store, "tel").await.unwrap();

    let fleet = MockFleet::new();
    let comms = CommSet::new(fleet.factory());
    let mut reconciler = Reconciler::new();
    let report = reconciler.pass(&desired, &comms, true).await;

    let assignment = &report.assignments["l1"];
    let sizes: Vec<usize> = (1..=4)
        .map(|i| assignment[&format!("l1-agg-{i}")].len())
        .collect();
    assert_eq!(sizes, vec![3, 3, 2, 2]);

    // Conservation: every declared producer assigned exactly once
    let mut assigned: Vec<&String> = assignment.values().flatten().collect();
    assigned.sort();
    assigned.dedup();
    assert_eq!(assigned.len(), 10);
}

/// S4: one unhealthy aggregator redistributes 4,3,3; recovery rebalances.
#[tokio::test]
async fn scenario_failover_and_recovery() {
    let store = MemStore::new();
    let file = temp_file(FLEET);
    controller::run_configure(&store, "tel", file.path())
        .await
        .unwrap();
    let desired = store::load_config(&store, "tel").await.unwrap();

    let fleet = MockFleet::new();
    fleet.daemon("l1-agg-2").set_state("stopped");
    let comms = CommSet::new(fleet.factory());
    let mut reconciler = Reconciler::new();

    let report = reconciler.pass(&desired, &comms, true).await;
    assert_eq!(report.agg_states["l1-agg-2"], DaemonState::Stopped);
    let assignment = &report.assignments["l1"];
    assert_eq!(assignment["l1-agg-1"].len(), 4);
    assert_eq!(assignment["l1-agg-3"].len(), 3);
    assert_eq!(assignment["l1-agg-4"].len(), 3);
    assert!(!assignment.contains_key("l1-agg-2"));
    assert!(fleet.daemon("l1-agg-2").started_producers().is_empty());

    // Recovery: the state transition alone must trigger a rebalance
    fleet.daemon("l1-agg-2").set_state("ready");
    let report = reconciler.pass(&desired, &comms, false).await;
    assert!(report.rebalanced);
    let assignment = &report.assignments["l1"];
    let sizes: Vec<usize> = (1..=4)
        .map(|i| assignment[&format!("l1-agg-{i}")].len())
        .collect();
    assert_eq!(sizes, vec![3, 3, 2, 2]);
    for i in 1..=4 {
        assert_eq!(
            fleet
                .daemon(&format!("l1-agg-{i}"))
                .started_producers()
                .len(),
            assignment[&format!("l1-agg-{i}")].len(),
        );
    }
}

/// A `running` (not `ready`) aggregator receives adds but no assignment.
#[tokio::test]
async fn scenario_running_peer_excluded_from_balance() {
    let store = MemStore::new();
    let file = temp_file(FLEET);
    controller::run_configure(&store, "tel", file.path())
        .await
        .unwrap();
    let desired = store::load_config(&store, "tel").await.unwrap();

    let fleet = MockFleet::new();
    fleet.daemon("l1-agg-1").set_state("running");
    let comms = CommSet::new(fleet.factory());
    let mut reconciler = Reconciler::new();
    let report = reconciler.pass(&desired, &comms, true).await;

    assert!(!report.assignments["l1"].contains_key("l1-agg-1"));
    // Fan-out still adds every producer for cheap failover later
    assert_eq!(fleet.daemon("l1-agg-1").producer_states().len(), 10);
    assert!(fleet.daemon("l1-agg-1").started_producers().is_empty());
}

/// Steady-state idempotence: a forced second pass issues only commands
/// the peers absorb as benign, leaving daemon state untouched.
#[tokio::test]
async fn scenario_steady_state_idempotent() {
    let store = MemStore::new();
    let file = temp_file(FLEET);
    controller::run_configure(&store, "tel", file.path())
        .await
        .unwrap();
    let desired = store::load_config(&store, "tel").await.unwrap();

    let fleet = MockFleet::new();
    let comms = CommSet::new(fleet.factory());
    let mut reconciler = Reconciler::new();

    reconciler.pass(&desired, &comms, true).await;
    let before: Vec<_> = (1..=4)
        .map(|i| fleet.daemon(&format!("l1-agg-{i}")).producer_states())
        .collect();

    reconciler.pass(&desired, &comms, true).await;
    let after: Vec<_> = (1..=4)
        .map(|i| fleet.daemon(&format!("l1-agg-{i}")).producer_states())
        .collect();
    assert_eq!(before, after);
}

/// Saving twice yields identical keyspaces except the commit sentinel.
#[tokio::test]
async fn scenario_save_idempotent() {
    let store = MemStore::new();
    let file = temp_file(FLEET);
    controller::run_configure(&store, "tel", file.path())
        .await
        .unwrap();
    let mut first = store.dump();
    controller::run_configure(&store, "tel", file.path())
        .await
        .unwrap();
    let mut second = store.dump();

    first.remove("/tel/last_updated");
    second.remove("/tel/last_updated");
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

/// Datastore round-trip: what the monitor loads equals what was expanded.
#[tokio::test]
async fn scenario_datastore_round_trip() {
    let store = MemStore::new();
    let file = temp_file(FLEET);

    let tree = controller::load_description(file.path()).unwrap();
    let expanded = DesiredState::from_description(&tree).unwrap();
    store::save_config(&store, "tel", &expanded).await.unwrap();

    let mut loaded = store::load_config(&store, "tel").await.unwrap();
    assert!(loaded.last_updated > 0.0);
    loaded.last_updated = 0.0;
    assert_eq!(loaded, expanded);
}

/// S6: a description change while the monitor runs triggers exactly one
/// reload; sampler reconfiguration stops the old plugin set and starts
/// the new one.
#[tokio::test(start_paused = true)]
async fn scenario_description_change_restarts_samplers() {
    let store = Arc::new(MemStore::new());
    let file = temp_file(SAMPLER_FLEET_V1);
    controller::run_configure(store.as_ref(), "tel", file.path())
        .await
        .unwrap();

    let fleet = MockFleet::new();
    let monitor = Monitor::new(
        Arc::clone(&store) as Arc<dyn KvStore>,
        "tel",
        fleet.factory(),
        false,
    )
    .await
    .unwrap();
    tokio::spawn(monitor.run());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fleet.daemon("nid01").running_samplers(), vec!["meminfo"]);
    assert_eq!(fleet.daemon("nid02").running_samplers(), vec!["meminfo"]);

    let next = temp_file(SAMPLER_FLEET_V2);
    controller::run_configure(store.as_ref(), "tel", next.path())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(fleet.daemon("nid01").running_samplers(), vec!["vmstat"]);
    assert_eq!(fleet.daemon("nid02").running_samplers(), vec!["vmstat"]);

    // Exactly one reload: the stale plugin was stopped once per host
    let stops: Vec<String> = fleet
        .daemon("nid01")
        .log()
        .into_iter()
        .filter(|l| l.starts_with("plugn_stop"))
        .collect();
    assert_eq!(stops, vec!["plugn_stop name=meminfo"]);
}
