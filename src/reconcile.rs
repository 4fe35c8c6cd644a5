//! Reconciliation pass
//!
//! One pass drives the fleet toward the desired state: sweep aggregator
//! health, decide whether the balance changed, then (re)apply samplers,
//! producers, updaters, and storage policies, and finally diff producer
//! start/stop against the balanced assignment.
//!
//! Every desired-state verb is idempotent. The benign codes `EBUSY` and
//! `EEXIST` make a pass correct whether or not the previous pass
//! completed, so nothing ever rolls back; a failing peer is skipped for
//! the remainder of the pass and retried on the next tick.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::balance::{balance_group, GroupAssignment};
use crate::comm::{CmdReply, CommError, CommSet, ConnState, SharedComm, UpdtrMode};
use crate::interval::parse_interval;
use crate::model::{Aggregator, DaemonState, DesiredState, SamplerGroup, StorePolicy, Updater};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Swept aggregator states, by aggregator name
    pub agg_states: BTreeMap<String, DaemonState>,
    /// Whether the balancing steps ran
    pub rebalanced: bool,
    /// Producer assignment per group, when rebalanced
    pub assignments: BTreeMap<String, GroupAssignment>,
}

/// Sequential reconciler. Holds the previous pass's aggregator states to
/// detect peer transitions and failover.
#[derive(Default)]
pub struct Reconciler {
    prev_states: BTreeMap<String, DaemonState>,
}

/// Outcome of issuing one verb against one peer.
enum Issue {
    /// Verb succeeded or the state already held
    Done,
    /// Non-benign reply; the step is skipped, the peer stays usable
    Skipped,
    /// Transport failure; the peer is unusable for the rest of the pass
    Lost,
}

fn triage(peer: &str, what: &str, result: Result<CmdReply, CommError>) -> Issue {
    match result {
        Ok(reply) if reply.ok() || reply.benign() => Issue::Done,
        Ok(reply) => {
            warn!("{peer}: {what} failed rc={}", reply.rc);
            Issue::Skipped
        }
        Err(e) => {
            warn!("{peer}: {what}: {e}");
            Issue::Lost
        }
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one pass. `changed` forces rebalancing (a datastore change was
    /// observed since the last pass).
    pub async fn pass(
        &mut self,
        desired: &DesiredState,
        comms: &CommSet,
        changed: bool,
    ) -> PassReport {
        let agg_states = self.health_sweep(desired, comms).await;

        let rebalance = changed || agg_states != self.prev_states;
        self.prev_states = agg_states.clone();

        if !rebalance {
            return PassReport {
                agg_states,
                ..Default::default()
            };
        }
        debug!("rebalancing: changed={changed}");

        let assignments = self.compute_assignments(desired, &agg_states);

        self.apply_samplers(desired, comms).await;
        self.fan_out_producers(desired, comms).await;
        self.apply_updaters(desired, comms).await;
        self.apply_stores(desired, comms).await;
        self.apply_assignments(desired, comms, &assignments).await;

        PassReport {
            agg_states,
            rebalanced: true,
            assignments,
        }
    }

    /// Ensure every aggregator channel is connected and collect daemon
    /// states. Unreachable peers are `stopped`; no error escapes.
    async fn health_sweep(
        &self,
        desired: &DesiredState,
        comms: &CommSet,
    ) -> BTreeMap<String, DaemonState> {
        let mut probes = Vec::new();
        for agg in desired.all_aggregators() {
            let Some(host) = desired.host(&agg.host) else {
                warn!("aggregator {}: unknown host '{}'", agg.name, agg.host);
                continue;
            };
            let comm = comms.get_or_create(&agg.name, host);
            let name = agg.name.clone();
            probes.push(async move {
                if comm.state() != ConnState::Connected && comm.reconnect().await.is_err() {
                    return (name, DaemonState::Stopped);
                }
                match comm.daemon_status().await {
                    Ok(status) => (name, DaemonState::parse(&status.state)),
                    Err(_) => (name, DaemonState::Stopped),
                }
            });
        }

        let mut states = BTreeMap::new();
        for (name, state) in join_all(probes).await {
            states.insert(name, state);
        }
        states
    }

    fn compute_assignments(
        &self,
        desired: &DesiredState,
        agg_states: &BTreeMap<String, DaemonState>,
    ) -> BTreeMap<String, GroupAssignment> {
        let mut assignments = BTreeMap::new();
        for (group, producers) in &desired.producers {
            let Some(aggs) = desired.aggregators.get(group) else {
                continue;
            };
            let ready: Vec<&Aggregator> = aggs
                .iter()
                .filter(|a| agg_states.get(&a.name) == Some(&DaemonState::Ready))
                .collect();
            if ready.is_empty() {
                info!("group {group}: no ready aggregator, skipping balance");
                continue;
            }
            let assignment = balance_group(producers, &ready);
            debug!(
                "group {group}: {} producers over {} ready aggregators",
                producers.len(),
                ready.len()
            );
            assignments.insert(group.clone(), assignment);
        }
        assignments
    }

    /// Bring up sampler plugins host by host. Loss of connectivity aborts
    /// that host's bring-up, never the pass.
    async fn apply_samplers(&self, desired: &DesiredState, comms: &CommSet) {
        for group in desired.samplers.values() {
            for host_name in &group.hosts {
                let Some(host) = desired.host(host_name) else {
                    warn!("sampler '{host_name}': not in hosts section");
                    continue;
                };
                let comm = comms.get_or_create(host_name, host);
                if comm.state() != ConnState::Connected && comm.connect().await.is_err() {
                    warn!("sampler {host_name}: unreachable, skipping bring-up");
                    continue;
                }
                self.bring_up_sampler(&comm, host_name, group).await;
            }
        }
    }

    async fn bring_up_sampler(&self, comm: &SharedComm, host_name: &str, group: &SamplerGroup) {
        for plugin in &group.plugins {
            match triage(host_name, "plugn_load", comm.plugn_load(&plugin.name).await) {
                Issue::Lost => return,
                Issue::Skipped => continue,
                Issue::Done => {}
            }

            let mut params = plugin.config.clone();
            params.insert("producer".to_string(), host_name.to_string());
            params.insert(
                "instance".to_string(),
                format!("{host_name}/{}", plugin.name),
            );
            match triage(
                host_name,
                "plugn_config",
                comm.plugn_config(&plugin.name, &params).await,
            ) {
                Issue::Lost => return,
                Issue::Skipped => continue,
                Issue::Done => {}
            }

            if let Issue::Lost = triage(
                host_name,
                "smplr_start",
                comm.smplr_start(&plugin.name, &plugin.interval).await,
            ) {
                return;
            }
        }
    }

    /// Add every desired producer on every aggregator of its group, so a
    /// failover is a cheap start rather than a full re-add.
    async fn fan_out_producers(&self, desired: &DesiredState, comms: &CommSet) {
        for (group, producers) in &desired.producers {
            let Some(aggs) = desired.aggregators.get(group) else {
                continue;
            };
            for agg in aggs {
                let Some(comm) = comms.get(&agg.name) else {
                    continue;
                };
                if comm.state() != ConnState::Connected {
                    continue;
                }
                let known: BTreeSet<String> = match comm.prdcr_status().await {
                    Ok(list) => list.into_iter().map(|p| p.name).collect(),
                    Err(e) => {
                        warn!("{}: prdcr_status: {e}", agg.name);
                        continue;
                    }
                };
                for producer in producers {
                    if known.contains(&producer.name) {
                        continue;
                    }
                    let Some(host) = desired.host(&producer.host) else {
                        warn!("producer {}: unknown host '{}'", producer.name, producer.host);
                        continue;
                    };
                    let Ok(reconnect_us) = parse_interval(&producer.reconnect) else {
                        warn!(
                            "producer {}: bad reconnect '{}'",
                            producer.name, producer.reconnect
                        );
                        continue;
                    };
                    let result = comm
                        .prdcr_add(
                            &producer.name,
                            producer.ptype,
                            &host.xprt,
                            &host.addr,
                            host.port,
                            reconnect_us,
                        )
                        .await;
                    if let Issue::Lost = triage(&agg.name, "prdcr_add", result) {
                        break;
                    }
                }
            }
        }
    }

    async fn apply_updaters(&self, desired: &DesiredState, comms: &CommSet) {
        for (group, updaters) in &desired.updaters {
            let Some(aggs) = desired.aggregators.get(group) else {
                continue;
            };
            for agg in aggs {
                let Some(comm) = comms.get(&agg.name) else {
                    continue;
                };
                if comm.state() != ConnState::Connected {
                    continue;
                }
                for updater in updaters {
                    if self.apply_updater(&comm, &agg.name, updater).await {
                        continue;
                    }
                    break;
                }
            }
        }
    }

    /// Returns false when the peer was lost.
    async fn apply_updater(&self, comm: &SharedComm, peer: &str, updater: &Updater) -> bool {
        let mode = if let Some(push) = &updater.push {
            UpdtrMode::Push(push.clone())
        } else if let Some(auto) = &updater.auto {
            UpdtrMode::Auto(auto.clone())
        } else {
            match parse_interval(&updater.interval) {
                Ok(us) => UpdtrMode::Interval(us),
                Err(e) => {
                    warn!("updater {}: {e}", updater.name);
                    return true;
                }
            }
        };

        match triage(peer, "updtr_add", comm.updtr_add(&updater.name, &mode).await) {
            Issue::Lost => return false,
            Issue::Skipped => return true,
            Issue::Done => {}
        }
        for regex in &updater.producers {
            if let Issue::Lost = triage(
                peer,
                "updtr_prdcr_add",
                comm.updtr_prdcr_add(&updater.name, regex).await,
            ) {
                return false;
            }
        }
        for set in &updater.sets {
            if let Issue::Lost = triage(
                peer,
                "updtr_match_add",
                comm.updtr_match_add(&updater.name, &set.regex, set.field.as_deref())
                    .await,
            ) {
                return false;
            }
        }
        !matches!(
            triage(peer, "updtr_start", comm.updtr_start(&updater.name).await),
            Issue::Lost
        )
    }

    async fn apply_stores(&self, desired: &DesiredState, comms: &CommSet) {
        for (group, stores) in &desired.stores {
            let Some(aggs) = desired.aggregators.get(group) else {
                continue;
            };
            for agg in aggs {
                let Some(comm) = comms.get(&agg.name) else {
                    continue;
                };
                if comm.state() != ConnState::Connected {
                    continue;
                }
                for store in stores {
                    if self.apply_store(&comm, &agg.name, store).await {
                        continue;
                    }
                    break;
                }
            }
        }
    }

    /// Returns false when the peer was lost.
    async fn apply_store(&self, comm: &SharedComm, peer: &str, store: &StorePolicy) -> bool {
        match triage(peer, "plugn_load", comm.plugn_load(&store.plugin.name).await) {
            Issue::Lost => return false,
            Issue::Skipped => return true,
            Issue::Done => {}
        }
        match triage(
            peer,
            "plugn_config",
            comm.plugn_config(&store.plugin.name, &store.plugin.config)
                .await,
        ) {
            Issue::Lost => return false,
            Issue::Skipped => return true,
            Issue::Done => {}
        }
        match triage(
            peer,
            "strgp_add",
            comm.strgp_add(&store.name, &store.plugin.name, &store.container, &store.schema)
                .await,
        ) {
            Issue::Lost => return false,
            Issue::Skipped => return true,
            Issue::Done => {}
        }
        if let Issue::Lost = triage(
            peer,
            "strgp_prdcr_add",
            comm.strgp_prdcr_add(&store.name, ".*").await,
        ) {
            return false;
        }
        !matches!(
            triage(peer, "strgp_start", comm.strgp_start(&store.name).await),
            Issue::Lost
        )
    }

    /// Diff each aggregator's reported producers against its assignment
    /// and issue the start/stop transitions.
    async fn apply_assignments(
        &self,
        desired: &DesiredState,
        comms: &CommSet,
        assignments: &BTreeMap<String, GroupAssignment>,
    ) {
        for (group, aggs) in &desired.aggregators {
            // A group with no ready aggregator was skipped by balancing;
            // leave its peers untouched.
            let Some(group_assignment) = assignments.get(group) else {
                continue;
            };
            for agg in aggs {
                let Some(comm) = comms.get(&agg.name) else {
                    continue;
                };
                if comm.state() != ConnState::Connected {
                    continue;
                }
                let reported = match comm.prdcr_status().await {
                    Ok(list) => list,
                    Err(e) => {
                        warn!("{}: prdcr_status: {e}", agg.name);
                        continue;
                    }
                };
                let assigned: &[String] = group_assignment
                    .get(&agg.name)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let assigned_set: BTreeSet<&str> =
                    assigned.iter().map(String::as_str).collect();
                let states: BTreeMap<&str, bool> = reported
                    .iter()
                    .map(|p| (p.name.as_str(), p.is_stopped()))
                    .collect();

                for name in assigned {
                    if states.get(name.as_str()) == Some(&true) {
                        if let Issue::Lost =
                            triage(&agg.name, "prdcr_start", comm.prdcr_start(name).await)
                        {
                            break;
                        }
                    }
                }
                for producer in &reported {
                    if !producer.is_stopped() && !assigned_set.contains(producer.name.as_str()) {
                        if let Issue::Lost = triage(
                            &agg.name,
                            "prdcr_stop",
                            comm.prdcr_stop(&producer.name).await,
                        ) {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mock::MockFleet;
    use crate::kvtree::KvNode;

    fn state_from(yaml: &str) -> DesiredState {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        DesiredState::from_description(&KvNode::from_yaml(&value).unwrap()).unwrap()
    }

    fn fleet_state() -> DesiredState {
        state_from(
            r#"
hosts:
  - names: "nid[01-08]"
    hosts: "nid[01-08]"
    ports: "10001"
  - names: "head[1-4]"
    hosts: "head[1-4]"
    ports: "411"
aggregators:
  - names: "agg-[1-4]"
    group: l1
    hosts: "head[1-4]"
producers:
  - names: "nid[01-08]"
    hosts: "nid[01-08]"
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
"#,
        )
    }

    #[tokio::test]
    async fn test_even_split_across_ready_aggregators() {
        let desired = fleet_state();
        let fleet = MockFleet::new();
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();

        let report = reconciler.pass(&desired, &comms, true).await;
        assert!(report.rebalanced);
        for i in 1..=4 {
            assert_eq!(fleet.daemon(&format!("agg-{i}")).started_producers().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_unreachable_aggregator_marked_stopped() {
        let desired = fleet_state();
        let fleet = MockFleet::new();
        fleet.daemon("agg-2").set_reachable(false);
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();

        let report = reconciler.pass(&desired, &comms, true).await;
        assert_eq!(report.agg_states["agg-2"], DaemonState::Stopped);
        assert_eq!(report.agg_states["agg-1"], DaemonState::Ready);
    }

    #[tokio::test]
    async fn test_failover_redistributes() {
        let desired = fleet_state();
        let fleet = MockFleet::new();
        fleet.daemon("agg-2").set_state("stopped");
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();

        // 8 producers over 3 ready aggregators: 3,3,2 in declared order
        let report = reconciler.pass(&desired, &comms, true).await;
        let assignment = &report.assignments["l1"];
        assert_eq!(assignment["agg-1"].len(), 3);
        assert_eq!(assignment["agg-3"].len(), 3);
        assert_eq!(assignment["agg-4"].len(), 2);
        assert!(!assignment.contains_key("agg-2"));

        // agg-2 recovers: next pass rebalances to 2,2,2,2 with stops
        fleet.daemon("agg-2").set_state("ready");
        let report = reconciler.pass(&desired, &comms, false).await;
        assert!(report.rebalanced);
        for i in 1..=4 {
            assert_eq!(
                fleet.daemon(&format!("agg-{i}")).started_producers().len(),
                2,
                "agg-{i}"
            );
        }
    }

    #[tokio::test]
    async fn test_steady_state_skips_rebalance() {
        let desired = fleet_state();
        let fleet = MockFleet::new();
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();

        reconciler.pass(&desired, &comms, true).await;
        let report = reconciler.pass(&desired, &comms, false).await;
        assert!(!report.rebalanced);
    }

    #[tokio::test]
    async fn test_forced_passes_emit_identical_commands() {
        let desired = fleet_state();
        let fleet = MockFleet::new();
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();

        reconciler.pass(&desired, &comms, true).await;
        fleet.daemon("agg-1").clear_log();
        reconciler.pass(&desired, &comms, true).await;
        let second = fleet.daemon("agg-1").log();
        fleet.daemon("agg-1").clear_log();
        reconciler.pass(&desired, &comms, true).await;
        let third = fleet.daemon("agg-1").log();

        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn test_producers_added_on_every_aggregator() {
        let desired = fleet_state();
        let fleet = MockFleet::new();
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();
        reconciler.pass(&desired, &comms, true).await;

        // Every aggregator knows all 8 producers even though each runs 2
        for i in 1..=4 {
            assert_eq!(fleet.daemon(&format!("agg-{i}")).producer_states().len(), 8);
        }
    }

    #[tokio::test]
    async fn test_sampler_bring_up() {
        let desired = state_from(
            r#"
hosts:
  - names: "nid[01-02]"
    hosts: "nid[01-02]"
    ports: "10001"
samplers:
  - names: "nid[01-02]"
    config:
      - name: meminfo
        interval: "1.0s:0ms"
      - name: vmstat
"#,
        );
        let fleet = MockFleet::new();
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();
        reconciler.pass(&desired, &comms, true).await;

        let daemon = fleet.daemon("nid01");
        assert_eq!(daemon.running_samplers(), vec!["meminfo", "vmstat"]);
        let log = daemon.log();
        assert!(log
            .iter()
            .any(|l| l.contains("plugn_config") && l.contains("instance=nid01/meminfo")));
        assert!(log
            .iter()
            .any(|l| l.contains("smplr_start") && l.contains("interval=1.0s:0ms")));
    }

    #[tokio::test]
    async fn test_unreachable_sampler_does_not_abort_pass() {
        let desired = state_from(
            r#"
hosts:
  - names: "nid[01-02]"
    hosts: "nid[01-02]"
    ports: "10001"
samplers:
  - names: "nid[01-02]"
    config:
      - name: meminfo
"#,
        );
        let fleet = MockFleet::new();
        fleet.daemon("nid01").set_reachable(false);
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();
        reconciler.pass(&desired, &comms, true).await;

        assert!(fleet.daemon("nid01").running_samplers().is_empty());
        assert_eq!(fleet.daemon("nid02").running_samplers(), vec!["meminfo"]);
    }

    #[tokio::test]
    async fn test_updater_and_store_apply() {
        let desired = state_from(
            r#"
hosts:
  - names: head1
    hosts: head1
    ports: "411"
  - names: nid01
    hosts: nid01
    ports: "10001"
aggregators:
  - names: agg-1
    group: l1
    hosts: head1
producers:
  - names: nid01
    hosts: nid01
    group: l1
    updaters: all
    reconnect: 20s
    type: active
updaters:
  - name: all
    group: l1
    interval: 1s
    push: onchange
    sets:
      - regex: "mem.*"
        field: schema
    producers:
      - regex: "nid.*"
stores:
  - name: sos
    group: l1
    container: tel
    schema: meminfo
    plugin:
      name: store_sos
      config:
        path: /var/store
"#,
        );
        let fleet = MockFleet::new();
        let comms = CommSet::new(fleet.factory());
        let mut reconciler = Reconciler::new();
        reconciler.pass(&desired, &comms, true).await;

        let log = fleet.daemon("agg-1").log();
        assert!(log.iter().any(|l| l == "updtr_add name=all push=onchange"));
        assert!(log.iter().any(|l| l == "updtr_prdcr_add name=all regex=nid.*"));
        assert!(log
            .iter()
            .any(|l| l == "updtr_match_add match=schema name=all regex=mem.*"));
        assert!(log.iter().any(|l| l.starts_with("updtr_start name=all")));
        assert!(log.iter().any(|l| l == "strgp_add container=tel name=sos plugin=store_sos schema=meminfo"));
        assert!(log.iter().any(|l| l == "strgp_prdcr_add name=sos regex=.*"));
        assert!(log.iter().any(|l| l == "strgp_start name=sos"));
    }
}
