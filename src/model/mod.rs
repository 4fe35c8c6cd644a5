//! Entity model for the telemetry fleet
//!
//! A fleet is described by six sections: hosts, aggregators, samplers,
//! producers, updaters, and stores. The expanded form of all six, plus the
//! commit timestamp, is a [`DesiredState`] snapshot. Snapshots are
//! immutable; a configuration change replaces the whole snapshot through
//! the datastore projection.
//!
//! Shared hosts are referenced by name through the hosts map rather than
//! structurally, which keeps the model tree-shaped and serializable.

pub mod codec;
pub mod topology;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use topology::TopologyError;

/// Default transport tag for daemon endpoints.
pub const DEFAULT_XPRT: &str = "sock";

/// Default sampler scheduling interval, passed to daemons verbatim.
pub const DEFAULT_SAMPLE_INTERVAL: &str = "1.0s:0ms";

/// Authentication carried as opaque configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            name: "none".to_string(),
            config: BTreeMap::new(),
        }
    }
}

/// A reachable daemon endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Globally unique name within the topology
    pub name: String,
    /// Address the daemon listens on
    pub addr: String,
    /// Listen port
    pub port: u16,
    /// Transport tag
    #[serde(default = "default_xprt")]
    pub xprt: String,
    /// Authentication domain
    #[serde(default)]
    pub auth: Auth,
}

fn default_xprt() -> String {
    DEFAULT_XPRT.to_string()
}

/// Reported lifecycle state of a daemon.
///
/// Only `Ready` daemons participate in load balancing; a `Running`
/// aggregator receives producer adds but no assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    #[default]
    Stopped,
    Running,
    Ready,
    Error,
}

impl DaemonState {
    /// Parse a daemon-reported state string; anything unrecognized is
    /// treated as `Stopped`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "running" => DaemonState::Running,
            "ready" => DaemonState::Ready,
            "error" => DaemonState::Error,
            _ => DaemonState::Stopped,
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Running => "running",
            DaemonState::Ready => "ready",
            DaemonState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One aggregator daemon inside a load-balance group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    pub name: String,
    /// Host key into the hosts map
    pub host: String,
    #[serde(default)]
    pub state: DaemonState,
}

/// Pull mode of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Active,
    Passive,
}

impl ProducerType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(ProducerType::Active),
            "passive" => Some(ProducerType::Passive),
            _ => None,
        }
    }
}

impl fmt::Display for ProducerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProducerType::Active => "active",
            ProducerType::Passive => "passive",
        })
    }
}

/// A pull source an aggregator group connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub name: String,
    /// Host key into the hosts map
    pub host: String,
    /// Target aggregator group
    pub group: String,
    #[serde(rename = "type")]
    pub ptype: ProducerType,
    /// Reconnect interval string, parsed to microseconds at fan-out
    pub reconnect: String,
    /// Updater names eligible to match this producer
    #[serde(default)]
    pub updaters: Vec<String>,
}

/// Metric-set match carried by an updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetMatch {
    pub regex: String,
    /// Match field: `inst` or `schema`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// A pull schedule applied by an aggregator group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Updater {
    pub name: String,
    pub group: String,
    pub interval: String,
    /// Automatic interval mode; mutually exclusive with `push`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<String>,
    /// Push mode; mutually exclusive with `auto`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<String>,
    pub sets: Vec<SetMatch>,
    /// Producer-name regexes
    pub producers: Vec<String>,
}

/// A storage plugin reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// A storage policy executed by an aggregator group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorePolicy {
    pub name: String,
    pub group: String,
    pub container: String,
    pub schema: String,
    pub plugin: Plugin,
}

/// One sampler plugin configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerPlugin {
    pub name: String,
    /// Scheduling form `"<interval>:<offset>"`, passed verbatim
    #[serde(default = "default_sample_interval")]
    pub interval: String,
    /// Arbitrary additional plugin parameters
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

fn default_sample_interval() -> String {
    DEFAULT_SAMPLE_INTERVAL.to_string()
}

/// A group of sampler daemons sharing a plugin configuration, keyed by the
/// raw range-notation spec that names them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerGroup {
    /// The raw names spec, preserved as the group identity
    pub spec: String,
    /// Expanded host names
    pub hosts: Vec<String>,
    pub plugins: Vec<SamplerPlugin>,
}

/// Immutable snapshot of the whole desired configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredState {
    pub hosts: BTreeMap<String, Host>,
    /// Aggregators per group, in declared order
    pub aggregators: BTreeMap<String, Vec<Aggregator>>,
    pub samplers: BTreeMap<String, SamplerGroup>,
    /// Producers per target group, in declared order
    pub producers: BTreeMap<String, Vec<Producer>>,
    pub updaters: BTreeMap<String, Vec<Updater>>,
    pub stores: BTreeMap<String, Vec<StorePolicy>>,
    /// Wall-clock commit timestamp, floating seconds
    pub last_updated: f64,
}

impl DesiredState {
    /// All aggregators across every group, in group order then declared
    /// order.
    pub fn all_aggregators(&self) -> impl Iterator<Item = &Aggregator> {
        self.aggregators.values().flatten()
    }

    /// Resolve a host key.
    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }
}
