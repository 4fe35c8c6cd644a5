//! Description-tree validation and cross-expansion
//!
//! Consumes the generic tree parsed from a declarative description and
//! builds the expanded entity maps. Range-notation specs are expanded
//! here; cross-references between sections (producer regexes, store
//! groups) are left for the aggregator daemons to evaluate server-side.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use crate::expand::{self, ExpandError};
use crate::interval::{self, IntervalError};
use crate::kvtree::KvNode;

use super::{
    Aggregator, Auth, DesiredState, Host, Plugin, Producer, ProducerType, SamplerGroup,
    SamplerPlugin, SetMatch, StorePolicy, Updater, DEFAULT_SAMPLE_INTERVAL, DEFAULT_XPRT,
};

/// Errors raised while validating a description or a datastore image.
#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("section '{0}' is missing required attribute '{1}'")]
    MissingAttribute(String, String),

    #[error("section '{0}': name count does not match host/port arity")]
    ArityMismatch(String),

    #[error("section '{0}': duplicate name '{2}' in group '{1}'")]
    DuplicateName(String, String, String),

    #[error("duplicate host name '{0}' in topology")]
    DuplicateHost(String),

    #[error("updater '{0}': 'auto' and 'push' are mutually exclusive")]
    ConflictingMode(String),

    #[error("section '{0}': attribute '{1}' has invalid value '{2}'")]
    InvalidValue(String, String, String),

    #[error("section '{0}': '{1}' does not resolve to a known host")]
    UnknownHost(String, String),

    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error(transparent)]
    Interval(#[from] IntervalError),
}

fn missing(section: &str, key: &str) -> TopologyError {
    TopologyError::MissingAttribute(section.to_string(), key.to_string())
}

fn invalid(section: &str, key: &str, value: &str) -> TopologyError {
    TopologyError::InvalidValue(section.to_string(), key.to_string(), value.to_string())
}

/// Required leaf attribute of a section entry.
fn leaf<'a>(section: &str, entry: &'a KvNode, key: &str) -> Result<&'a str, TopologyError> {
    entry
        .get(key)
        .and_then(KvNode::as_str)
        .ok_or_else(|| missing(section, key))
}

fn leaf_opt<'a>(entry: &'a KvNode, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(KvNode::as_str)
}

/// Required spec attribute, raw (one string or a list of strings).
fn raw_specs(section: &str, entry: &KvNode, key: &str) -> Result<Vec<String>, TopologyError> {
    entry
        .get(key)
        .and_then(KvNode::as_spec_list)
        .ok_or_else(|| missing(section, key))
}

/// Required spec attribute, expanded in input order.
fn expanded(section: &str, entry: &KvNode, key: &str) -> Result<Vec<String>, TopologyError> {
    Ok(expand::expand_all(&raw_specs(section, entry, key)?)?)
}

fn entries<'a>(tree: &'a KvNode, section: &str) -> &'a [KvNode] {
    tree.get(section).and_then(KvNode::as_seq).unwrap_or(&[])
}

/// Opaque key/value map from a mapping node's leaves.
fn leaf_map(node: &KvNode) -> BTreeMap<String, String> {
    node.as_map()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl DesiredState {
    /// Validate and cross-expand a parsed description tree.
    pub fn from_description(tree: &KvNode) -> Result<DesiredState, TopologyError> {
        let mut state = DesiredState::default();
        parse_hosts(tree, &mut state)?;
        parse_aggregators(tree, &mut state)?;
        parse_producers(tree, &mut state)?;
        parse_updaters(tree, &mut state)?;
        parse_stores(tree, &mut state)?;
        parse_samplers(tree, &mut state)?;
        Ok(state)
    }
}

fn parse_hosts(tree: &KvNode, state: &mut DesiredState) -> Result<(), TopologyError> {
    for entry in entries(tree, "hosts") {
        let names = expanded("hosts", entry, "names")?;
        let hosts = expanded("hosts", entry, "hosts")?;
        let ports = expanded("hosts", entry, "ports")?;

        if names.len() != hosts.len() * ports.len() {
            return Err(TopologyError::ArityMismatch("hosts".to_string()));
        }

        let xprt = leaf_opt(entry, "xprt").unwrap_or(DEFAULT_XPRT).to_string();
        let auth = match entry.get("auth") {
            Some(node) => Auth {
                name: leaf_opt(node, "name").unwrap_or("none").to_string(),
                config: node.get("config").map(leaf_map).unwrap_or_default(),
            },
            None => Auth::default(),
        };

        // Names are consumed row-major: host outer, port inner.
        let mut names_iter = names.into_iter();
        for addr in &hosts {
            for port_str in &ports {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| invalid("hosts", "ports", port_str))?;
                let name = names_iter.next().expect("arity checked above");
                let host = Host {
                    name: name.clone(),
                    addr: addr.clone(),
                    port,
                    xprt: xprt.clone(),
                    auth: auth.clone(),
                };
                if state.hosts.insert(name.clone(), host).is_some() {
                    return Err(TopologyError::DuplicateHost(name));
                }
            }
        }
    }
    Ok(())
}

fn parse_aggregators(tree: &KvNode, state: &mut DesiredState) -> Result<(), TopologyError> {
    for entry in entries(tree, "aggregators") {
        let names = expanded("aggregators", entry, "names")?;
        let hosts = expanded("aggregators", entry, "hosts")?;
        let group = leaf("aggregators", entry, "group")?.to_string();

        if names.len() != hosts.len() {
            return Err(TopologyError::ArityMismatch("aggregators".to_string()));
        }

        let aggs = state.aggregators.entry(group.clone()).or_default();
        for (name, host) in names.into_iter().zip(hosts) {
            if !state.hosts.contains_key(&host) {
                return Err(TopologyError::UnknownHost("aggregators".to_string(), host));
            }
            if aggs.iter().any(|a| a.name == name) {
                return Err(TopologyError::DuplicateName(
                    "aggregators".to_string(),
                    group.clone(),
                    name,
                ));
            }
            aggs.push(Aggregator {
                name,
                host,
                state: Default::default(),
            });
        }
    }
    Ok(())
}

fn parse_producers(tree: &KvNode, state: &mut DesiredState) -> Result<(), TopologyError> {
    for entry in entries(tree, "producers") {
        let names = expanded("producers", entry, "names")?;
        let hosts = expanded("producers", entry, "hosts")?;
        let updaters = raw_specs("producers", entry, "updaters")?;
        let reconnect = leaf("producers", entry, "reconnect")?.to_string();
        let type_str = leaf("producers", entry, "type")?;
        let group = leaf("producers", entry, "group")?.to_string();

        if names.len() != hosts.len() {
            return Err(TopologyError::ArityMismatch("producers".to_string()));
        }

        // Fail early on a reconnect interval the fan-out could not use.
        interval::parse_interval(&reconnect)?;

        let ptype =
            ProducerType::parse(type_str).ok_or_else(|| invalid("producers", "type", type_str))?;

        if !state.aggregators.contains_key(&group) {
            warn!(
                group,
                "dropping producers '{}': no such aggregator group",
                names.join(",")
            );
            continue;
        }

        let list = state.producers.entry(group.clone()).or_default();
        for (name, host) in names.into_iter().zip(hosts) {
            if !state.hosts.contains_key(&host) {
                return Err(TopologyError::UnknownHost("producers".to_string(), host));
            }
            list.push(Producer {
                name,
                host,
                group: group.clone(),
                ptype,
                reconnect: reconnect.clone(),
                updaters: updaters.clone(),
            });
        }
    }
    Ok(())
}

fn parse_updaters(tree: &KvNode, state: &mut DesiredState) -> Result<(), TopologyError> {
    for entry in entries(tree, "updaters") {
        let name = leaf("updaters", entry, "name")?.to_string();
        let group = leaf("updaters", entry, "group")?.to_string();
        let interval_str = leaf("updaters", entry, "interval")?.to_string();

        interval::parse_interval(&interval_str)?;

        let auto = leaf_opt(entry, "auto").map(String::from);
        let push = leaf_opt(entry, "push").map(String::from);
        if auto.is_some() && push.is_some() {
            return Err(TopologyError::ConflictingMode(name));
        }

        let sets_node = entry
            .get("sets")
            .and_then(KvNode::as_seq)
            .ok_or_else(|| missing("updaters", "sets"))?;
        let mut sets = Vec::with_capacity(sets_node.len());
        for set in sets_node {
            let regex = leaf("updaters", set, "regex")?.to_string();
            let field = leaf_opt(set, "field").map(String::from);
            if let Some(f) = &field {
                if f != "inst" && f != "schema" {
                    return Err(invalid("updaters", "field", f));
                }
            }
            sets.push(SetMatch { regex, field });
        }

        let prdcrs_node = entry
            .get("producers")
            .and_then(KvNode::as_seq)
            .ok_or_else(|| missing("updaters", "producers"))?;
        let mut producers = Vec::with_capacity(prdcrs_node.len());
        for p in prdcrs_node {
            producers.push(leaf("updaters", p, "regex")?.to_string());
        }

        let list = state.updaters.entry(group.clone()).or_default();
        if list.iter().any(|u| u.name == name) {
            return Err(TopologyError::DuplicateName(
                "updaters".to_string(),
                group,
                name,
            ));
        }
        list.push(Updater {
            name,
            group: group.clone(),
            interval: interval_str,
            auto,
            push,
            sets,
            producers,
        });
    }
    Ok(())
}

fn parse_stores(tree: &KvNode, state: &mut DesiredState) -> Result<(), TopologyError> {
    for entry in entries(tree, "stores") {
        let name = leaf("stores", entry, "name")?.to_string();
        let group = leaf("stores", entry, "group")?.to_string();
        let container = leaf("stores", entry, "container")?.to_string();
        let schema = leaf("stores", entry, "schema")?.to_string();

        let plugin_node = entry.get("plugin").ok_or_else(|| missing("stores", "plugin"))?;
        let plugin = Plugin {
            name: leaf("stores", plugin_node, "name")?.to_string(),
            config: plugin_node
                .get("config")
                .map(leaf_map)
                .ok_or_else(|| missing("stores", "plugin.config"))?,
        };

        let list = state.stores.entry(group.clone()).or_default();
        if list.iter().any(|s| s.name == name) {
            return Err(TopologyError::DuplicateName(
                "stores".to_string(),
                group,
                name,
            ));
        }
        list.push(StorePolicy {
            name,
            group: group.clone(),
            container,
            schema,
            plugin,
        });
    }
    Ok(())
}

fn parse_samplers(tree: &KvNode, state: &mut DesiredState) -> Result<(), TopologyError> {
    for entry in entries(tree, "samplers") {
        let specs = raw_specs("samplers", entry, "names")?;
        let key = specs.join(",");
        let hosts = expand::expand_all(&specs)?;

        for host in &hosts {
            if !state.hosts.contains_key(host) {
                return Err(TopologyError::UnknownHost(
                    "samplers".to_string(),
                    host.clone(),
                ));
            }
        }

        let mut plugins = Vec::new();
        if let Some(cfg) = entry.get("config").and_then(KvNode::as_seq) {
            for plugin_node in cfg {
                let name = leaf("samplers", plugin_node, "name")?.to_string();
                let interval = leaf_opt(plugin_node, "interval")
                    .unwrap_or(DEFAULT_SAMPLE_INTERVAL)
                    .to_string();
                let config = plugin_node
                    .as_map()
                    .map(|m| {
                        m.iter()
                            .filter(|(k, _)| k.as_str() != "name" && k.as_str() != "interval")
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                plugins.push(SamplerPlugin {
                    name,
                    interval,
                    config,
                });
            }
        }

        let group = SamplerGroup {
            spec: key.clone(),
            hosts,
            plugins,
        };
        if state.samplers.insert(key.clone(), group).is_some() {
            return Err(TopologyError::DuplicateName(
                "samplers".to_string(),
                String::new(),
                key,
            ));
        }
    }
    Ok(())
}
