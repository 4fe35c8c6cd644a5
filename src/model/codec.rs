//! Desired-state tree codec
//!
//! Renders a [`DesiredState`] into the generic tree written to the
//! datastore, and reads a reflected tree back into a snapshot. The tree
//! carries the expanded form: the monitor never re-expands range specs.

use std::collections::BTreeMap;

use crate::kvtree::KvNode;

use super::topology::TopologyError;
use super::{
    Aggregator, Auth, DaemonState, DesiredState, Host, Plugin, Producer, ProducerType,
    SamplerGroup, SamplerPlugin, SetMatch, StorePolicy, Updater, DEFAULT_SAMPLE_INTERVAL,
    DEFAULT_XPRT,
};

fn missing(section: &str, key: &str) -> TopologyError {
    TopologyError::MissingAttribute(section.to_string(), key.to_string())
}

fn map_of<const N: usize>(pairs: [(&str, KvNode); N]) -> KvNode {
    KvNode::Map(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn leaf_map_node(map: &BTreeMap<String, String>) -> KvNode {
    KvNode::Map(
        map.iter()
            .map(|(k, v)| (k.clone(), KvNode::leaf(v)))
            .collect(),
    )
}

impl DesiredState {
    /// Render the snapshot as a datastore tree. The `last_updated`
    /// sentinel is not part of the tree; the save path writes it last as
    /// the commit point.
    pub fn to_tree(&self) -> KvNode {
        let mut root = BTreeMap::new();

        let hosts: BTreeMap<String, KvNode> = self
            .hosts
            .iter()
            .map(|(name, h)| (name.clone(), host_node(h)))
            .collect();
        root.insert("hosts".to_string(), KvNode::Map(hosts));

        let aggs: BTreeMap<String, KvNode> = self
            .aggregators
            .iter()
            .map(|(group, list)| {
                (
                    group.clone(),
                    KvNode::Seq(list.iter().map(aggregator_node).collect()),
                )
            })
            .collect();
        root.insert("aggregators".to_string(), KvNode::Map(aggs));

        let prdcrs: BTreeMap<String, KvNode> = self
            .producers
            .iter()
            .map(|(group, list)| {
                (
                    group.clone(),
                    KvNode::Seq(list.iter().map(producer_node).collect()),
                )
            })
            .collect();
        root.insert("producers".to_string(), KvNode::Map(prdcrs));

        let updtrs: BTreeMap<String, KvNode> = self
            .updaters
            .iter()
            .map(|(group, list)| {
                (
                    group.clone(),
                    KvNode::Map(
                        list.iter()
                            .map(|u| (u.name.clone(), updater_node(u)))
                            .collect(),
                    ),
                )
            })
            .collect();
        root.insert("updaters".to_string(), KvNode::Map(updtrs));

        let stores: BTreeMap<String, KvNode> = self
            .stores
            .iter()
            .map(|(group, list)| {
                (
                    group.clone(),
                    KvNode::Map(
                        list.iter()
                            .map(|s| (s.name.clone(), store_node(s)))
                            .collect(),
                    ),
                )
            })
            .collect();
        root.insert("stores".to_string(), KvNode::Map(stores));

        let samplers: BTreeMap<String, KvNode> = self
            .samplers
            .iter()
            .map(|(spec, g)| (spec.clone(), sampler_node(g)))
            .collect();
        root.insert("samplers".to_string(), KvNode::Map(samplers));

        KvNode::Map(root)
    }

    /// Rebuild a snapshot from a reflected datastore tree.
    pub fn from_tree(tree: &KvNode) -> Result<DesiredState, TopologyError> {
        let mut state = DesiredState::default();

        if let Some(hosts) = tree.get("hosts").and_then(KvNode::as_map) {
            for (name, node) in hosts {
                state.hosts.insert(name.clone(), read_host(name, node)?);
            }
        }

        if let Some(groups) = tree.get("aggregators").and_then(KvNode::as_map) {
            for (group, list) in groups {
                let seq = list.as_seq().unwrap_or(&[]);
                let aggs: Result<Vec<_>, _> = seq.iter().map(read_aggregator).collect();
                state.aggregators.insert(group.clone(), aggs?);
            }
        }

        if let Some(groups) = tree.get("producers").and_then(KvNode::as_map) {
            for (group, list) in groups {
                let seq = list.as_seq().unwrap_or(&[]);
                let prdcrs: Result<Vec<_>, _> =
                    seq.iter().map(|n| read_producer(group, n)).collect();
                state.producers.insert(group.clone(), prdcrs?);
            }
        }

        if let Some(groups) = tree.get("updaters").and_then(KvNode::as_map) {
            for (group, by_name) in groups {
                let mut list = Vec::new();
                if let Some(map) = by_name.as_map() {
                    for (name, node) in map {
                        list.push(read_updater(group, name, node)?);
                    }
                }
                state.updaters.insert(group.clone(), list);
            }
        }

        if let Some(groups) = tree.get("stores").and_then(KvNode::as_map) {
            for (group, by_name) in groups {
                let mut list = Vec::new();
                if let Some(map) = by_name.as_map() {
                    for (name, node) in map {
                        list.push(read_store(group, name, node)?);
                    }
                }
                state.stores.insert(group.clone(), list);
            }
        }

        if let Some(samplers) = tree.get("samplers").and_then(KvNode::as_map) {
            for (spec, node) in samplers {
                state
                    .samplers
                    .insert(spec.clone(), read_sampler(spec, node)?);
            }
        }

        state.last_updated = tree
            .get("last_updated")
            .and_then(KvNode::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        Ok(state)
    }
}

fn host_node(h: &Host) -> KvNode {
    map_of([
        ("addr", KvNode::leaf(&h.addr)),
        ("port", KvNode::leaf(h.port)),
        ("xprt", KvNode::leaf(&h.xprt)),
        (
            "auth",
            map_of([
                ("name", KvNode::leaf(&h.auth.name)),
                ("config", leaf_map_node(&h.auth.config)),
            ]),
        ),
    ])
}

fn aggregator_node(a: &Aggregator) -> KvNode {
    map_of([
        ("name", KvNode::leaf(&a.name)),
        ("host", KvNode::leaf(&a.host)),
        ("state", KvNode::leaf(a.state)),
    ])
}

fn producer_node(p: &Producer) -> KvNode {
    map_of([
        ("name", KvNode::leaf(&p.name)),
        ("host", KvNode::leaf(&p.host)),
        ("type", KvNode::leaf(p.ptype)),
        ("reconnect", KvNode::leaf(&p.reconnect)),
        (
            "updaters",
            KvNode::Seq(p.updaters.iter().map(KvNode::leaf).collect()),
        ),
    ])
}

fn updater_node(u: &Updater) -> KvNode {
    let mut map = BTreeMap::new();
    map.insert("interval".to_string(), KvNode::leaf(&u.interval));
    if let Some(auto) = &u.auto {
        map.insert("auto".to_string(), KvNode::leaf(auto));
    }
    if let Some(push) = &u.push {
        map.insert("push".to_string(), KvNode::leaf(push));
    }
    map.insert(
        "sets".to_string(),
        KvNode::Seq(
            u.sets
                .iter()
                .map(|s| {
                    let mut m = BTreeMap::new();
                    m.insert("regex".to_string(), KvNode::leaf(&s.regex));
                    if let Some(field) = &s.field {
                        m.insert("field".to_string(), KvNode::leaf(field));
                    }
                    KvNode::Map(m)
                })
                .collect(),
        ),
    );
    map.insert(
        "producers".to_string(),
        KvNode::Seq(
            u.producers
                .iter()
                .map(|regex| map_of([("regex", KvNode::leaf(regex))]))
                .collect(),
        ),
    );
    KvNode::Map(map)
}

fn store_node(s: &StorePolicy) -> KvNode {
    map_of([
        ("container", KvNode::leaf(&s.container)),
        ("schema", KvNode::leaf(&s.schema)),
        (
            "plugin",
            map_of([
                ("name", KvNode::leaf(&s.plugin.name)),
                ("config", leaf_map_node(&s.plugin.config)),
            ]),
        ),
    ])
}

fn sampler_node(g: &SamplerGroup) -> KvNode {
    map_of([
        (
            "hosts",
            KvNode::Seq(g.hosts.iter().map(KvNode::leaf).collect()),
        ),
        (
            "config",
            KvNode::Seq(
                g.plugins
                    .iter()
                    .map(|p| {
                        let mut m: BTreeMap<String, KvNode> = p
                            .config
                            .iter()
                            .map(|(k, v)| (k.clone(), KvNode::leaf(v)))
                            .collect();
                        m.insert("name".to_string(), KvNode::leaf(&p.name));
                        m.insert("interval".to_string(), KvNode::leaf(&p.interval));
                        KvNode::Map(m)
                    })
                    .collect(),
            ),
        ),
    ])
}

fn req<'a>(section: &str, node: &'a KvNode, key: &str) -> Result<&'a str, TopologyError> {
    node.get(key)
        .and_then(KvNode::as_str)
        .ok_or_else(|| missing(section, key))
}

fn read_leaf_map(node: Option<&KvNode>) -> BTreeMap<String, String> {
    node.and_then(KvNode::as_map)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn read_host(name: &str, node: &KvNode) -> Result<Host, TopologyError> {
    let port_str = req("hosts", node, "port")?;
    let port: u16 = port_str.parse().map_err(|_| {
        TopologyError::InvalidValue("hosts".to_string(), "port".to_string(), port_str.to_string())
    })?;
    let auth = match node.get("auth") {
        Some(a) => Auth {
            name: a
                .get("name")
                .and_then(KvNode::as_str)
                .unwrap_or("none")
                .to_string(),
            config: read_leaf_map(a.get("config")),
        },
        None => Auth::default(),
    };
    Ok(Host {
        name: name.to_string(),
        addr: req("hosts", node, "addr")?.to_string(),
        port,
        xprt: node
            .get("xprt")
            .and_then(KvNode::as_str)
            .unwrap_or(DEFAULT_XPRT)
            .to_string(),
        auth,
    })
}

fn read_aggregator(node: &KvNode) -> Result<Aggregator, TopologyError> {
    Ok(Aggregator {
        name: req("aggregators", node, "name")?.to_string(),
        host: req("aggregators", node, "host")?.to_string(),
        state: node
            .get("state")
            .and_then(KvNode::as_str)
            .map(DaemonState::parse)
            .unwrap_or_default(),
    })
}

fn read_producer(group: &str, node: &KvNode) -> Result<Producer, TopologyError> {
    let type_str = req("producers", node, "type")?;
    let ptype = ProducerType::parse(type_str).ok_or_else(|| {
        TopologyError::InvalidValue(
            "producers".to_string(),
            "type".to_string(),
            type_str.to_string(),
        )
    })?;
    let updaters = node
        .get("updaters")
        .and_then(KvNode::as_seq)
        .map(|seq| {
            seq.iter()
                .filter_map(|n| n.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    Ok(Producer {
        name: req("producers", node, "name")?.to_string(),
        host: req("producers", node, "host")?.to_string(),
        group: group.to_string(),
        ptype,
        reconnect: req("producers", node, "reconnect")?.to_string(),
        updaters,
    })
}

fn read_updater(group: &str, name: &str, node: &KvNode) -> Result<Updater, TopologyError> {
    let mut sets = Vec::new();
    for s in node.get("sets").and_then(KvNode::as_seq).unwrap_or(&[]) {
        sets.push(SetMatch {
            regex: req("updaters", s, "regex")?.to_string(),
            field: s.get("field").and_then(KvNode::as_str).map(String::from),
        });
    }
    let mut producers = Vec::new();
    for p in node.get("producers").and_then(KvNode::as_seq).unwrap_or(&[]) {
        producers.push(req("updaters", p, "regex")?.to_string());
    }
    Ok(Updater {
        name: name.to_string(),
        group: group.to_string(),
        interval: req("updaters", node, "interval")?.to_string(),
        auto: node.get("auto").and_then(KvNode::as_str).map(String::from),
        push: node.get("push").and_then(KvNode::as_str).map(String::from),
        sets,
        producers,
    })
}

fn read_store(group: &str, name: &str, node: &KvNode) -> Result<StorePolicy, TopologyError> {
    let plugin_node = node
        .get("plugin")
        .ok_or_else(|| missing("stores", "plugin"))?;
    Ok(StorePolicy {
        name: name.to_string(),
        group: group.to_string(),
        container: req("stores", node, "container")?.to_string(),
        schema: req("stores", node, "schema")?.to_string(),
        plugin: Plugin {
            name: req("stores", plugin_node, "name")?.to_string(),
            config: read_leaf_map(plugin_node.get("config")),
        },
    })
}

fn read_sampler(spec: &str, node: &KvNode) -> Result<SamplerGroup, TopologyError> {
    let hosts = node
        .get("hosts")
        .and_then(KvNode::as_seq)
        .map(|seq| {
            seq.iter()
                .filter_map(|n| n.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let mut plugins = Vec::new();
    for p in node.get("config").and_then(KvNode::as_seq).unwrap_or(&[]) {
        let name = req("samplers", p, "name")?.to_string();
        let interval = p
            .get("interval")
            .and_then(KvNode::as_str)
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL)
            .to_string();
        let config = p
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
    Ok(SamplerGroup {
        spec: spec.to_string(),
        hosts,
        plugins,
    })
}
