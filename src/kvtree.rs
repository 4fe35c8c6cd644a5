//! Generic configuration tree and its flat key/value projection
//!
//! The declarative description, the datastore image, and the desired-state
//! codec all speak one tree shape: mappings, ordered sequences, and string
//! leaves. Walking a tree yields `/`-joined keys where mappings contribute
//! their key as a path segment and sequences contribute a zero-padded
//! six-digit index, so lexicographic key order in the datastore matches
//! numeric sequence order. Reflection rebuilds the tree from a key range,
//! deciding container kind from the digit-or-name classification of the
//! next path segment.

use std::collections::BTreeMap;

/// A node in the configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub enum KvNode {
    Map(BTreeMap<String, KvNode>),
    Seq(Vec<KvNode>),
    Leaf(String),
}

impl KvNode {
    /// Empty mapping node.
    pub fn map() -> Self {
        KvNode::Map(BTreeMap::new())
    }

    /// Leaf from any displayable scalar.
    pub fn leaf(value: impl ToString) -> Self {
        KvNode::Leaf(value.to_string())
    }

    /// Convert a parsed YAML document into a tree. Null values are
    /// dropped; scalars are kept as their string rendering.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<KvNode> {
        use serde_yaml::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(KvNode::Leaf(b.to_string())),
            Value::Number(n) => Some(KvNode::Leaf(n.to_string())),
            Value::String(s) => Some(KvNode::Leaf(s.clone())),
            Value::Sequence(seq) => Some(KvNode::Seq(
                seq.iter().filter_map(KvNode::from_yaml).collect(),
            )),
            Value::Mapping(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    let key = match k {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => continue,
                    };
                    if let Some(node) = KvNode::from_yaml(v) {
                        out.insert(key, node);
                    }
                }
                Some(KvNode::Map(out))
            }
            Value::Tagged(tagged) => KvNode::from_yaml(&tagged.value),
        }
    }

    /// Leaf value, if this node is a leaf.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvNode::Leaf(s) => Some(s),
            _ => None,
        }
    }

    /// Mapping entries, if this node is a mapping.
    pub fn as_map(&self) -> Option<&BTreeMap<String, KvNode>> {
        match self {
            KvNode::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Sequence elements, if this node is a sequence.
    pub fn as_seq(&self) -> Option<&[KvNode]> {
        match self {
            KvNode::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// Child of a mapping node by key.
    pub fn get(&self, key: &str) -> Option<&KvNode> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Interpret this node as one-spec-or-sequence-of-specs, the shape
    /// range-notation fields take in descriptions.
    pub fn as_spec_list(&self) -> Option<Vec<String>> {
        match self {
            KvNode::Leaf(s) => Some(vec![s.clone()]),
            KvNode::Seq(items) => items
                .iter()
                .map(|n| n.as_str().map(String::from))
                .collect(),
            KvNode::Map(_) => None,
        }
    }

    /// Project the tree into flat key/value pairs under `prefix`.
    /// Empty leaves are skipped.
    pub fn walk(&self, prefix: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        self.walk_into(prefix, &mut pairs);
        pairs
    }

    fn walk_into(&self, prefix: &str, pairs: &mut Vec<(String, String)>) {
        match self {
            KvNode::Leaf(value) => {
                if !value.is_empty() {
                    pairs.push((prefix.to_string(), value.clone()));
                }
            }
            KvNode::Map(map) => {
                for (key, child) in map {
                    child.walk_into(&format!("{prefix}/{key}"), pairs);
                }
            }
            KvNode::Seq(seq) => {
                for (idx, child) in seq.iter().enumerate() {
                    child.walk_into(&format!("{prefix}/{idx:06}"), pairs);
                }
            }
        }
    }
}

/// Rebuild a tree from flat pairs whose keys are relative paths
/// (`hosts/orion-01/addr`). All-digit segments denote sequence indices.
pub fn reflect<I>(pairs: I) -> KvNode
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut root = KvNode::map();
    for (key, value) in pairs {
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        if !segments.is_empty() {
            insert(&mut root, &segments, &value);
        }
    }
    root
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn insert(node: &mut KvNode, segments: &[&str], value: &str) {
    let Some((head, rest)) = segments.split_first() else {
        *node = KvNode::Leaf(value.to_string());
        return;
    };

    if is_index(head) {
        if !matches!(node, KvNode::Seq(_)) {
            *node = KvNode::Seq(Vec::new());
        }
        let KvNode::Seq(seq) = node else { unreachable!() };
        let idx: usize = head.parse().unwrap_or(0);
        while seq.len() <= idx {
            seq.push(KvNode::Leaf(String::new()));
        }
        insert(&mut seq[idx], rest, value);
    } else {
        if !matches!(node, KvNode::Map(_)) {
            *node = KvNode::map();
        }
        let KvNode::Map(map) = node else { unreachable!() };
        let child = map
            .entry(head.to_string())
            .or_insert_with(|| KvNode::Leaf(String::new()));
        insert(child, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> KvNode {
        let yaml = r#"
hosts:
  orion-01:
    addr: 10.0.0.1
    port: 411
aggregators:
  l1:
    - name: agg-01
      host: orion-01
    - name: agg-02
      host: orion-02
"#;
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        KvNode::from_yaml(&value).unwrap()
    }

    #[test]
    fn test_walk_key_shapes() {
        let pairs = sample_tree().walk("/tel");
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"/tel/hosts/orion-01/addr"));
        assert!(keys.contains(&"/tel/aggregators/l1/000000/name"));
        assert!(keys.contains(&"/tel/aggregators/l1/000001/host"));
    }

    #[test]
    fn test_sequence_index_is_zero_padded_width_6() {
        let tree = KvNode::Seq(vec![KvNode::leaf("a"), KvNode::leaf("b")]);
        let pairs = tree.walk("");
        assert_eq!(pairs[0].0, "/000000");
        assert_eq!(pairs[1].0, "/000001");
    }

    #[test]
    fn test_empty_leaves_skipped() {
        let mut map = BTreeMap::new();
        map.insert("full".to_string(), KvNode::leaf("x"));
        map.insert("empty".to_string(), KvNode::leaf(""));
        let pairs = KvNode::Map(map).walk("");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "/full");
    }

    #[test]
    fn test_yaml_null_dropped() {
        let value: serde_yaml::Value = serde_yaml::from_str("a: ~\nb: 1").unwrap();
        let tree = KvNode::from_yaml(&value).unwrap();
        assert!(tree.get("a").is_none());
        assert_eq!(tree.get("b").unwrap().as_str(), Some("1"));
    }

    #[test]
    fn test_reflect_builds_sequences_from_digit_segments() {
        let pairs = vec![
            ("grp/000000/name".to_string(), "agg-01".to_string()),
            ("grp/000001/name".to_string(), "agg-02".to_string()),
        ];
        let tree = reflect(pairs);
        let seq = tree.get("grp").unwrap().as_seq().unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[1].get("name").unwrap().as_str(), Some("agg-02"));
    }

    #[test]
    fn test_round_trip() {
        let tree = sample_tree();
        let pairs = tree
            .walk("")
            .into_iter()
            .map(|(k, v)| (k.trim_start_matches('/').to_string(), v));
        assert_eq!(reflect(pairs), tree);
    }

    #[test]
    fn test_spec_list_single_and_sequence() {
        let single = KvNode::leaf("nid[01-02]");
        assert_eq!(single.as_spec_list().unwrap(), vec!["nid[01-02]"]);

        let seq = KvNode::Seq(vec![KvNode::leaf("a"), KvNode::leaf("b")]);
        assert_eq!(seq.as_spec_list().unwrap(), vec!["a", "b"]);
    }
}
