//! Topology: the per-view graph (nodes, adjacency, edge metadata,
//! capabilities) that makes up one field of a [`crate::report::Report`].
//!
//! Merge is associative, commutative and idempotent on sets, summed
//! counters, and string metadata (spec.md §3 invariant 1, §4.1) — see the
//! tie-break note on [`merge_metadata`].

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::id::{AdjacencyId, EdgeId, NodeId};

/// A node's metadata and counters (spec.md §3 `Node`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: HashMap<String, String>,
    pub counters: HashMap<String, i64>,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(metadata: HashMap<String, String>) -> Self {
        Self {
            metadata,
            counters: HashMap::new(),
        }
    }

    /// Merge two node views of the same NodeID, per spec.md §3 invariant 4.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            metadata: merge_metadata(&self.metadata, &other.metadata),
            counters: merge_counters(&self.counters, &other.counters),
        }
    }
}

/// Merge two `key -> string` maps with "non-empty-wins" semantics (spec.md
/// §3 invariant 4).
///
/// A non-empty value always wins over an empty one regardless of which side
/// it came from. When both sides carry different non-empty values for the
/// same key — which "most-recent-wins" can't express without a logical
/// clock neither side has — the tie is broken by comparing the two values
/// themselves (greatest wins) rather than by argument position, so the
/// result does not depend on whether a caller writes `a.merge(&b)` or
/// `b.merge(&a)`.
pub fn merge_metadata(
    a: &HashMap<String, String>,
    b: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(a.len().max(b.len()));
    for k in a.keys().chain(b.keys()).collect::<std::collections::HashSet<_>>() {
        let chosen = match (a.get(k), b.get(k)) {
            (Some(x), Some(y)) if x.is_empty() => y,
            (Some(x), Some(y)) if y.is_empty() => x,
            (Some(x), Some(y)) => x.max(y),
            (Some(x), None) => x,
            (None, Some(y)) => y,
            (None, None) => unreachable!("key came from one of the two maps"),
        };
        out.insert(k.clone(), chosen.clone());
    }
    out
}

fn merge_counters(base: &HashMap<String, i64>, other: &HashMap<String, i64>) -> HashMap<String, i64> {
    let mut out = base.clone();
    for (k, v) in other {
        *out.entry(k.clone()).or_insert(0) += v;
    }
    out
}

/// Directed per-edge counters (spec.md §3 `EdgeMetadata`).
///
/// Every field is optional: "unset" is the additive identity, distinct from
/// zero, so that `merge(unset, x) == x` and `merge(x, y) == x + y` (spec.md
/// §4.1 edge cases).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeMetadata {
    pub packet_count: Option<u64>,
    pub byte_count: Option<u64>,
    pub max_conn_count_tcp: Option<u64>,
    pub bytes_ingress: Option<u64>,
    pub bytes_egress: Option<u64>,
}

fn merge_optional_sum(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (Some(x), Some(y)) => Some(x + y),
    }
}

fn merge_optional_max(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (Some(x), Some(y)) => Some(x.max(y)),
    }
}

impl EdgeMetadata {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            packet_count: merge_optional_sum(self.packet_count, other.packet_count),
            byte_count: merge_optional_sum(self.byte_count, other.byte_count),
            // MaxConnCountTCP is a high-water mark, not a cumulative total.
            max_conn_count_tcp: merge_optional_max(self.max_conn_count_tcp, other.max_conn_count_tcp),
            bytes_ingress: merge_optional_sum(self.bytes_ingress, other.bytes_ingress),
            bytes_egress: merge_optional_sum(self.bytes_egress, other.bytes_egress),
        }
    }
}

/// An RPC-like capability descriptor (`original_source/report/capabilities.go`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub human: String,
    pub args: Vec<CapabilityArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityArg {
    pub name: String,
    pub human: String,
    pub arg_type: ArgType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgType {
    Duration,
}

/// One categorical view: nodes, adjacency, per-edge counters, capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: HashMap<NodeId, Node>,
    pub adjacency: HashMap<AdjacencyId, BTreeSet<NodeId>>,
    pub edge_metadata: HashMap<EdgeId, EdgeMetadata>,
    pub capabilities: HashMap<String, Capability>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.adjacency.is_empty()
            && self.edge_metadata.is_empty()
            && self.capabilities.is_empty()
    }

    /// Add (or overwrite) a node's metadata.
    pub fn add_node(&mut self, id: NodeId, node: Node) {
        self.nodes.insert(id, node);
    }

    /// Record that `dst` is a neighbor of `src` as seen by `origin_host`,
    /// and add/merge the edge's counters (spec.md §3 invariant 2).
    pub fn add_edge(
        &mut self,
        origin_host: &str,
        src: &NodeId,
        dst: &NodeId,
        metadata: EdgeMetadata,
    ) {
        let adjacency_id = super::id::adjacency_id(origin_host, src);
        self.adjacency.entry(adjacency_id).or_default().insert(dst.clone());

        let edge_id = super::id::edge_id(src, dst);
        self.edge_metadata
            .entry(edge_id)
            .and_modify(|existing| *existing = existing.merge(&metadata))
            .or_insert(metadata);
    }

    /// Element-wise CRDT merge (spec.md §4.1).
    pub fn merge(&self, other: &Self) -> Self {
        let mut nodes = self.nodes.clone();
        for (id, node) in &other.nodes {
            nodes
                .entry(id.clone())
                .and_modify(|existing| *existing = existing.merge(node))
                .or_insert_with(|| node.clone());
        }

        let mut adjacency = self.adjacency.clone();
        for (id, set) in &other.adjacency {
            adjacency.entry(id.clone()).or_default().extend(set.iter().cloned());
        }

        let mut edge_metadata = self.edge_metadata.clone();
        for (id, em) in &other.edge_metadata {
            edge_metadata
                .entry(id.clone())
                .and_modify(|existing| *existing = existing.merge(em))
                .or_insert_with(|| em.clone());
        }

        let mut capabilities = self.capabilities.clone();
        for (id, cap) in &other.capabilities {
            capabilities.insert(id.clone(), cap.clone());
        }

        Self {
            nodes,
            adjacency,
            edge_metadata,
            capabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn merge_is_identity_with_empty() {
        let mut t = Topology::new();
        t.add_node(nid("a"), Node::with_metadata(HashMap::from([("k".into(), "v".into())])));
        let merged = t.merge(&Topology::new());
        assert_eq!(merged, t);
    }

    #[test]
    fn merge_sums_counters_and_unions_sets() {
        let mut a = Topology::new();
        a.add_edge(
            "h1",
            &nid("src"),
            &nid("dst"),
            EdgeMetadata {
                packet_count: Some(1),
                byte_count: Some(100),
                ..Default::default()
            },
        );
        let mut b = Topology::new();
        b.add_edge(
            "h1",
            &nid("src"),
            &nid("dst2"),
            EdgeMetadata {
                packet_count: Some(2),
                byte_count: Some(200),
                ..Default::default()
            },
        );

        let merged = a.merge(&b);
        let edge = merged.edge_metadata.get(&super::super::id::edge_id(&nid("src"), &nid("dst"))).unwrap();
        assert_eq!(edge.packet_count, Some(1));
        assert_eq!(edge.byte_count, Some(100));

        let adjacency_id = super::super::id::adjacency_id("h1", &nid("src"));
        let neighbors = merged.adjacency.get(&adjacency_id).unwrap();
        assert!(neighbors.contains(&nid("dst")));
        assert!(neighbors.contains(&nid("dst2")));
    }

    #[test]
    fn merge_is_idempotent_for_counters_doubled_semantics() {
        let mut a = Topology::new();
        a.add_edge(
            "h1",
            &nid("src"),
            &nid("dst"),
            EdgeMetadata {
                packet_count: Some(5),
                ..Default::default()
            },
        );
        let merged = a.merge(&a.clone());
        let edge = merged.edge_metadata.get(&super::super::id::edge_id(&nid("src"), &nid("dst"))).unwrap();
        assert_eq!(edge.packet_count, Some(10));
    }

    #[test]
    fn unset_counter_merges_as_additive_identity() {
        let em = EdgeMetadata::default();
        let other = EdgeMetadata {
            byte_count: Some(42),
            ..Default::default()
        };
        assert_eq!(em.merge(&other).byte_count, Some(42));
        assert_eq!(other.merge(&em).byte_count, Some(42));
    }

    #[test]
    fn conflicting_non_empty_metadata_merges_the_same_regardless_of_order() {
        let a = HashMap::from([("k".to_string(), "alpha".to_string())]);
        let b = HashMap::from([("k".to_string(), "beta".to_string())]);
        assert_eq!(merge_metadata(&a, &b), merge_metadata(&b, &a));
    }

    #[test]
    fn empty_value_never_beats_a_non_empty_one_either_direction() {
        let present = HashMap::from([("k".to_string(), "v".to_string())]);
        let empty = HashMap::from([("k".to_string(), String::new())]);
        assert_eq!(merge_metadata(&present, &empty).get("k").unwrap(), "v");
        assert_eq!(merge_metadata(&empty, &present).get("k").unwrap(), "v");
    }
}
