//! Stable, delimited NodeID/EdgeID/AdjacencyID construction.
//!
//! IDs are opaque strings from the caller's point of view (spec.md §3,
//! §6) but every one of them is built through one of the constructors
//! below so the delimiter scheme lives in exactly one place.

use std::fmt;

/// Opaque, stably-encoded identifier for a node in some Topology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(String);

impl NodeId {
    fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// `EdgeID = srcNodeID ⨁ dstNodeID` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct EdgeId(String);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `AdjacencyID = hostID ⨁ NodeID` (spec.md §3): the neighbor set of `node`
/// as observed from `origin_host`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct AdjacencyId(String);

impl fmt::Display for AdjacencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Endpoint: `hostID|ip|port`.
pub fn endpoint_node_id(host_id: &str, ip: &str, port: &str) -> NodeId {
    NodeId::new(format!("{host_id}|{ip}|{port}"))
}

/// Address: `hostID|ip`.
pub fn address_node_id(host_id: &str, ip: &str) -> NodeId {
    NodeId::new(format!("{host_id}|{ip}"))
}

/// Process: `hostID|pid`.
pub fn process_node_id(host_id: &str, pid: i64) -> NodeId {
    NodeId::new(format!("{host_id}|{pid}"))
}

/// Container: bare `containerID`.
pub fn container_node_id(container_id: &str) -> NodeId {
    NodeId::new(container_id)
}

/// Container image: bare `imageID`.
pub fn image_node_id(image_id: &str) -> NodeId {
    NodeId::new(image_id)
}

/// Pod: `namespace/name`.
pub fn pod_node_id(namespace: &str, name: &str) -> NodeId {
    NodeId::new(format!("{namespace}/{name}"))
}

/// Service: `namespace/name`.
pub fn service_node_id(namespace: &str, name: &str) -> NodeId {
    NodeId::new(format!("{namespace}/{name}"))
}

/// Host: `serverHost;<hostID>` (spec.md §8 S1's `"serverHost;<host>"` shape).
pub fn host_node_id(host_id: &str) -> NodeId {
    NodeId::new(format!("serverHost;{host_id}"))
}

/// `EdgeID(src, dst)`.
pub fn edge_id(src: &NodeId, dst: &NodeId) -> EdgeId {
    EdgeId(format!("{src}->{dst}"))
}

/// `AdjacencyID(origin_host, node)`.
pub fn adjacency_id(origin_host: &str, node: &NodeId) -> AdjacencyId {
    AdjacencyId(format!("{origin_host};{node}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_shape() {
        assert_eq!(endpoint_node_id("h1", "1.2.3.4", "80").as_str(), "h1|1.2.3.4|80");
    }

    #[test]
    fn host_shape_matches_origin_lookup() {
        assert_eq!(host_node_id("h1").as_str(), "serverHost;h1");
    }

    #[test]
    fn pod_and_service_share_namespace_name_shape() {
        assert_eq!(pod_node_id("ping", "pong").as_str(), "ping/pong");
        assert_eq!(service_node_id("ping", "pong").as_str(), "ping/pong");
    }

    #[test]
    fn edge_and_adjacency_are_distinguishable_from_node_ids() {
        let src = endpoint_node_id("h1", "1.2.3.4", "80");
        let dst = endpoint_node_id("h1", "5.6.7.8", "54010");
        assert_eq!(edge_id(&src, &dst).to_string(), "h1|1.2.3.4|80->h1|5.6.7.8|54010");
        assert_eq!(adjacency_id("h1", &src).to_string(), "h1;h1|1.2.3.4|80");
    }
}
