//! The topology snapshot a single probe cycle produces (spec.md §3 `Report`).
//!
//! A `Report` is a plain CRDT: every field merges independently and the
//! whole thing is associative, commutative and idempotent (spec.md §3
//! invariant 1), so reporters can run concurrently and the probe loop can
//! fold their outputs with a simple left-to-right reduce.

pub mod id;
pub mod topology;

use serde::{Deserialize, Serialize};

pub use id::{AdjacencyId, EdgeId, NodeId};
pub use topology::{ArgType, Capability, CapabilityArg, EdgeMetadata, Node, Topology};

/// The eight named topologies spec.md's `Report` bullet list enumerates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub endpoint: Topology,
    pub address: Topology,
    pub process: Topology,
    pub container: Topology,
    pub container_image: Topology,
    pub host: Topology,
    pub pod: Topology,
    pub service: Topology,
}

impl Report {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoint.is_empty()
            && self.address.is_empty()
            && self.process.is_empty()
            && self.container.is_empty()
            && self.container_image.is_empty()
            && self.host.is_empty()
            && self.pod.is_empty()
            && self.service.is_empty()
    }

    /// Element-wise merge across all eight topologies (spec.md §4.1).
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            endpoint: self.endpoint.merge(&other.endpoint),
            address: self.address.merge(&other.address),
            process: self.process.merge(&other.process),
            container: self.container.merge(&other.container),
            container_image: self.container_image.merge(&other.container_image),
            host: self.host.merge(&other.host),
            pod: self.pod.merge(&other.pod),
            service: self.service.merge(&other.service),
        }
    }

    /// Fold a sequence of per-reporter Reports into one (probe loop's per-cycle step).
    pub fn merge_all(reports: impl IntoIterator<Item = Report>) -> Self {
        reports.into_iter().fold(Self::empty(), |acc, r| acc.merge(&r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_report_is_empty() {
        assert!(Report::empty().is_empty());
    }

    #[test]
    fn merge_all_is_order_independent_for_disjoint_reports() {
        let mut a = Report::empty();
        a.host.add_node(id::host_node_id("h1"), Node::with_metadata(HashMap::from([("k".into(), "v".into())])));

        let mut b = Report::empty();
        b.process.add_node(id::process_node_id("h1", 42), Node::new());

        let ab = Report::merge_all([a.clone(), b.clone()]);
        let ba = Report::merge_all([b, a]);
        assert_eq!(ab, ba);
        assert!(!ab.is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = Report::empty();
        a.host.add_node(id::host_node_id("h1"), Node::new());
        assert_eq!(a.merge(&a.clone()), a);
    }
}
