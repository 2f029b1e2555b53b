//! CRDT merge law property tests (spec.md §8 invariants 1-3; SPEC_FULL.md §8
//! "exercised both as targeted unit tests and as `proptest` property
//! tests").

use std::collections::HashMap;

use proptest::prelude::*;
use vantage_probe::report::{id, Node, Report};

fn arb_node() -> impl Strategy<Value = Node> {
    prop::collection::hash_map("[a-c]", "[x-z][0-9]{0,2}", 0..3).prop_map(Node::with_metadata)
}

fn arb_report() -> impl Strategy<Value = Report> {
    (
        prop::collection::vec(("[a-d]", arb_node()), 0..4),
        prop::collection::vec(("[a-d]", arb_node()), 0..4),
    )
        .prop_map(|(hosts, processes)| {
            let mut report = Report::empty();
            for (host_id, node) in hosts {
                report.host.add_node(id::host_node_id(&host_id), node);
            }
            for (host_id, node) in processes {
                report.process.add_node(id::process_node_id(&host_id, 1), node);
            }
            report
        })
}

proptest! {
    #[test]
    fn merge_is_commutative(a in arb_report(), b in arb_report()) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_with_empty_is_identity(a in arb_report()) {
        prop_assert_eq!(a.merge(&Report::empty()), a.clone());
        prop_assert_eq!(Report::empty().merge(&a), a);
    }

    #[test]
    fn merge_is_associative(a in arb_report(), b in arb_report(), c in arb_report()) {
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn fold_is_order_independent(reports in prop::collection::vec(arb_report(), 0..5)) {
        let forward = Report::merge_all(reports.clone());
        let mut reversed = reports;
        reversed.reverse();
        let backward = Report::merge_all(reversed);
        prop_assert_eq!(forward, backward);
    }
}

#[test]
fn origin_host_lookup_scenario_s1() {
    let mut report = Report::empty();
    report.host.add_node(
        id::host_node_id("server"),
        Node::with_metadata(HashMap::from([
            ("host_name".to_string(), "server".to_string()),
            ("os".to_string(), "linux".to_string()),
            ("local_networks".to_string(), "10.0.0.0/24 10.0.1.0/24".to_string()),
            ("load".to_string(), "0.1 0.2 0.3".to_string()),
        ])),
    );

    let node = report.host.nodes.get(&id::host_node_id("server")).expect("host node present");
    assert_eq!(node.metadata.get("host_name").unwrap(), "server");
    assert_eq!(node.metadata.get("os").unwrap(), "linux");
    assert_eq!(
        node.metadata.get("local_networks").unwrap().split(' ').collect::<Vec<_>>(),
        vec!["10.0.0.0/24", "10.0.1.0/24"]
    );
    assert_eq!(node.metadata.get("load").unwrap(), "0.1 0.2 0.3");

    assert!(report.host.nodes.get(&id::host_node_id("unknown")).is_none());
}
