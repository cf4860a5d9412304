//! Integration test: the basic friend-graph lifecycle through the public API.
//!
//! Stores two people and a friendship in one transaction, then checks
//! schema introspection, traversal, index lookups and edge removal.

use std::sync::Arc;

use fishdb::graph::IndexQuery;
use fishdb::{ConcurrentTrans, Edge, EdgeEnd, GraphManager, MemoryStorage, Node, Trans, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn friend_graph() -> Arc<GraphManager> {
    let gm = GraphManager::open(Box::new(MemoryStorage::new("e2e"))).unwrap();

    let mut trans = ConcurrentTrans::new(Arc::clone(&gm));
    trans
        .store_node("main", Node::new("p1", "Person").with_attr("name", "Marvin"))
        .unwrap();
    trans
        .store_node("main", Node::new("p2", "Person").with_attr("name", "Zaphod"))
        .unwrap();
    trans
        .store_edge(
            "main",
            Edge::new(
                "e1",
                "Friend",
                EdgeEnd::new("p1", "Person", "friend").cascading(true),
                EdgeEnd::new("p2", "Person", "friend"),
            ),
        )
        .unwrap();
    trans.commit().unwrap();
    gm
}

fn remove_node(gm: &Arc<GraphManager>, key: &str) {
    let mut trans = ConcurrentTrans::new(Arc::clone(gm));
    trans.remove_node("main", key, "Person").unwrap();
    trans.commit().unwrap();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_schema_after_commit() {
    let gm = friend_graph();

    assert_eq!(gm.partitions().unwrap(), vec!["main"]);
    assert_eq!(gm.node_kinds().unwrap(), vec!["Person"]);
    assert_eq!(gm.edge_kinds().unwrap(), vec!["Friend"]);
    assert_eq!(gm.node_edges("Person").unwrap(), vec!["friend:Friend:friend:Person"]);
    assert_eq!(gm.node_count("Person").unwrap(), 2);
    assert_eq!(gm.edge_count("Friend").unwrap(), 1);

    for attr in ["key", "kind", "name"] {
        assert!(gm.is_valid_attr(attr));
    }
    assert!(!gm.is_valid_attr("towel"));
}

#[test]
fn test_traverse_from_either_end() {
    let gm = friend_graph();

    let from_p1 = gm.traverse("main", "p1", "Person", "").unwrap();
    assert_eq!(from_p1.len(), 1);
    assert_eq!(from_p1[0].edge.end1.key, "p1");
    assert_eq!(from_p1[0].node.as_ref().and_then(|n| n.name()), Some("Zaphod"));

    let from_p2 = gm.traverse("main", "p2", "Person", "friend:Friend::").unwrap();
    assert_eq!(from_p2.len(), 1);
    assert_eq!(from_p2[0].edge.end1.key, "p2");
    assert_eq!(from_p2[0].node.as_ref().map(|n| n.key.as_str()), Some("p1"));

    assert!(gm.traverse("main", "p1", "Person", ":Enemy::").unwrap().is_empty());
}

#[test]
fn test_index_lookups() {
    let gm = friend_graph();

    assert!(gm.node_index_query("main", "Robot").unwrap().is_none());
    let index = gm.node_index_query("main", "Person").unwrap().unwrap();

    let hits = index.lookup_word("name", "MARVIN").unwrap();
    assert_eq!(hits.keys().collect::<Vec<_>>(), vec!["p1"]);
    assert_eq!(index.lookup_value("name", "Zaphod").unwrap(), vec!["p2"]);
    assert!(index.lookup_phrase("name", "zaphod marvin").unwrap().is_empty());
}

#[test]
fn test_removing_non_cascading_end_keeps_other_node() {
    let gm = friend_graph();
    remove_node(&gm, "p2");

    assert!(gm.fetch_edge("main", "e1", "Friend").unwrap().is_none());
    assert!(gm.fetch_node("main", "p1", "Person").unwrap().is_some());
    assert_eq!(gm.node_count("Person").unwrap(), 1);
    assert_eq!(gm.edge_count("Friend").unwrap(), 0);
    assert!(gm.traverse("main", "p1", "Person", "").unwrap().is_empty());
}

#[test]
fn test_removing_cascading_end_removes_far_node() {
    let gm = friend_graph();
    remove_node(&gm, "p1");

    assert!(gm.fetch_edge("main", "e1", "Friend").unwrap().is_none());
    assert!(gm.fetch_node("main", "p2", "Person").unwrap().is_none());
    assert_eq!(gm.node_count("Person").unwrap(), 0);

    // Registries are append-only.
    assert_eq!(gm.node_kinds().unwrap(), vec!["Person"]);
    assert_eq!(gm.edge_kinds().unwrap(), vec!["Friend"]);
}

#[test]
fn test_attribute_values_survive_round_trip() {
    let gm = GraphManager::open(Box::new(MemoryStorage::new("values"))).unwrap();
    let mut trans = ConcurrentTrans::new(Arc::clone(&gm));
    trans
        .store_node(
            "main",
            Node::new("r1", "Robot")
                .with_attr("depressed", true)
                .with_attr("brain", 50_000i64)
                .with_attr("height", 1.75)
                .with_attr("owner", Value::Null),
        )
        .unwrap();
    trans.commit().unwrap();

    let robot = gm.fetch_node("main", "r1", "Robot").unwrap().unwrap();
    assert_eq!(robot.attr("depressed"), Some(Value::Boolean(true)));
    assert_eq!(robot.attr("brain"), Some(Value::Integer(50_000)));
    assert_eq!(robot.attr("height"), Some(Value::Float(1.75)));
    assert_eq!(robot.attr("owner"), Some(Value::Null));
    assert_eq!(
        gm.node_attrs("Robot").unwrap(),
        vec!["brain", "depressed", "height", "owner"]
    );
    assert!(gm.is_valid_attr("brain"));
}
