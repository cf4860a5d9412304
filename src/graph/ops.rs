//! Low-level node and edge operations on a `GraphStorage`.
//!
//! No rules run here and no locks are taken; callers hold the storage (or a
//! staging buffer over it). Layout per `(partition, kind)`:
//!
//! ```text
//! <part><kind>.nodes      key -> NodeRecord
//! <part><kind>.edges      key -> EdgeRecord
//! <part><kind>.nodeedges  node key -> sorted Vec<EdgeRef>
//! <part><kind>.nodeidx    full-text index over node attributes
//! <part><kind>.edgeidx    full-text index over edge attributes
//! ```
//!
//! Attribute names are stored as name-manager codes, so every stored
//! attribute is known to `GraphManager::is_valid_attr`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::edge::spec_matches;
use crate::data::{Edge, EdgeEnd, Node, Value};
use crate::error::{GraphError, Result};
use crate::graph::index::IndexManager;
use crate::graph::names::{decode32, NamesManager};
use crate::storage::{GraphStorage, MainDb};

// ── Collection names ───────────────────────────────────────────────

pub fn nodes_collection(part: &str, kind: &str) -> String {
    format!("{}.{}.nodes", part, kind)
}

pub fn edges_collection(part: &str, kind: &str) -> String {
    format!("{}.{}.edges", part, kind)
}

pub fn adjacency_collection(part: &str, kind: &str) -> String {
    format!("{}.{}.nodeedges", part, kind)
}

pub fn node_index_collection(part: &str, kind: &str) -> String {
    format!("{}.{}.nodeidx", part, kind)
}

pub fn edge_index_collection(part: &str, kind: &str) -> String {
    format!("{}.{}.edgeidx", part, kind)
}

// ── Records ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    attrs: Vec<(u32, Value)>,
}

#[derive(Serialize, Deserialize)]
struct EdgeRecord {
    end1: EdgeEnd,
    end2: EdgeEnd,
    attrs: Vec<(u32, Value)>,
}

/// Reference from a node to one of its edges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeRef {
    pub kind: String,
    pub key: String,
}

/// One step of a traversal: the edge oriented so that `end1` is the start
/// node, plus the far node when requested.
#[derive(Debug, Clone, PartialEq)]
pub struct Traversal {
    pub edge: Edge,
    pub node: Option<Node>,
}

fn encode_attrs(db: &mut MainDb, attrs: &BTreeMap<String, Value>) -> Result<Vec<(u32, Value)>> {
    let mut names = NamesManager::new(db);
    let mut encoded = Vec::with_capacity(attrs.len());
    for (attr, value) in attrs {
        let code = names
            .encode32(attr, true)?
            .ok_or_else(|| GraphError::InvalidAttr(attr.clone()))?;
        encoded.push((code, value.clone()));
    }
    Ok(encoded)
}

fn decode_attrs(db: &MainDb, attrs: Vec<(u32, Value)>) -> Result<BTreeMap<String, Value>> {
    attrs
        .into_iter()
        .map(|(code, value)| {
            decode32(db, code)
                .map(|name| (name, value))
                .ok_or_else(|| GraphError::Storage(format!("Unknown attribute code {}", code)))
        })
        .collect()
}

// ── Nodes ──────────────────────────────────────────────────────────

pub fn fetch_node(st: &dyn GraphStorage, part: &str, key: &str, kind: &str) -> Result<Option<Node>> {
    let Some(bytes) = st.fetch_entry(&nodes_collection(part, kind), key)? else {
        return Ok(None);
    };
    let record: NodeRecord = bincode::deserialize(&bytes)?;
    Ok(Some(Node {
        key: key.to_string(),
        kind: kind.to_string(),
        attrs: decode_attrs(st.main_db(), record.attrs)?,
    }))
}

/// Store a node, replacing any previous version. Returns the previous one.
pub fn write_node(st: &mut dyn GraphStorage, part: &str, node: &Node) -> Result<Option<Node>> {
    let previous = fetch_node(st, part, &node.key, &node.kind)?;

    let attrs = encode_attrs(st.main_db_mut(), &node.attrs)?;
    let bytes = bincode::serialize(&NodeRecord { attrs })?;
    st.store_entry(&nodes_collection(part, &node.kind), &node.key, bytes)?;

    let idx = node_index_collection(part, &node.kind);
    IndexManager::new(&mut *st, &idx).update(
        &node.key,
        previous.as_ref().map(|n| &n.attrs),
        &node.attrs,
    )?;

    Ok(previous)
}

/// Remove a node record and its index entries.
///
/// Adjacency is left in place so edge rules can still find the edges of
/// the removed node; removing those edges clears it.
pub fn delete_node(st: &mut dyn GraphStorage, part: &str, key: &str, kind: &str) -> Result<Option<Node>> {
    let Some(previous) = fetch_node(st, part, key, kind)? else {
        return Ok(None);
    };

    st.remove_entry(&nodes_collection(part, kind), key)?;
    let idx = node_index_collection(part, kind);
    IndexManager::new(&mut *st, &idx).deindex(key, &previous.attrs)?;

    Ok(Some(previous))
}

pub fn node_keys(st: &dyn GraphStorage, part: &str, kind: &str) -> Result<Vec<String>> {
    st.entry_keys(&nodes_collection(part, kind))
}

// ── Edges ──────────────────────────────────────────────────────────

pub fn fetch_edge(st: &dyn GraphStorage, part: &str, key: &str, kind: &str) -> Result<Option<Edge>> {
    let Some(bytes) = st.fetch_entry(&edges_collection(part, kind), key)? else {
        return Ok(None);
    };
    let record: EdgeRecord = bincode::deserialize(&bytes)?;
    Ok(Some(Edge {
        key: key.to_string(),
        kind: kind.to_string(),
        end1: record.end1,
        end2: record.end2,
        attrs: decode_attrs(st.main_db(), record.attrs)?,
    }))
}

/// Store an edge, replacing any previous version. Both end nodes must
/// exist. Returns the previous version.
pub fn write_edge(st: &mut dyn GraphStorage, part: &str, edge: &Edge) -> Result<Option<Edge>> {
    for (which, end) in [("end1", &edge.end1), ("end2", &edge.end2)] {
        if fetch_node(st, part, &end.key, &end.kind)?.is_none() {
            return Err(GraphError::InvalidData(format!(
                "Edge {} {} node {}:{} does not exist in partition {}",
                edge.key, which, end.kind, end.key, part
            )));
        }
    }

    let previous = fetch_edge(st, part, &edge.key, &edge.kind)?;
    let edge_ref = EdgeRef {
        kind: edge.kind.clone(),
        key: edge.key.clone(),
    };

    if let Some(old) = &previous {
        for end in [&old.end1, &old.end2] {
            if !edge.end1.points_at(&end.key, &end.kind) && !edge.end2.points_at(&end.key, &end.kind) {
                unlink(st, part, end, &edge_ref)?;
            }
        }
    }
    link(st, part, &edge.end1, &edge_ref)?;
    link(st, part, &edge.end2, &edge_ref)?;

    let attrs = encode_attrs(st.main_db_mut(), &edge.attrs)?;
    let record = EdgeRecord {
        end1: edge.end1.clone(),
        end2: edge.end2.clone(),
        attrs,
    };
    st.store_entry(&edges_collection(part, &edge.kind), &edge.key, bincode::serialize(&record)?)?;

    let idx = edge_index_collection(part, &edge.kind);
    IndexManager::new(&mut *st, &idx).update(
        &edge.key,
        previous.as_ref().map(|e| &e.attrs),
        &edge.attrs,
    )?;

    Ok(previous)
}

/// Remove an edge record, its adjacency references and index entries.
pub fn delete_edge(st: &mut dyn GraphStorage, part: &str, key: &str, kind: &str) -> Result<Option<Edge>> {
    let Some(previous) = fetch_edge(st, part, key, kind)? else {
        return Ok(None);
    };

    let edge_ref = EdgeRef {
        kind: kind.to_string(),
        key: key.to_string(),
    };
    unlink(st, part, &previous.end1, &edge_ref)?;
    unlink(st, part, &previous.end2, &edge_ref)?;

    st.remove_entry(&edges_collection(part, kind), key)?;
    let idx = edge_index_collection(part, kind);
    IndexManager::new(&mut *st, &idx).deindex(key, &previous.attrs)?;

    Ok(Some(previous))
}

// ── Adjacency ──────────────────────────────────────────────────────

/// Edge references of a node, sorted by (kind, key).
pub fn edge_refs(st: &dyn GraphStorage, part: &str, key: &str, kind: &str) -> Result<Vec<EdgeRef>> {
    match st.fetch_entry(&adjacency_collection(part, kind), key)? {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Ok(Vec::new()),
    }
}

fn save_refs(st: &mut dyn GraphStorage, part: &str, end: &EdgeEnd, refs: &[EdgeRef]) -> Result<()> {
    let smname = adjacency_collection(part, &end.kind);
    if refs.is_empty() {
        st.remove_entry(&smname, &end.key)?;
        Ok(())
    } else {
        st.store_entry(&smname, &end.key, bincode::serialize(refs)?)
    }
}

fn link(st: &mut dyn GraphStorage, part: &str, end: &EdgeEnd, edge_ref: &EdgeRef) -> Result<()> {
    let mut refs = edge_refs(st, part, &end.key, &end.kind)?;
    if let Err(pos) = refs.binary_search(edge_ref) {
        refs.insert(pos, edge_ref.clone());
        save_refs(st, part, end, &refs)?;
    }
    Ok(())
}

fn unlink(st: &mut dyn GraphStorage, part: &str, end: &EdgeEnd, edge_ref: &EdgeRef) -> Result<()> {
    let mut refs = edge_refs(st, part, &end.key, &end.kind)?;
    if let Ok(pos) = refs.binary_search(edge_ref) {
        refs.remove(pos);
        save_refs(st, part, end, &refs)?;
    }
    Ok(())
}

// ── Traversal ──────────────────────────────────────────────────────

/// Edges of a node whose spec (as seen from the node) matches `pattern`.
///
/// `pattern` is `role:kind:farrole:farkind` with empty parts as
/// wildcards; an empty pattern matches every edge.
pub fn traverse(
    st: &dyn GraphStorage,
    part: &str,
    key: &str,
    kind: &str,
    pattern: &str,
    with_nodes: bool,
) -> Result<Vec<Traversal>> {
    let pattern = if pattern.is_empty() { ":::" } else { pattern };
    let mut steps = Vec::new();

    for edge_ref in edge_refs(st, part, key, kind)? {
        let Some(edge) = fetch_edge(st, part, &edge_ref.key, &edge_ref.kind)? else {
            warn!(
                partition = part,
                node = key,
                edge = %edge_ref.key,
                "Dangling edge reference"
            );
            continue;
        };
        let Some(side) = edge.side_of(key, kind) else {
            continue;
        };
        if !spec_matches(pattern, &edge.spec(side)) {
            continue;
        }

        let edge = edge.oriented(side);
        let node = if with_nodes {
            fetch_node(st, part, &edge.end2.key, &edge.end2.kind)?
        } else {
            None
        };
        steps.push(Traversal { edge, node });
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::names::lookup32;
    use crate::storage::MemoryStorage;

    fn person(key: &str, name: &str) -> Node {
        Node::new(key, "Person").with_attr("name", name)
    }

    fn friend(key: &str, a: &str, b: &str) -> Edge {
        Edge::new(
            key,
            "Friend",
            EdgeEnd::new(a, "Person", "friend"),
            EdgeEnd::new(b, "Person", "friend"),
        )
    }

    fn seeded() -> MemoryStorage {
        let mut st = MemoryStorage::new("mem");
        write_node(&mut st, "main", &person("p1", "Arthur")).unwrap();
        write_node(&mut st, "main", &person("p2", "Ford")).unwrap();
        write_node(&mut st, "main", &Node::new("d1", "Dog")).unwrap();
        st
    }

    #[test]
    fn test_node_roundtrip_registers_attr_codes() {
        let mut st = MemoryStorage::new("mem");
        let node = person("p1", "Arthur").with_attr("age", 30);
        assert!(write_node(&mut st, "main", &node).unwrap().is_none());

        assert_eq!(fetch_node(&st, "main", "p1", "Person").unwrap(), Some(node.clone()));
        assert!(lookup32(st.main_db(), "age").is_some());
        assert!(st.has_collection("mainPerson.nodes"));
        assert!(fetch_node(&st, "other", "p1", "Person").unwrap().is_none());

        let previous = write_node(&mut st, "main", &person("p1", "Zaphod")).unwrap();
        assert_eq!(previous, Some(node));
    }

    #[test]
    fn test_edge_requires_both_ends() {
        let mut st = seeded();
        let err = write_edge(&mut st, "main", &friend("e1", "p1", "nobody")).unwrap_err();
        assert!(matches!(err, GraphError::InvalidData(_)));
        assert!(fetch_edge(&st, "main", "e1", "Friend").unwrap().is_none());
    }

    #[test]
    fn test_edge_links_both_ends() {
        let mut st = seeded();
        write_edge(&mut st, "main", &friend("e1", "p1", "p2")).unwrap();

        let expected = vec![EdgeRef {
            kind: "Friend".into(),
            key: "e1".into(),
        }];
        assert_eq!(edge_refs(&st, "main", "p1", "Person").unwrap(), expected);
        assert_eq!(edge_refs(&st, "main", "p2", "Person").unwrap(), expected);

        delete_edge(&mut st, "main", "e1", "Friend").unwrap();
        assert!(edge_refs(&st, "main", "p1", "Person").unwrap().is_empty());
        assert!(!st
            .entry_keys("mainPerson.nodeedges")
            .unwrap()
            .contains(&"p1".to_string()));
    }

    #[test]
    fn test_rewired_edge_unlinks_old_end() {
        let mut st = seeded();
        write_node(&mut st, "main", &person("p3", "Trillian")).unwrap();
        write_edge(&mut st, "main", &friend("e1", "p1", "p2")).unwrap();
        write_edge(&mut st, "main", &friend("e1", "p1", "p3")).unwrap();

        assert!(edge_refs(&st, "main", "p2", "Person").unwrap().is_empty());
        assert_eq!(edge_refs(&st, "main", "p3", "Person").unwrap().len(), 1);
        assert_eq!(edge_refs(&st, "main", "p1", "Person").unwrap().len(), 1);
    }

    #[test]
    fn test_self_loop_linked_once() {
        let mut st = seeded();
        write_edge(&mut st, "main", &friend("e1", "p1", "p1")).unwrap();
        assert_eq!(edge_refs(&st, "main", "p1", "Person").unwrap().len(), 1);
    }

    #[test]
    fn test_traverse_patterns() {
        let mut st = seeded();
        write_edge(&mut st, "main", &friend("e1", "p1", "p2")).unwrap();
        write_edge(
            &mut st,
            "main",
            &Edge::new(
                "o1",
                "Owns",
                EdgeEnd::new("p1", "Person", "owner"),
                EdgeEnd::new("d1", "Dog", "pet"),
            ),
        )
        .unwrap();

        let all = traverse(&st, "main", "p1", "Person", "", true).unwrap();
        assert_eq!(all.len(), 2);

        let pets = traverse(&st, "main", "p1", "Person", "owner:::Dog", true).unwrap();
        assert_eq!(pets.len(), 1);
        assert_eq!(pets[0].edge.end2.key, "d1");
        assert_eq!(pets[0].node.as_ref().map(|n| n.key.as_str()), Some("d1"));

        // From the dog's side the edge is oriented the other way
        let owners = traverse(&st, "main", "d1", "Dog", "pet:Owns::", false).unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].edge.end1.key, "d1");
        assert_eq!(owners[0].edge.end2.key, "p1");
        assert!(owners[0].node.is_none());

        assert!(traverse(&st, "main", "p1", "Person", ":Enemy::", true).unwrap().is_empty());
    }

    #[test]
    fn test_delete_node_keeps_adjacency() {
        let mut st = seeded();
        write_edge(&mut st, "main", &friend("e1", "p1", "p2")).unwrap();
        let removed = delete_node(&mut st, "main", "p1", "Person").unwrap();
        assert_eq!(removed.map(|n| n.key), Some("p1".to_string()));
        assert_eq!(edge_refs(&st, "main", "p1", "Person").unwrap().len(), 1);
        assert!(delete_node(&mut st, "main", "p1", "Person").unwrap().is_none());
    }

    #[test]
    fn test_node_keys_sorted() {
        let st = seeded();
        assert_eq!(node_keys(&st, "main", "Person").unwrap(), vec!["p1", "p2"]);
        assert!(node_keys(&st, "main", "Cat").unwrap().is_empty());
    }
}
