//! Schema registries kept in the main database.
//!
//! Registries are JSON string sets stored under fixed main-database keys.
//! They are append-only: a kind, attribute or edge spec once seen stays
//! registered even after every instance of it is removed.
//!
//! `SchemaCache` keeps decoded, sorted registry lists so introspection does
//! not need the storage lock on every call.

use std::collections::{BTreeSet, HashMap};

use crate::cluster::util::to_u64;
use crate::error::Result;
use crate::storage::MainDb;

pub const VERSION_KEY: &str = "\u{0}version";
pub const PARTITIONS_KEY: &str = "\u{0}parts";
pub const NODE_KINDS_KEY: &str = "\u{0}nodekinds";
pub const EDGE_KINDS_KEY: &str = "\u{0}edgekinds";

const NODE_ATTRS_PREFIX: &str = "\u{0}nodeattrs:";
const EDGE_ATTRS_PREFIX: &str = "\u{0}edgeattrs:";
const NODE_EDGES_PREFIX: &str = "\u{0}nodeedges:";
const NODE_COUNT_PREFIX: &str = "\u{0}nodecount:";
const EDGE_COUNT_PREFIX: &str = "\u{0}edgecount:";

pub fn node_attrs_key(kind: &str) -> String {
    format!("{}{}", NODE_ATTRS_PREFIX, kind)
}

pub fn edge_attrs_key(kind: &str) -> String {
    format!("{}{}", EDGE_ATTRS_PREFIX, kind)
}

pub fn node_edges_key(kind: &str) -> String {
    format!("{}{}", NODE_EDGES_PREFIX, kind)
}

pub fn node_count_key(kind: &str) -> String {
    format!("{}{}", NODE_COUNT_PREFIX, kind)
}

pub fn edge_count_key(kind: &str) -> String {
    format!("{}{}", EDGE_COUNT_PREFIX, kind)
}

/// Read a registry set. Missing registries are empty.
pub fn read_set(db: &MainDb, key: &str) -> Result<BTreeSet<String>> {
    match db.get(key) {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(BTreeSet::new()),
    }
}

/// Add items to a registry set. Returns true if the set grew.
pub fn add_to_set<'i, I>(db: &mut MainDb, key: &str, items: I) -> Result<bool>
where
    I: IntoIterator<Item = &'i str>,
{
    let mut set = read_set(db, key)?;
    let before = set.len();
    set.extend(items.into_iter().map(str::to_string));

    if set.len() == before && db.contains_key(key) {
        return Ok(false);
    }

    db.insert(key.to_string(), serde_json::to_string(&set)?);
    Ok(true)
}

/// Read a counter (0 if missing).
pub fn read_count(db: &MainDb, key: &str) -> u64 {
    db.get(key).map(to_u64).unwrap_or(0)
}

/// Add `delta` to a counter, never going below zero.
pub fn adjust_count(db: &mut MainDb, key: &str, delta: i64) {
    let current = read_count(db, key);
    let next = if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    };
    db.insert(key.to_string(), next.to_string());
}

/// Cache of decoded registry lists, keyed by main-database key.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: HashMap<String, Vec<String>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Vec<String>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, list: Vec<String>) {
        self.entries.insert(key, list);
    }

    /// Drop the given keys from the cache.
    pub fn invalidate<'k, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'k String>,
    {
        for key in keys {
            self.entries.remove(key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
