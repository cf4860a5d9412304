//! Graph manager.
//!
//! `GraphManager` owns the storage, the rule registry and the schema cache.
//! Reads go straight to storage under the storage lock. Mutations only
//! happen through a transaction commit, which runs every operation through
//! the rule dispatcher on a staging buffer and applies the buffer in one
//! step, so a failed commit leaves no trace.
//!
//! # Version gate
//!
//! The main database records the schema version under `\0version`:
//!
//! - missing: written with the current version
//! - older: rewritten with the current version
//! - newer: `GraphError::VersionTooNew`, the store is not opened

pub mod index;
pub mod locking;
pub mod mutation;
pub mod names;
pub mod ops;
pub mod schema;

use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, warn};

use crate::config::GraphConfig;
use crate::data::{is_reserved_attr, Edge, Node};
use crate::error::{GraphError, Result};
use crate::rules::{self, Dispatcher, Rule, RuleRegistry};
use crate::storage::{GraphStorage, MainDb, StagedStorage};

pub use index::{IndexHandle, IndexQuery};
pub use locking::LockSet;
pub use mutation::Mutation;
pub use ops::{EdgeRef, Traversal};

use schema::{read_count, read_set, VERSION_KEY};

/// Schema version written by this code.
pub const VERSION: u64 = 1;

pub struct GraphManager {
    name: String,
    config: GraphConfig,
    locks: Arc<LockSet>,
    rules: RwLock<RuleRegistry>,
}

impl GraphManager {
    /// Open a graph on `storage` with default configuration.
    pub fn open(storage: Box<dyn GraphStorage>) -> Result<Arc<Self>> {
        Self::open_with_config(storage, GraphConfig::default())
    }

    pub fn open_with_config(mut storage: Box<dyn GraphStorage>, config: GraphConfig) -> Result<Arc<Self>> {
        check_version(&mut *storage)?;

        let name = format!("Graph {}", storage.name());
        let mut registry = RuleRegistry::new();
        rules::system::register(&mut registry);

        info!(graph = %name, version = VERSION, "Graph opened");

        Ok(Arc::new(Self {
            name,
            locks: Arc::new(LockSet::new(storage, config.lock_timeout())),
            config,
            rules: RwLock::new(registry),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    // ── Rules ──────────────────────────────────────────────────────

    /// Register a user rule. A rule with the same name is replaced.
    pub fn set_graph_rule(&self, rule: Arc<dyn Rule>) -> Result<()> {
        let mut rules = self.rules.write().map_err(|_| GraphError::poisoned("rules"))?;
        debug!(rule = rule.name(), "Rule registered");
        rules.set_user_rule(rule);
        Ok(())
    }

    /// Sorted names of all registered rules, system rules included.
    pub fn graph_rules(&self) -> Result<Vec<String>> {
        let rules = self.rules.read().map_err(|_| GraphError::poisoned("rules"))?;
        Ok(rules.names())
    }

    // ── Schema introspection ───────────────────────────────────────

    pub fn partitions(&self) -> Result<Vec<String>> {
        self.registry(schema::PARTITIONS_KEY)
    }

    pub fn node_kinds(&self) -> Result<Vec<String>> {
        self.registry(schema::NODE_KINDS_KEY)
    }

    pub fn edge_kinds(&self) -> Result<Vec<String>> {
        self.registry(schema::EDGE_KINDS_KEY)
    }

    pub fn node_attrs(&self, kind: &str) -> Result<Vec<String>> {
        self.registry(&schema::node_attrs_key(kind))
    }

    pub fn edge_attrs(&self, kind: &str) -> Result<Vec<String>> {
        self.registry(&schema::edge_attrs_key(kind))
    }

    /// Edge specs (`role:kind:farrole:farkind`) seen from nodes of `kind`.
    pub fn node_edges(&self, kind: &str) -> Result<Vec<String>> {
        self.registry(&schema::node_edges_key(kind))
    }

    /// True for reserved attributes and for any name stored at least once.
    pub fn is_valid_attr(&self, attr: &str) -> bool {
        if is_reserved_attr(attr) {
            return true;
        }
        match self.locks.storage() {
            Ok(storage) => names::lookup32(storage.main_db(), attr).is_some(),
            Err(e) => {
                warn!(attr, error = %e, "Attribute check failed");
                false
            }
        }
    }

    pub fn node_count(&self, kind: &str) -> Result<u64> {
        let storage = self.locks.storage()?;
        Ok(read_count(storage.main_db(), &schema::node_count_key(kind)))
    }

    pub fn edge_count(&self, kind: &str) -> Result<u64> {
        let storage = self.locks.storage()?;
        Ok(read_count(storage.main_db(), &schema::edge_count_key(kind)))
    }

    /// Stored schema version.
    pub fn version(&self) -> Result<u64> {
        let storage = self.locks.storage()?;
        stored_version(storage.main_db()).map(|v| v.unwrap_or(VERSION))
    }

    /// Copy of the main database.
    pub fn main_db_snapshot(&self) -> Result<MainDb> {
        Ok(self.locks.storage()?.main_db().clone())
    }

    fn registry(&self, key: &str) -> Result<Vec<String>> {
        if let Some(list) = self.locks.schema_read()?.get(key) {
            return Ok(list.clone());
        }

        // Hold the write lock across the load so a commit cannot slip a
        // stale list into the cache.
        let mut cache = self.locks.schema_write()?;
        if let Some(list) = cache.get(key) {
            return Ok(list.clone());
        }
        let list: Vec<String> = {
            let storage = self.locks.storage()?;
            read_set(storage.main_db(), key)?.into_iter().collect()
        };
        cache.insert(key.to_string(), list.clone());
        Ok(list)
    }

    // ── Index queries ──────────────────────────────────────────────

    /// Index over node attributes, `None` if nothing was indexed yet.
    pub fn node_index_query(&self, part: &str, kind: &str) -> Result<Option<IndexHandle>> {
        self.index_query(ops::node_index_collection(part, kind))
    }

    /// Index over edge attributes, `None` if nothing was indexed yet.
    pub fn edge_index_query(&self, part: &str, kind: &str) -> Result<Option<IndexHandle>> {
        self.index_query(ops::edge_index_collection(part, kind))
    }

    fn index_query(&self, smname: String) -> Result<Option<IndexHandle>> {
        let exists = self.locks.storage()?.has_collection(&smname);
        Ok(exists.then(|| IndexHandle::new(Arc::clone(&self.locks), smname)))
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn fetch_node(&self, part: &str, key: &str, kind: &str) -> Result<Option<Node>> {
        let storage = self.locks.storage()?;
        ops::fetch_node(&**storage, part, key, kind)
    }

    pub fn fetch_edge(&self, part: &str, key: &str, kind: &str) -> Result<Option<Edge>> {
        let storage = self.locks.storage()?;
        ops::fetch_edge(&**storage, part, key, kind)
    }

    /// Sorted keys of all nodes of a kind in a partition.
    pub fn node_keys(&self, part: &str, kind: &str) -> Result<Vec<String>> {
        let storage = self.locks.storage()?;
        ops::node_keys(&**storage, part, kind)
    }

    /// Edges of a node matching `spec`, with their far nodes.
    pub fn traverse(&self, part: &str, key: &str, kind: &str, spec: &str) -> Result<Vec<Traversal>> {
        let storage = self.locks.storage()?;
        ops::traverse(&**storage, part, key, kind, spec, true)
    }

    // ── Commit ─────────────────────────────────────────────────────

    /// Apply a batch of operations atomically.
    ///
    /// Takes the schema lock then the storage lock, runs every operation
    /// through the dispatcher on a staging buffer and applies the buffer.
    /// On error nothing is written.
    pub(crate) fn commit_ops(&self, ops: &[Mutation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let rules = self
            .rules
            .read()
            .map_err(|_| GraphError::poisoned("rules"))?
            .clone();
        let mut guard = self.locks.mutation()?;

        let mut staged = StagedStorage::new(&mut **guard.storage);
        let outcome = {
            let mut dispatcher = Dispatcher::new(&mut staged, &rules, self.config.max_rule_dispatches);
            ops.iter().try_for_each(|op| {
                dispatcher.run(op.clone()).map_err(|e| {
                    warn!(op = %op.describe(), error = %e, "Operation failed, discarding commit");
                    e
                })
            })
        };
        outcome?;

        let touched = staged.changed_main_keys();
        let staged_len = staged.staged_len();
        if let Err(e) = staged.apply() {
            error!(error = %e, "Applying commit failed, store restored to its previous state");
            guard.schema.clear();
            return Err(e);
        }

        guard.schema.invalidate(&touched);
        debug!(ops = ops.len(), entries = staged_len, meta = touched.len(), "Commit applied");
        Ok(())
    }
}

fn stored_version(db: &MainDb) -> Result<Option<u64>> {
    match db.get(VERSION_KEY) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| GraphError::Storage(format!("Unreadable schema version {:?}", raw))),
    }
}

fn check_version(storage: &mut dyn GraphStorage) -> Result<()> {
    match stored_version(storage.main_db())? {
        Some(stored) if stored > VERSION => {
            error!(stored, supported = VERSION, "Refusing to open store with newer schema");
            Err(GraphError::VersionTooNew {
                stored,
                supported: VERSION,
            })
        }
        Some(stored) if stored == VERSION => Ok(()),
        previous => {
            match previous {
                Some(stored) => info!(from = stored, to = VERSION, "Upgrading schema version"),
                None => info!(version = VERSION, "Initialising schema version"),
            }
            storage
                .main_db_mut()
                .insert(VERSION_KEY.to_string(), VERSION.to_string());
            storage.flush_main()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EdgeEnd;
    use crate::storage::MemoryStorage;

    fn open() -> Arc<GraphManager> {
        GraphManager::open(Box::new(MemoryStorage::new("mem"))).unwrap()
    }

    fn person(key: &str, name: &str) -> Mutation {
        Mutation::StoreNode {
            partition: "main".into(),
            node: Node::new(key, "Person").with_attr("name", name),
        }
    }

    #[test]
    fn test_name_and_system_rules() {
        let gm = open();
        assert_eq!(gm.name(), "Graph mem");
        assert_eq!(
            gm.graph_rules().unwrap(),
            vec![rules::system::DELETE_NODE_EDGES, rules::system::UPDATE_NODE_STATS]
        );
        assert_eq!(gm.version().unwrap(), VERSION);
    }

    #[test]
    fn test_empty_schema() {
        let gm = open();
        assert!(gm.node_kinds().unwrap().is_empty());
        assert!(gm.partitions().unwrap().is_empty());
        assert!(gm.node_attrs("Person").unwrap().is_empty());
        assert!(gm.node_index_query("main", "Person").unwrap().is_none());
    }

    #[test]
    fn test_commit_invalidates_cached_registries() {
        let gm = open();
        assert!(gm.node_kinds().unwrap().is_empty());

        gm.commit_ops(&[person("p1", "Marvin")]).unwrap();
        assert_eq!(gm.node_kinds().unwrap(), vec!["Person"]);
        assert_eq!(gm.partitions().unwrap(), vec!["main"]);
        assert_eq!(gm.node_count("Person").unwrap(), 1);
    }

    #[test]
    fn test_failed_commit_leaves_nothing() {
        let gm = open();
        let bad_edge = Mutation::StoreEdge {
            partition: "main".into(),
            edge: Edge::new(
                "e1",
                "Friend",
                EdgeEnd::new("p1", "Person", "friend"),
                EdgeEnd::new("ghost", "Person", "friend"),
            ),
        };
        let moody = Mutation::StoreNode {
            partition: "main".into(),
            node: Node::new("p1", "Person").with_attr("mood", "gloomy"),
        };
        let err = gm.commit_ops(&[moody, bad_edge]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidData(_)));

        assert!(gm.fetch_node("main", "p1", "Person").unwrap().is_none());
        assert!(gm.node_kinds().unwrap().is_empty());
        assert!(!gm.is_valid_attr("mood"));
    }

    #[test]
    fn test_index_query_after_store() {
        let gm = open();
        gm.commit_ops(&[person("p1", "Marvin the Paranoid Android")]).unwrap();

        let index = gm.node_index_query("main", "Person").unwrap().unwrap();
        assert_eq!(index.lookup_phrase("name", "paranoid android").unwrap(), vec!["p1"]);
        assert!(gm.edge_index_query("main", "Friend").unwrap().is_none());
    }

    #[test]
    fn test_version_helpers() {
        let mut db = MainDb::new();
        assert_eq!(stored_version(&db).unwrap(), None);
        db.insert(VERSION_KEY.to_string(), "7".to_string());
        assert_eq!(stored_version(&db).unwrap(), Some(7));
        db.insert(VERSION_KEY.to_string(), "seven".to_string());
        assert!(matches!(stored_version(&db), Err(GraphError::Storage(_))));
    }
}
