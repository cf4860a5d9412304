//! Storage primitive.
//!
//! A store is a "main database" of string metadata plus any number of named
//! byte collections (storage managers), e.g. `main.Person.nodes` for the
//! Person nodes of partition `main`. The graph manager only talks to the
//! `GraphStorage` trait; record layout on top of the collections is the
//! graph layer's business.

pub mod memory;
pub mod disk;
pub mod staging;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryStorage;
pub use disk::DiskStorage;
pub use staging::StagedStorage;

/// Main database: string keys to string values.
pub type MainDb = BTreeMap<String, String>;

/// Storage backend used by the graph manager.
///
/// Send + Sync required for use behind `Mutex<Box<dyn GraphStorage>>`.
pub trait GraphStorage: Send + Sync {
    /// Name of this store (for identification)
    fn name(&self) -> &str;

    // === MAIN DATABASE ===

    fn main_db(&self) -> &MainDb;

    fn main_db_mut(&mut self) -> &mut MainDb;

    /// Persist the main database.
    fn flush_main(&mut self) -> Result<()>;

    /// Discard main database changes since the last flush.
    fn rollback_main(&mut self) -> Result<()>;

    // === COLLECTIONS ===

    /// Check if a collection was ever written to.
    fn has_collection(&self, smname: &str) -> bool;

    /// Insert or replace an entry. Creates the collection if needed.
    fn store_entry(&mut self, smname: &str, key: &str, value: Vec<u8>) -> Result<()>;

    fn fetch_entry(&self, smname: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove an entry, returning the previous value.
    fn remove_entry(&mut self, smname: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// All keys of a collection in ascending order (empty if missing).
    fn entry_keys(&self, smname: &str) -> Result<Vec<String>>;

    /// Names of all collections in ascending order.
    fn collection_names(&self) -> Vec<String>;

    // === MAINTENANCE ===

    /// Persist everything (main database and collections).
    fn flush_all(&mut self) -> Result<()>;
}

/// An ordered key/value collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(key.to_string(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
