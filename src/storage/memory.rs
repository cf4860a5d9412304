//! In-memory storage.
//!
//! Used for tests, ephemeral graphs and as the per-member store inside a
//! memory-only cluster. Flushing is a snapshot of the main database so that
//! `rollback_main` has something to return to.

use std::collections::HashMap;

use crate::error::Result;
use crate::storage::{Collection, GraphStorage, MainDb};

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    name: String,
    main: MainDb,
    /// Main database as of the last `flush_main`.
    flushed_main: MainDb,
    collections: HashMap<String, Collection>,
    flush_count: u64,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Number of `flush_main` calls (for tests and stats).
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn collection(&self, smname: &str) -> Option<&Collection> {
        self.collections.get(smname)
    }

    pub(crate) fn insert_collection(&mut self, smname: String, collection: Collection) {
        self.collections.insert(smname, collection);
    }

    pub(crate) fn restore_main(&mut self, main: MainDb) {
        self.flushed_main = main.clone();
        self.main = main;
    }
}

impl GraphStorage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn main_db(&self) -> &MainDb {
        &self.main
    }

    fn main_db_mut(&mut self) -> &mut MainDb {
        &mut self.main
    }

    fn flush_main(&mut self) -> Result<()> {
        self.flushed_main = self.main.clone();
        self.flush_count += 1;
        Ok(())
    }

    fn rollback_main(&mut self) -> Result<()> {
        self.main = self.flushed_main.clone();
        Ok(())
    }

    fn has_collection(&self, smname: &str) -> bool {
        self.collections.contains_key(smname)
    }

    fn store_entry(&mut self, smname: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.collections
            .entry(smname.to_string())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    fn fetch_entry(&self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .collections
            .get(smname)
            .and_then(|c| c.get(key))
            .cloned())
    }

    fn remove_entry(&mut self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .collections
            .get_mut(smname)
            .and_then(|c| c.remove(key)))
    }

    fn entry_keys(&self, smname: &str) -> Result<Vec<String>> {
        Ok(self
            .collections
            .get(smname)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    fn flush_all(&mut self) -> Result<()> {
        self.flush_main()
    }
}
