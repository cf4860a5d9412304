//! Shadow buffer for all-or-nothing commits.
//!
//! A `StagedStorage` sits on top of a base store for the duration of one
//! commit. Reads see staged writes first, writes never reach the base
//! until `apply()`. Dropping the staging discards everything, which makes
//! a failed commit (including any rule-triggered cascades) invisible.

use std::collections::BTreeMap;

use tracing::{error, warn};

use crate::error::Result;
use crate::storage::{GraphStorage, MainDb};

/// Staged entry state: `Some` = stored value, `None` = removed.
type StagedEntries = BTreeMap<String, BTreeMap<String, Option<Vec<u8>>>>;

pub struct StagedStorage<'a> {
    base: &'a mut dyn GraphStorage,
    main: MainDb,
    main_dirty: bool,
    writes: StagedEntries,
}

impl<'a> StagedStorage<'a> {
    pub fn new(base: &'a mut dyn GraphStorage) -> Self {
        let main = base.main_db().clone();
        Self {
            base,
            main,
            main_dirty: false,
            writes: BTreeMap::new(),
        }
    }

    /// Number of staged entry writes (stores + removes).
    pub fn staged_len(&self) -> usize {
        self.writes.values().map(BTreeMap::len).sum()
    }

    /// Main-database keys whose value differs from the base.
    pub fn changed_main_keys(&self) -> Vec<String> {
        let base = self.base.main_db();
        let mut changed: Vec<String> = self
            .main
            .iter()
            .filter(|(k, v)| base.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(base.keys().filter(|k| !self.main.contains_key(*k)).cloned());
        changed.sort();
        changed
    }

    /// Push every staged write into the base store and flush it.
    ///
    /// If any write or the flush fails, the base is put back the way it was
    /// before: every touched entry gets its previous value and the main
    /// database its previous contents.
    pub fn apply(self) -> Result<()> {
        let StagedStorage { base, main, main_dirty, writes } = self;
        let original_main = base.main_db().clone();
        let mut undo: Vec<(String, String, Option<Vec<u8>>)> = Vec::new();

        let outcome = write_through(&mut *base, writes, &mut undo).and_then(|()| {
            if main_dirty || *base.main_db() != main {
                *base.main_db_mut() = main;
            }
            base.flush_all()
        });

        if let Err(e) = outcome {
            restore(&mut *base, undo, original_main);
            return Err(e);
        }
        Ok(())
    }

    fn staged(&self, smname: &str, key: &str) -> Option<&Option<Vec<u8>>> {
        self.writes.get(smname).and_then(|c| c.get(key))
    }
}

/// Write staged entries into `base`, recording each previous value in
/// `undo` before it is overwritten.
fn write_through(
    base: &mut dyn GraphStorage,
    writes: StagedEntries,
    undo: &mut Vec<(String, String, Option<Vec<u8>>)>,
) -> Result<()> {
    for (smname, entries) in writes {
        for (key, value) in entries {
            let previous = base.fetch_entry(&smname, &key)?;
            undo.push((smname.clone(), key.clone(), previous));
            match value {
                Some(bytes) => base.store_entry(&smname, &key, bytes)?,
                None => {
                    base.remove_entry(&smname, &key)?;
                }
            }
        }
    }
    Ok(())
}

/// Undo a partially applied commit. Failures here are logged; the caller
/// already has the error that caused the undo.
fn restore(base: &mut dyn GraphStorage, undo: Vec<(String, String, Option<Vec<u8>>)>, main: MainDb) {
    for (smname, key, previous) in undo.into_iter().rev() {
        let restored = match previous {
            Some(bytes) => base.store_entry(&smname, &key, bytes),
            None => base.remove_entry(&smname, &key).map(|_| ()),
        };
        if let Err(e) = restored {
            error!(collection = %smname, key = %key, error = %e, "Could not restore entry");
        }
    }

    *base.main_db_mut() = main;
    if let Err(e) = base.flush_all() {
        warn!(store = base.name(), error = %e, "Flush after restore failed, store stays dirty");
    }
}

impl GraphStorage for StagedStorage<'_> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn main_db(&self) -> &MainDb {
        &self.main
    }

    fn main_db_mut(&mut self) -> &mut MainDb {
        self.main_dirty = true;
        &mut self.main
    }

    fn flush_main(&mut self) -> Result<()> {
        // Deferred until apply()
        self.main_dirty = true;
        Ok(())
    }

    fn rollback_main(&mut self) -> Result<()> {
        self.main = self.base.main_db().clone();
        self.main_dirty = false;
        Ok(())
    }

    fn has_collection(&self, smname: &str) -> bool {
        self.base.has_collection(smname)
            || self
                .writes
                .get(smname)
                .map(|c| c.values().any(Option::is_some))
                .unwrap_or(false)
    }

    fn store_entry(&mut self, smname: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.writes
            .entry(smname.to_string())
            .or_default()
            .insert(key.to_string(), Some(value));
        Ok(())
    }

    fn fetch_entry(&self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match self.staged(smname, key) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.fetch_entry(smname, key),
        }
    }

    fn remove_entry(&mut self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let previous = self.fetch_entry(smname, key)?;
        if previous.is_some() {
            self.writes
                .entry(smname.to_string())
                .or_default()
                .insert(key.to_string(), None);
        }
        Ok(previous)
    }

    fn entry_keys(&self, smname: &str) -> Result<Vec<String>> {
        let mut keys = self.base.entry_keys(smname)?;
        if let Some(staged) = self.writes.get(smname) {
            keys.retain(|k| !matches!(staged.get(k), Some(None)));
            for (key, value) in staged {
                if value.is_some() {
                    keys.push(key.clone());
                }
            }
            keys.sort();
            keys.dedup();
        }
        Ok(keys)
    }

    fn collection_names(&self) -> Vec<String> {
        let mut names = self.base.collection_names();
        for (smname, entries) in &self.writes {
            if entries.values().any(Option::is_some) {
                names.push(smname.clone());
            }
        }
        names.sort();
        names.dedup();
        names
    }

    fn flush_all(&mut self) -> Result<()> {
        self.main_dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn seeded() -> MemoryStorage {
        let mut base = MemoryStorage::new("base");
        base.store_entry("col", "a", vec![1]).unwrap();
        base.store_entry("col", "b", vec![2]).unwrap();
        base.main_db_mut().insert("m".into(), "1".into());
        base
    }

    #[test]
    fn test_reads_see_staged_writes() {
        let mut base = seeded();
        let mut staged = StagedStorage::new(&mut base);

        staged.store_entry("col", "c", vec![3]).unwrap();
        staged.remove_entry("col", "a").unwrap();

        assert_eq!(staged.fetch_entry("col", "c").unwrap(), Some(vec![3]));
        assert_eq!(staged.fetch_entry("col", "a").unwrap(), None);
        assert_eq!(staged.entry_keys("col").unwrap(), vec!["b", "c"]);
        assert_eq!(staged.staged_len(), 2);
    }

    #[test]
    fn test_drop_discards_everything() {
        let mut base = seeded();
        {
            let mut staged = StagedStorage::new(&mut base);
            staged.store_entry("col", "c", vec![3]).unwrap();
            staged.remove_entry("col", "a").unwrap();
            staged.main_db_mut().insert("m".into(), "2".into());
            staged.store_entry("new", "x", vec![0]).unwrap();
        }

        assert_eq!(base.entry_keys("col").unwrap(), vec!["a", "b"]);
        assert_eq!(base.main_db().get("m"), Some(&"1".to_string()));
        assert!(!base.has_collection("new"));
    }

    #[test]
    fn test_apply_writes_through() {
        let mut base = seeded();
        {
            let mut staged = StagedStorage::new(&mut base);
            staged.store_entry("col", "c", vec![3]).unwrap();
            staged.remove_entry("col", "a").unwrap();
            staged.main_db_mut().insert("m".into(), "2".into());
            staged.apply().unwrap();
        }

        assert_eq!(base.entry_keys("col").unwrap(), vec!["b", "c"]);
        assert_eq!(base.main_db().get("m"), Some(&"2".to_string()));
        assert!(base.flush_count() >= 1);
    }

    /// Memory store whose `flush_all` always fails.
    struct FailingFlush(MemoryStorage);

    impl GraphStorage for FailingFlush {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn main_db(&self) -> &MainDb {
            self.0.main_db()
        }
        fn main_db_mut(&mut self) -> &mut MainDb {
            self.0.main_db_mut()
        }
        fn flush_main(&mut self) -> Result<()> {
            self.0.flush_main()
        }
        fn rollback_main(&mut self) -> Result<()> {
            self.0.rollback_main()
        }
        fn has_collection(&self, smname: &str) -> bool {
            self.0.has_collection(smname)
        }
        fn store_entry(&mut self, smname: &str, key: &str, value: Vec<u8>) -> Result<()> {
            self.0.store_entry(smname, key, value)
        }
        fn fetch_entry(&self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.fetch_entry(smname, key)
        }
        fn remove_entry(&mut self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.remove_entry(smname, key)
        }
        fn entry_keys(&self, smname: &str) -> Result<Vec<String>> {
            self.0.entry_keys(smname)
        }
        fn collection_names(&self) -> Vec<String> {
            self.0.collection_names()
        }
        fn flush_all(&mut self) -> Result<()> {
            Err(crate::error::GraphError::Storage("disk full".to_string()))
        }
    }

    #[test]
    fn test_failed_apply_restores_base() {
        let mut base = FailingFlush(seeded());
        {
            let mut staged = StagedStorage::new(&mut base);
            staged.store_entry("col", "a", vec![10]).unwrap();
            staged.store_entry("col", "c", vec![3]).unwrap();
            staged.remove_entry("col", "b").unwrap();
            staged.main_db_mut().insert("m".into(), "2".into());
            assert!(staged.apply().is_err());
        }

        assert_eq!(base.fetch_entry("col", "a").unwrap(), Some(vec![1]));
        assert_eq!(base.fetch_entry("col", "b").unwrap(), Some(vec![2]));
        assert_eq!(base.fetch_entry("col", "c").unwrap(), None);
        assert_eq!(base.entry_keys("col").unwrap(), vec!["a", "b"]);
        assert_eq!(base.main_db().get("m"), Some(&"1".to_string()));
    }

    #[test]
    fn test_remove_missing_stages_nothing() {
        let mut base = seeded();
        let mut staged = StagedStorage::new(&mut base);
        assert_eq!(staged.remove_entry("col", "zzz").unwrap(), None);
        assert_eq!(staged.staged_len(), 0);
    }

    #[test]
    fn test_new_collection_visible_while_staged() {
        let mut base = seeded();
        let mut staged = StagedStorage::new(&mut base);
        assert!(!staged.has_collection("fresh"));
        staged.store_entry("fresh", "k", vec![]).unwrap();
        assert!(staged.has_collection("fresh"));
        assert_eq!(staged.collection_names(), vec!["col", "fresh"]);
    }

    #[test]
    fn test_changed_main_keys() {
        let mut base = seeded();
        base.main_db_mut().insert("gone".into(), "x".into());
        let mut staged = StagedStorage::new(&mut base);
        assert!(staged.changed_main_keys().is_empty());

        staged.main_db_mut().insert("m".into(), "1".into());
        staged.main_db_mut().insert("added".into(), "y".into());
        staged.main_db_mut().remove("gone");
        assert_eq!(staged.changed_main_keys(), vec!["added", "gone"]);
    }
}
