//! Directory-backed storage.
//!
//! # Storage Layout
//!
//! ```text
//! <path>/
//! +-- main.json               # Main database (serde_json)
//! +-- collections/
//! |   +-- main.Person.nodes   # One bincode-encoded Collection per file
//! |   +-- main.Person.nodeidx
//! |   +-- ...
//! ```
//!
//! Writes go to memory first; `flush_main` rewrites `main.json`,
//! `flush_all` additionally rewrites every collection touched since the
//! last flush.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{GraphError, Result};
use crate::storage::{Collection, GraphStorage, MainDb, MemoryStorage};

const MAIN_FILE: &str = "main.json";
const COLLECTIONS_DIR: &str = "collections";

pub struct DiskStorage {
    path: PathBuf,
    inner: MemoryStorage,
    dirty: HashSet<String>,
}

impl DiskStorage {
    /// Create a new, empty store. Fails if the directory already holds one.
    pub fn create(path: &Path) -> Result<Self> {
        if path.join(MAIN_FILE).exists() {
            return Err(GraphError::Storage(format!(
                "Store already exists at {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(path.join(COLLECTIONS_DIR))?;

        let mut storage = Self {
            path: path.to_path_buf(),
            inner: MemoryStorage::new(store_name(path)),
            dirty: HashSet::new(),
        };
        storage.flush_main()?;
        Ok(storage)
    }

    /// Open an existing store and load every collection into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let main_path = path.join(MAIN_FILE);
        if !main_path.exists() {
            return Err(GraphError::Storage(format!(
                "No store found at {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(&main_path)?;
        let main: MainDb = serde_json::from_str(&contents)?;

        let mut inner = MemoryStorage::new(store_name(path));
        inner.restore_main(main);

        let col_dir = path.join(COLLECTIONS_DIR);
        if col_dir.exists() {
            for entry in std::fs::read_dir(&col_dir)? {
                let entry = entry?;
                let smname = entry.file_name().to_string_lossy().into_owned();
                let bytes = std::fs::read(entry.path())?;
                let collection: Collection = bincode::deserialize(&bytes)?;
                inner.insert_collection(smname, collection);
            }
        }

        tracing::debug!(path = %path.display(), "opened disk storage");

        Ok(Self {
            path: path.to_path_buf(),
            inner,
            dirty: HashSet::new(),
        })
    }

    /// Open the store at `path`, creating it if missing.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if path.join(MAIN_FILE).exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_collection(&self, smname: &str) -> Result<()> {
        let file = self.path.join(COLLECTIONS_DIR).join(smname);
        match self.inner.collection(smname) {
            Some(collection) => {
                let bytes = bincode::serialize(collection)?;
                std::fs::write(file, bytes)?;
            }
            None => {
                if file.exists() {
                    std::fs::remove_file(file)?;
                }
            }
        }
        Ok(())
    }
}

fn store_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl GraphStorage for DiskStorage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn main_db(&self) -> &MainDb {
        self.inner.main_db()
    }

    fn main_db_mut(&mut self) -> &mut MainDb {
        self.inner.main_db_mut()
    }

    fn flush_main(&mut self) -> Result<()> {
        let json = serde_json::to_string_pretty(self.inner.main_db())?;
        std::fs::write(self.path.join(MAIN_FILE), json)?;
        self.inner.flush_main()
    }

    fn rollback_main(&mut self) -> Result<()> {
        self.inner.rollback_main()
    }

    fn has_collection(&self, smname: &str) -> bool {
        self.inner.has_collection(smname)
    }

    fn store_entry(&mut self, smname: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.dirty.insert(smname.to_string());
        self.inner.store_entry(smname, key, value)
    }

    fn fetch_entry(&self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.fetch_entry(smname, key)
    }

    fn remove_entry(&mut self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.dirty.insert(smname.to_string());
        self.inner.remove_entry(smname, key)
    }

    fn entry_keys(&self, smname: &str) -> Result<Vec<String>> {
        self.inner.entry_keys(smname)
    }

    fn collection_names(&self) -> Vec<String> {
        self.inner.collection_names()
    }

    fn flush_all(&mut self) -> Result<()> {
        let mut dirty: Vec<String> = self.dirty.iter().cloned().collect();
        dirty.sort();
        for smname in &dirty {
            self.write_collection(smname)?;
            self.dirty.remove(smname);
        }
        self.flush_main()
    }
}
