//! Lock set of a graph manager.
//!
//! Two locks, always taken in this order:
//!
//! 1. `schema`  - the registry cache (read for lookups, write for commits)
//! 2. `storage` - the underlying `GraphStorage`
//!
//! With a configured timeout, acquisition polls `try_lock` until the
//! deadline and then fails with `GraphError::LockTimeout`. Without one it
//! blocks.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{GraphError, Result};
use crate::graph::schema::SchemaCache;
use crate::storage::GraphStorage;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub type StorageGuard<'a> = MutexGuard<'a, Box<dyn GraphStorage>>;

pub struct LockSet {
    schema: RwLock<SchemaCache>,
    storage: Mutex<Box<dyn GraphStorage>>,
    timeout: Option<Duration>,
}

/// Both locks held for the duration of one commit.
///
/// Fields drop in declaration order, so storage is released first.
pub struct MutationGuard<'a> {
    pub storage: StorageGuard<'a>,
    pub schema: RwLockWriteGuard<'a, SchemaCache>,
}

impl LockSet {
    pub fn new(storage: Box<dyn GraphStorage>, timeout: Option<Duration>) -> Self {
        Self {
            schema: RwLock::new(SchemaCache::new()),
            storage: Mutex::new(storage),
            timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn storage(&self) -> Result<StorageGuard<'_>> {
        match self.timeout {
            None => self.storage.lock().map_err(|_| GraphError::poisoned("storage")),
            Some(timeout) => poll("storage", timeout, || match self.storage.try_lock() {
                Ok(guard) => Ok(Some(guard)),
                Err(TryLockError::WouldBlock) => Ok(None),
                Err(TryLockError::Poisoned(_)) => Err(GraphError::poisoned("storage")),
            }),
        }
    }

    pub fn schema_read(&self) -> Result<RwLockReadGuard<'_, SchemaCache>> {
        match self.timeout {
            None => self.schema.read().map_err(|_| GraphError::poisoned("schema")),
            Some(timeout) => poll("schema", timeout, || match self.schema.try_read() {
                Ok(guard) => Ok(Some(guard)),
                Err(TryLockError::WouldBlock) => Ok(None),
                Err(TryLockError::Poisoned(_)) => Err(GraphError::poisoned("schema")),
            }),
        }
    }

    pub fn schema_write(&self) -> Result<RwLockWriteGuard<'_, SchemaCache>> {
        match self.timeout {
            None => self.schema.write().map_err(|_| GraphError::poisoned("schema")),
            Some(timeout) => poll("schema", timeout, || match self.schema.try_write() {
                Ok(guard) => Ok(Some(guard)),
                Err(TryLockError::WouldBlock) => Ok(None),
                Err(TryLockError::Poisoned(_)) => Err(GraphError::poisoned("schema")),
            }),
        }
    }

    /// Schema write lock, then storage.
    pub fn mutation(&self) -> Result<MutationGuard<'_>> {
        let schema = self.schema_write()?;
        let storage = self.storage()?;
        Ok(MutationGuard { storage, schema })
    }
}

fn poll<T>(
    what: &'static str,
    timeout: Duration,
    mut attempt: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(guard) = attempt()? {
            return Ok(guard);
        }
        if Instant::now() >= deadline {
            return Err(GraphError::LockTimeout(what));
        }
        thread::sleep(POLL_INTERVAL);
    }
}
