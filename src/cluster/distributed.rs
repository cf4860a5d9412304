//! `GraphStorage` view over a whole cluster.
//!
//! Writes go to the entry's owner and clear stale copies elsewhere, under
//! the placement lock and with the epoch odd, like a transfer move. Reads
//! look at the owner first, then at every other member, because an entry
//! may still sit on its old member until the transfer workers move it.
//! Read-side scans are validated against the cluster epoch and retried if a
//! move happened meanwhile.

use std::sync::Arc;
use std::thread;

use tracing::warn;

use crate::cluster::member::MemberStorage;
use crate::cluster::{owner, Cluster, LOCATION_KEY};
use crate::error::{GraphError, Result};
use crate::storage::{GraphStorage, MainDb};

pub struct DistributedStorage {
    cluster: Cluster,
    member: Arc<MemberStorage>,
    name: String,
    main: MainDb,
}

impl DistributedStorage {
    pub(crate) fn new(cluster: Cluster, member: Arc<MemberStorage>) -> Result<Self> {
        let mut main = member.read()?.main_db().clone();
        main.remove(LOCATION_KEY);
        Ok(Self {
            name: format!("Distributed {}", member.name()),
            cluster,
            member,
            main,
        })
    }

    /// Member this handle joined as.
    pub fn member(&self) -> &Arc<MemberStorage> {
        &self.member
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Run `read` over the current members until no entry moved while it
    /// ran.
    fn read_stable<T>(&self, read: impl Fn(&[Arc<MemberStorage>]) -> Result<T>) -> Result<T> {
        let inner = &self.cluster.inner;
        loop {
            let before = inner.epoch();
            if before % 2 == 1 {
                thread::yield_now();
                continue;
            }
            let members = inner.snapshot()?;
            let value = read(&members)?;
            if inner.epoch() == before {
                return Ok(value);
            }
        }
    }
}

/// Members with the owner of `(smname, key)` first.
fn owner_first(members: &[Arc<MemberStorage>], smname: &str, key: &str) -> Vec<Arc<MemberStorage>> {
    let ids: Vec<u64> = members.iter().map(|m| m.id()).collect();
    let owner = owner(&ids, smname, key);
    let mut ordered: Vec<Arc<MemberStorage>> = members.to_vec();
    ordered.sort_by_key(|m| Some(m.id()) != owner);
    ordered
}

impl GraphStorage for DistributedStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn main_db(&self) -> &MainDb {
        &self.main
    }

    fn main_db_mut(&mut self) -> &mut MainDb {
        &mut self.main
    }

    /// Replicate the main database to every member, keeping each member's
    /// own location.
    fn flush_main(&mut self) -> Result<()> {
        for member in self.cluster.inner.snapshot()? {
            let mut main = self.main.clone();
            main.insert(LOCATION_KEY.to_string(), member.id().to_string());

            let mut storage = member.write()?;
            *storage.main_db_mut() = main;
            storage.flush_main()?;
        }
        Ok(())
    }

    fn rollback_main(&mut self) -> Result<()> {
        let mut storage = self.member.write()?;
        storage.rollback_main()?;
        let mut main = storage.main_db().clone();
        main.remove(LOCATION_KEY);
        self.main = main;
        Ok(())
    }

    fn has_collection(&self, smname: &str) -> bool {
        match self.read_stable(|members| {
            for member in members {
                if member.read()?.has_collection(smname) {
                    return Ok(true);
                }
            }
            Ok(false)
        }) {
            Ok(found) => found,
            Err(e) => {
                warn!(collection = smname, error = %e, "Collection lookup failed");
                false
            }
        }
    }

    fn store_entry(&mut self, smname: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let inner = &self.cluster.inner;
        let _placement = inner.placement()?;
        let members = inner.snapshot()?;
        let _epoch = inner.begin_move();

        let ordered = owner_first(&members, smname, key);
        let (target, others) = ordered
            .split_first()
            .ok_or_else(|| GraphError::Storage("Cluster has no members".to_string()))?;

        target.write()?.store_entry(smname, key, value)?;
        for other in others {
            other.write()?.remove_entry(smname, key)?;
        }
        Ok(())
    }

    fn fetch_entry(&self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_stable(|members| {
            for member in owner_first(members, smname, key) {
                if let Some(value) = member.read()?.fetch_entry(smname, key)? {
                    return Ok(Some(value));
                }
            }
            Ok(None)
        })
    }

    fn remove_entry(&mut self, smname: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = &self.cluster.inner;
        let _placement = inner.placement()?;
        let _epoch = inner.begin_move();

        let mut previous = None;
        for member in owner_first(&inner.snapshot()?, smname, key) {
            let removed = member.write()?.remove_entry(smname, key)?;
            if previous.is_none() {
                previous = removed;
            }
        }
        Ok(previous)
    }

    fn entry_keys(&self, smname: &str) -> Result<Vec<String>> {
        self.read_stable(|members| {
            let mut keys = Vec::new();
            for member in members {
                keys.extend(member.read()?.entry_keys(smname)?);
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    fn collection_names(&self) -> Vec<String> {
        let names = self.read_stable(|members| {
            let mut names = Vec::new();
            for member in members {
                names.extend(member.read()?.collection_names());
            }
            names.sort();
            names.dedup();
            Ok(names)
        });
        names.unwrap_or_else(|e| {
            warn!(error = %e, "Collection listing failed");
            Vec::new()
        })
    }

    fn flush_all(&mut self) -> Result<()> {
        self.flush_main()?;
        for member in self.cluster.inner.snapshot()? {
            member.write()?.flush_all()?;
        }
        Ok(())
    }
}
