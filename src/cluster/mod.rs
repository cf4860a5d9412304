//! Distributed storage over a set of cluster members.
//!
//! A `Cluster` is an explicit context object: the member registry lives in
//! it, not in process-global state, so independent clusters (and tests)
//! never share members. Members are only removed by `reset`.
//!
//! # Placement
//!
//! Every entry `(collection, key)` has one owner: BLAKE3 of
//! `collection \0 key`, first 8 bytes, modulo the sorted member ids.
//! Joining a member changes ownership of some entries; those are queued on
//! the member currently holding them and moved by the transfer workers.
//!
//! # Lock order
//!
//! placement lock, then member registry, then member storage.

pub mod distributed;
pub mod member;
pub mod transfer;
pub mod util;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::data::validate_name;
use crate::error::{GraphError, Result};
use crate::storage::GraphStorage;

pub use distributed::DistributedStorage;
pub use member::{MemberStorage, TransferFrame, TransferJob};
pub use transfer::{TransferHandle, TransferReport};
pub use util::to_u64;

/// Main-database key holding a member's location id.
pub const LOCATION_KEY: &str = "\u{0}cluster.location";

/// Owner of an entry among `ids` (sorted), `None` for an empty cluster.
pub fn owner(ids: &[u64], smname: &str, key: &str) -> Option<u64> {
    if ids.is_empty() {
        return None;
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(smname.as_bytes());
    hasher.update(&[0]);
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    let slot = u64::from_le_bytes(bytes) % ids.len() as u64;
    Some(ids[slot as usize])
}

pub(crate) struct ClusterInner {
    pub(crate) config: ClusterConfig,
    members: RwLock<BTreeMap<u64, Arc<MemberStorage>>>,
    next_id: AtomicU64,
    placement: Mutex<()>,
    epoch: AtomicU64,
}

/// Marks an entry move in flight; the epoch is odd while it lives.
pub(crate) struct EpochGuard<'a>(&'a AtomicU64);

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ClusterInner {
    pub(crate) fn placement(&self) -> Result<MutexGuard<'_, ()>> {
        self.placement
            .lock()
            .map_err(|_| GraphError::poisoned("placement"))
    }

    /// Members ordered by id.
    pub(crate) fn snapshot(&self) -> Result<Vec<Arc<MemberStorage>>> {
        let members = self
            .members
            .read()
            .map_err(|_| GraphError::poisoned("member registry"))?;
        Ok(members.values().cloned().collect())
    }

    pub(crate) fn member_ids(&self) -> Result<Vec<u64>> {
        let members = self
            .members
            .read()
            .map_err(|_| GraphError::poisoned("member registry"))?;
        Ok(members.keys().copied().collect())
    }

    pub(crate) fn member_by_id(&self, id: u64) -> Result<Option<Arc<MemberStorage>>> {
        let members = self
            .members
            .read()
            .map_err(|_| GraphError::poisoned("member registry"))?;
        Ok(members.get(&id).cloned())
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_move(&self) -> EpochGuard<'_> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        EpochGuard(&self.epoch)
    }
}

#[derive(Clone)]
pub struct Cluster {
    pub(crate) inner: Arc<ClusterInner>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new(ClusterConfig::default())
    }
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                config,
                members: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                placement: Mutex::new(()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Add a member and return a distributed handle bound to it.
    ///
    /// The member keeps the location id recorded in its storage if it has
    /// one. Cluster metadata is copied from an existing member. Entries
    /// whose owner changed are queued for transfer; call
    /// `wait_for_transfer` to move them.
    pub fn join(&self, name: &str, mut storage: Box<dyn GraphStorage>) -> Result<DistributedStorage> {
        validate_name("Member name", name)?;

        let _placement = self.inner.placement()?;
        let mut members = self
            .inner
            .members
            .write()
            .map_err(|_| GraphError::poisoned("member registry"))?;

        if members.values().any(|m| m.name() == name) {
            return Err(GraphError::InvalidData(format!("Member {} already joined", name)));
        }

        let recorded = storage.main_db().get(LOCATION_KEY).map(to_u64);
        let id = match recorded {
            Some(id) if !members.contains_key(&id) => {
                self.inner.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
                id
            }
            _ => loop {
                let candidate = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                if !members.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        if let Some(first) = members.values().next() {
            let main = first.read()?.main_db().clone();
            *storage.main_db_mut() = main;
        }
        storage
            .main_db_mut()
            .insert(LOCATION_KEY.to_string(), id.to_string());
        storage.flush_main()?;

        let member = Arc::new(MemberStorage::new(id, name.to_string(), storage));
        members.insert(id, Arc::clone(&member));
        let snapshot: Vec<Arc<MemberStorage>> = members.values().cloned().collect();
        let ids: Vec<u64> = members.keys().copied().collect();
        drop(members);

        info!(member = name, id, members = ids.len(), "Member joined");

        let plans = snapshot
            .par_iter()
            .map(|m| plan_moves(m, &ids).map(|jobs| (Arc::clone(m), jobs)))
            .collect::<Result<Vec<_>>>()?;
        for (m, jobs) in plans {
            if !jobs.is_empty() {
                debug!(member = m.name(), entries = jobs.len(), "Queued entries for transfer");
                m.queue(jobs)?;
            }
        }

        DistributedStorage::new(self.clone(), member)
    }

    /// Registered members, ordered by id.
    pub fn members(&self) -> Result<Vec<Arc<MemberStorage>>> {
        self.inner.snapshot()
    }

    pub fn member(&self, name: &str) -> Result<Arc<MemberStorage>> {
        self.inner
            .snapshot()?
            .into_iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| GraphError::MemberNotFound(name.to_string()))
    }

    /// Remove every member. Running transfers are cancelled.
    pub fn reset(&self) -> Result<()> {
        let _placement = self.inner.placement()?;
        let mut members = self
            .inner
            .members
            .write()
            .map_err(|_| GraphError::poisoned("member registry"))?;
        for member in members.values() {
            member.cancel();
        }
        let removed = members.len();
        members.clear();
        info!(removed, "Cluster reset");
        Ok(())
    }

    /// Human-readable listing of which member holds which entries of
    /// `smname`.
    pub fn dump_layout(&self, smname: &str) -> Result<String> {
        let members = self.inner.snapshot()?;
        let mut out = String::new();
        for member in members {
            let _ = writeln!(out, "MemoryStorage: {}", member.name());
            member.dump(smname, &mut out)?;
        }
        Ok(out)
    }

    /// Run one transfer worker per current member and block until all of
    /// them finish.
    pub fn wait_for_transfer(&self) -> Result<Vec<TransferReport>> {
        let members = self.inner.snapshot()?;
        for member in &members {
            member.clear_cancel();
        }
        self.run_transfers(&members)
    }

    /// Like `wait_for_transfer`, on a background thread.
    pub fn start_transfer(&self) -> Result<TransferHandle> {
        let members = self.inner.snapshot()?;
        for member in &members {
            member.clear_cancel();
        }
        Ok(TransferHandle::spawn(self.clone(), members))
    }

    /// Ask running transfer workers to stop after their current batch.
    pub fn cancel_transfers(&self) {
        if let Ok(members) = self.inner.snapshot() {
            for member in members {
                member.cancel();
            }
        }
    }

    pub(crate) fn run_transfers(&self, members: &[Arc<MemberStorage>]) -> Result<Vec<TransferReport>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = &*self.inner;

        thread::scope(|scope| {
            for member in members {
                let tx = tx.clone();
                scope.spawn(move || {
                    let _ = tx.send(transfer::run(inner, member));
                });
            }
        });
        drop(tx);

        let mut reports = Vec::with_capacity(members.len());
        let mut failure = None;
        for result in rx.iter() {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        reports.sort_by(|a, b| a.member.cmp(&b.member));
        Ok(reports)
    }
}

fn plan_moves(member: &MemberStorage, ids: &[u64]) -> Result<Vec<TransferJob>> {
    let storage = member.read()?;
    let mut jobs = Vec::new();
    for smname in storage.collection_names() {
        for key in storage.entry_keys(&smname)? {
            if owner(ids, &smname, &key) != Some(member.id()) {
                jobs.push(TransferJob {
                    smname: smname.clone(),
                    key,
                });
            }
        }
    }
    Ok(jobs)
}
