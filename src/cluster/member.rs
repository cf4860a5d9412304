//! One storage member of a cluster.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::cluster::{to_u64, LOCATION_KEY};
use crate::error::{GraphError, Result};
use crate::storage::GraphStorage;

/// Entry queued for relocation off this member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub smname: String,
    pub key: String,
}

/// Unit sent from a source member to a target member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferFrame {
    pub smname: String,
    pub key: String,
    pub value: Vec<u8>,
}

pub struct MemberStorage {
    id: u64,
    name: String,
    storage: RwLock<Box<dyn GraphStorage>>,
    pending: Mutex<VecDeque<TransferJob>>,
    cancelled: AtomicBool,
    transfer_runs: AtomicU64,
}

impl MemberStorage {
    pub(crate) fn new(id: u64, name: String, storage: Box<dyn GraphStorage>) -> Self {
        Self {
            id,
            name,
            storage: RwLock::new(storage),
            pending: Mutex::new(VecDeque::new()),
            cancelled: AtomicBool::new(false),
            transfer_runs: AtomicU64::new(0),
        }
    }

    /// Location id, stable across restarts of the member's storage.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times a transfer worker ran for this member.
    pub fn transfer_runs(&self) -> u64 {
        self.transfer_runs.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Number of entries this member holds in `smname`.
    pub fn entry_count(&self, smname: &str) -> Result<usize> {
        Ok(self.read()?.entry_keys(smname)?.len())
    }

    /// Keys this member holds in `smname`.
    pub fn entry_keys(&self, smname: &str) -> Result<Vec<String>> {
        self.read()?.entry_keys(smname)
    }

    /// Location id as recorded in the member's own main database.
    pub fn recorded_location(&self) -> Result<Option<u64>> {
        Ok(self.read()?.main_db().get(LOCATION_KEY).map(to_u64))
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Box<dyn GraphStorage>>> {
        self.storage
            .read()
            .map_err(|_| GraphError::poisoned("member storage"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Box<dyn GraphStorage>>> {
        self.storage
            .write()
            .map_err(|_| GraphError::poisoned("member storage"))
    }

    pub(crate) fn queue(&self, jobs: Vec<TransferJob>) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| GraphError::poisoned("transfer queue"))?;
        for job in jobs {
            if !pending.contains(&job) {
                pending.push_back(job);
            }
        }
        Ok(())
    }

    pub(crate) fn take_batch(&self, max: usize) -> Result<Vec<TransferJob>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| GraphError::poisoned("transfer queue"))?;
        let n = max.min(pending.len());
        Ok(pending.drain(..n).collect())
    }

    /// Put unprocessed jobs back at the front of the queue.
    pub(crate) fn requeue_front(&self, jobs: Vec<TransferJob>) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| GraphError::poisoned("transfer queue"))?;
        for job in jobs.into_iter().rev() {
            pending.push_front(job);
        }
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_run(&self) {
        self.transfer_runs.fetch_add(1, Ordering::SeqCst);
    }

    /// Accept an entry from another member. An entry already present is
    /// kept as is. Returns true if the frame was stored.
    pub(crate) fn receive_frame(&self, bytes: &[u8]) -> Result<bool> {
        let frame: TransferFrame = rmp_serde::from_slice(bytes)?;
        let mut storage = self.write()?;
        if storage.fetch_entry(&frame.smname, &frame.key)?.is_some() {
            return Ok(false);
        }
        storage.store_entry(&frame.smname, &frame.key, frame.value)?;
        Ok(true)
    }

    /// Append a listing of this member's entries in `smname` to `out`.
    pub(crate) fn dump(&self, smname: &str, out: &mut String) -> Result<()> {
        let storage = self.read()?;
        if !storage.has_collection(smname) {
            return Ok(());
        }
        let _ = writeln!(out, "{}", smname);
        for key in storage.entry_keys(smname)? {
            let size = storage.fetch_entry(smname, &key)?.map(|v| v.len()).unwrap_or(0);
            let _ = writeln!(out, "    {} ({} bytes)", key, size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn member() -> MemberStorage {
        MemberStorage::new(1, "m1".into(), Box::new(MemoryStorage::new("m1")))
    }

    fn job(key: &str) -> TransferJob {
        TransferJob {
            smname: "col".into(),
            key: key.into(),
        }
    }

    #[test]
    fn test_queue_dedups_and_batches() {
        let m = member();
        m.queue(vec![job("a"), job("b"), job("a"), job("c")]).unwrap();
        assert_eq!(m.pending_len(), 3);

        let batch = m.take_batch(2).unwrap();
        assert_eq!(batch, vec![job("a"), job("b")]);
        m.requeue_front(batch).unwrap();
        assert_eq!(m.take_batch(10).unwrap(), vec![job("a"), job("b"), job("c")]);
    }

    #[test]
    fn test_receive_frame_keeps_existing() {
        let m = member();
        let frame = |v: u8| {
            rmp_serde::to_vec(&TransferFrame {
                smname: "col".into(),
                key: "k".into(),
                value: vec![v],
            })
            .unwrap()
        };

        assert!(m.receive_frame(&frame(1)).unwrap());
        assert!(!m.receive_frame(&frame(2)).unwrap());
        assert_eq!(m.read().unwrap().fetch_entry("col", "k").unwrap(), Some(vec![1]));
        assert!(m.receive_frame(b"garbage").is_err());
    }

    #[test]
    fn test_dump_lists_entries() {
        let m = member();
        m.write().unwrap().store_entry("col", "k1", vec![1, 2, 3]).unwrap();

        let mut out = String::new();
        m.dump("col", &mut out).unwrap();
        m.dump("missing", &mut out).unwrap();
        assert_eq!(out, "col\n    k1 (3 bytes)\n");
    }
}
