//! Transfer worker: moves queued entries off a member to their owner.
//!
//! Each entry is moved under the cluster placement lock, copy first, then
//! delete. The cluster epoch is odd while a move is in flight, so readers
//! that raced with a move can tell and retry.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::cluster::member::{MemberStorage, TransferFrame, TransferJob};
use crate::cluster::{Cluster, ClusterInner};
use crate::error::{GraphError, Result};

/// Outcome of one transfer run on one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub member: String,
    /// Entries copied to their owner and removed here.
    pub moved: usize,
    /// Jobs that no longer applied (entry gone or already in place).
    pub skipped: usize,
}

/// Drain the member's transfer queue in batches, checking for
/// cancellation between batches.
pub(crate) fn run(inner: &ClusterInner, member: &MemberStorage) -> Result<TransferReport> {
    member.mark_run();
    let mut report = TransferReport {
        member: member.name().to_string(),
        moved: 0,
        skipped: 0,
    };

    loop {
        if member.is_cancelled() {
            warn!(member = member.name(), moved = report.moved, "Transfer cancelled");
            return Err(GraphError::TransferCancelled(member.name().to_string()));
        }

        let batch = member.take_batch(inner.config.transfer_batch.max(1))?;
        if batch.is_empty() {
            break;
        }

        let mut jobs = batch.into_iter();
        while let Some(job) = jobs.next() {
            match move_entry(inner, member, &job) {
                Ok(true) => report.moved += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    let mut rest = vec![job];
                    rest.extend(jobs);
                    member.requeue_front(rest)?;
                    return Err(e);
                }
            }
        }
        debug!(member = member.name(), moved = report.moved, "Transfer batch done");
    }

    Ok(report)
}

fn move_entry(inner: &ClusterInner, source: &MemberStorage, job: &TransferJob) -> Result<bool> {
    let _placement = inner.placement()?;

    let ids = inner.member_ids()?;
    let Some(owner) = super::owner(&ids, &job.smname, &job.key) else {
        return Ok(false);
    };
    if owner == source.id() {
        return Ok(false);
    }
    let Some(target) = inner.member_by_id(owner)? else {
        return Ok(false);
    };

    let Some(value) = source.read()?.fetch_entry(&job.smname, &job.key)? else {
        return Ok(false);
    };
    let bytes = rmp_serde::to_vec(&TransferFrame {
        smname: job.smname.clone(),
        key: job.key.clone(),
        value,
    })?;

    let _epoch = inner.begin_move();
    target.receive_frame(&bytes)?;
    source.write()?.remove_entry(&job.smname, &job.key)?;
    Ok(true)
}

/// Background transfer run started by `Cluster::start_transfer`.
pub struct TransferHandle {
    cluster: Cluster,
    thread: JoinHandle<Result<Vec<TransferReport>>>,
}

impl TransferHandle {
    pub(crate) fn spawn(cluster: Cluster, members: Vec<Arc<MemberStorage>>) -> Self {
        let worker = cluster.clone();
        let thread = thread::spawn(move || worker.run_transfers(&members));
        Self { cluster, thread }
    }

    /// Ask every worker to stop after its current batch.
    pub fn cancel(&self) {
        self.cluster.cancel_transfers();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<Vec<TransferReport>> {
        self.thread
            .join()
            .map_err(|_| GraphError::Storage("Transfer thread panicked".to_string()))?
    }
}
