//! Batch-committing transaction for bulk loads.
//!
//! # Atomicity
//!
//! A rolling transaction is atomic per batch, not as a whole. Every batch
//! of `threshold` operations is committed on its own as soon as it is
//! full. If a later batch fails, the batches before it stay committed, and
//! `rollback` only discards the current, unfinished batch.

use std::sync::Arc;

use tracing::debug;

use crate::error::{GraphError, Result};
use crate::graph::{GraphManager, Mutation};
use crate::trans::{ConcurrentTrans, Trans, TransState};

/// Builds the inner transaction for each new batch.
pub type TransFactory = Box<dyn Fn(Arc<GraphManager>) -> Box<dyn Trans> + Send>;

pub struct RollingTrans {
    gm: Arc<GraphManager>,
    inner: Box<dyn Trans>,
    factory: TransFactory,
    threshold: usize,
    count: usize,
    batches: usize,
    state: TransState,
}

impl RollingTrans {
    /// Wrap `inner`, committing it every `threshold` operations and
    /// replacing it with `factory(gm)`.
    ///
    /// Fails with `InvalidThreshold` if `threshold < 1`.
    pub fn new(
        inner: Box<dyn Trans>,
        threshold: i64,
        gm: Arc<GraphManager>,
        factory: TransFactory,
    ) -> Result<Self> {
        if threshold < 1 {
            return Err(GraphError::InvalidThreshold(threshold));
        }
        let threshold = usize::try_from(threshold).map_err(|_| GraphError::InvalidThreshold(threshold))?;

        Ok(Self {
            count: inner.len(),
            gm,
            inner,
            factory,
            threshold,
            batches: 0,
            state: TransState::Open,
        })
    }

    /// Rolling transaction over `ConcurrentTrans` batches.
    pub fn with_concurrent(gm: Arc<GraphManager>, threshold: i64) -> Result<Self> {
        let inner = ConcurrentTrans::boxed(Arc::clone(&gm));
        Self::new(inner, threshold, gm, Box::new(ConcurrentTrans::boxed))
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Inner transactions committed so far.
    pub fn batches_committed(&self) -> usize {
        self.batches
    }

    fn commit_batch(&mut self) -> Result<()> {
        if let Err(e) = self.inner.commit() {
            self.state = TransState::Failed;
            return Err(e);
        }
        self.batches += 1;
        debug!(batch = self.batches, ops = self.count, "Rolling batch committed");
        self.count = 0;
        Ok(())
    }
}

impl Trans for RollingTrans {
    fn append(&mut self, mutation: Mutation) -> Result<()> {
        if self.state != TransState::Open {
            return Err(GraphError::TransactionClosed);
        }

        self.inner.append(mutation)?;
        self.count += 1;

        if self.count >= self.threshold {
            self.commit_batch()?;
            self.inner = (self.factory)(Arc::clone(&self.gm));
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.count
    }

    /// Commit the final partial batch, if any.
    fn commit(&mut self) -> Result<()> {
        match self.state {
            TransState::Committed => return Err(GraphError::AlreadyCommitted),
            TransState::Failed | TransState::RolledBack => return Err(GraphError::TransactionClosed),
            TransState::Open => {}
        }

        if self.count > 0 {
            self.commit_batch()?;
        }
        self.state = TransState::Committed;
        Ok(())
    }

    /// Discard the current batch. Earlier batches stay committed.
    fn rollback(&mut self) -> Result<()> {
        if self.state == TransState::Committed {
            return Err(GraphError::AlreadyCommitted);
        }
        if self.inner.state() == TransState::Open {
            self.inner.rollback()?;
        }
        self.count = 0;
        self.state = TransState::RolledBack;
        Ok(())
    }

    fn state(&self) -> TransState {
        self.state
    }
}
