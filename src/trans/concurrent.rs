//! Buffered transaction applied in one commit.

use std::sync::Arc;

use tracing::debug;

use crate::error::{GraphError, Result};
use crate::graph::{GraphManager, Mutation};
use crate::trans::{Trans, TransState};

pub struct ConcurrentTrans {
    gm: Arc<GraphManager>,
    ops: Vec<Mutation>,
    state: TransState,
}

impl ConcurrentTrans {
    pub fn new(gm: Arc<GraphManager>) -> Self {
        Self {
            gm,
            ops: Vec::new(),
            state: TransState::Open,
        }
    }

    /// Boxed constructor, usable as a rolling transaction factory.
    pub fn boxed(gm: Arc<GraphManager>) -> Box<dyn Trans> {
        Box::new(Self::new(gm))
    }

    pub fn pending(&self) -> &[Mutation] {
        &self.ops
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TransState::Open => Ok(()),
            _ => Err(GraphError::TransactionClosed),
        }
    }
}

impl Trans for ConcurrentTrans {
    fn append(&mut self, mutation: Mutation) -> Result<()> {
        self.ensure_open()?;
        mutation.validate()?;
        self.ops.push(mutation);
        Ok(())
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn commit(&mut self) -> Result<()> {
        match self.state {
            TransState::Committed => return Err(GraphError::AlreadyCommitted),
            TransState::Failed | TransState::RolledBack => return Err(GraphError::TransactionClosed),
            TransState::Open => {}
        }

        let ops = std::mem::take(&mut self.ops);
        match self.gm.commit_ops(&ops) {
            Ok(()) => {
                debug!(ops = ops.len(), "Transaction committed");
                self.state = TransState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = TransState::Failed;
                Err(e)
            }
        }
    }

    fn rollback(&mut self) -> Result<()> {
        if self.state == TransState::Committed {
            return Err(GraphError::AlreadyCommitted);
        }
        self.ops.clear();
        self.state = TransState::RolledBack;
        Ok(())
    }

    fn state(&self) -> TransState {
        self.state
    }
}
