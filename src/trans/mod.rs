//! Transactions.
//!
//! A transaction is an ordered log of graph operations against one
//! `GraphManager`. Two variants:
//!
//! - `ConcurrentTrans` buffers operations and applies them all in `commit`,
//!   atomically: either every operation (and every rule it triggers) is
//!   applied, or none is.
//! - `RollingTrans` wraps a concurrent transaction and commits it every N
//!   operations, starting a fresh one each time. Atomicity holds per batch
//!   only; see its docs.
//!
//! Lifecycle: `Open` until `commit` or `rollback`. A transaction that is no
//! longer open rejects appends with `TransactionClosed`; a second commit
//! fails with `AlreadyCommitted`.

pub mod concurrent;
pub mod rolling;

pub use concurrent::ConcurrentTrans;
pub use rolling::{RollingTrans, TransFactory};

use crate::data::{Edge, Node};
use crate::error::Result;
use crate::graph::Mutation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Open,
    Committed,
    /// Commit failed; nothing from the failed commit was applied.
    Failed,
    RolledBack,
}

pub trait Trans: Send {
    /// Append one operation. Validation happens here, before any storage
    /// access.
    fn append(&mut self, mutation: Mutation) -> Result<()>;

    /// Number of buffered, uncommitted operations.
    fn len(&self) -> usize;

    fn commit(&mut self) -> Result<()>;

    /// Discard buffered operations and close the transaction.
    fn rollback(&mut self) -> Result<()>;

    fn state(&self) -> TransState;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store_node(&mut self, part: &str, node: Node) -> Result<()> {
        self.append(Mutation::StoreNode {
            partition: part.to_string(),
            node,
        })
    }

    /// Merge `node`'s attributes into the stored node (or store it).
    fn update_node(&mut self, part: &str, node: Node) -> Result<()> {
        self.append(Mutation::UpdateNode {
            partition: part.to_string(),
            node,
        })
    }

    fn remove_node(&mut self, part: &str, key: &str, kind: &str) -> Result<()> {
        self.append(Mutation::RemoveNode {
            partition: part.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        })
    }

    fn store_edge(&mut self, part: &str, edge: Edge) -> Result<()> {
        self.append(Mutation::StoreEdge {
            partition: part.to_string(),
            edge,
        })
    }

    fn remove_edge(&mut self, part: &str, key: &str, kind: &str) -> Result<()> {
        self.append(Mutation::RemoveEdge {
            partition: part.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        })
    }
}
