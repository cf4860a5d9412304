//! FishDB core.
//!
//! A typed property graph kept in a generic key/value store:
//! - `graph`: the graph manager (nodes, edges, registries, indexes)
//! - `rules`: event rules run inside every commit
//! - `trans`: buffered and rolling transactions
//! - `storage`: the storage trait with memory and disk backends
//! - `cluster`: placement of storage entries across cluster members

pub mod cluster;
pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod rules;
pub mod storage;
pub mod trans;

pub use cluster::{Cluster, DistributedStorage, MemberStorage, TransferHandle, TransferReport};
pub use config::{ClusterConfig, GraphConfig};
pub use data::{Edge, EdgeEnd, EndSide, Node, Value};
pub use error::{GraphError, Result};
pub use graph::{GraphManager, IndexQuery, Mutation, Traversal};
pub use rules::{EventKind, GraphEvent, Rule, RuleContext, RulePhase};
pub use storage::{DiskStorage, GraphStorage, MemoryStorage};
pub use trans::{ConcurrentTrans, RollingTrans, Trans, TransState};
