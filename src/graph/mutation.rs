//! Pending graph operations.

use crate::data::{validate_name, Edge, Node};
use crate::error::{GraphError, Result};

/// One operation in a transaction log or queued by a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Store a node, replacing any previous version.
    StoreNode { partition: String, node: Node },
    /// Merge attributes into a node, storing it if it does not exist.
    UpdateNode { partition: String, node: Node },
    RemoveNode { partition: String, key: String, kind: String },
    /// Store an edge, replacing any previous version.
    StoreEdge { partition: String, edge: Edge },
    RemoveEdge { partition: String, key: String, kind: String },
}

impl Mutation {
    pub fn partition(&self) -> &str {
        match self {
            Mutation::StoreNode { partition, .. }
            | Mutation::UpdateNode { partition, .. }
            | Mutation::RemoveNode { partition, .. }
            | Mutation::StoreEdge { partition, .. }
            | Mutation::RemoveEdge { partition, .. } => partition,
        }
    }

    /// Check names and keys without touching storage.
    pub fn validate(&self) -> Result<()> {
        validate_name("Partition", self.partition())?;
        match self {
            Mutation::StoreNode { node, .. } | Mutation::UpdateNode { node, .. } => node.validate(),
            Mutation::StoreEdge { edge, .. } => edge.validate(),
            Mutation::RemoveNode { key, kind, .. } | Mutation::RemoveEdge { key, kind, .. } => {
                if key.is_empty() {
                    return Err(GraphError::InvalidData(format!(
                        "Cannot remove {:?} without a key",
                        kind
                    )));
                }
                validate_name("Kind", kind)
            }
        }
    }

    /// Short description for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Mutation::StoreNode { partition, node } => {
                format!("store node {}/{}:{}", partition, node.kind, node.key)
            }
            Mutation::UpdateNode { partition, node } => {
                format!("update node {}/{}:{}", partition, node.kind, node.key)
            }
            Mutation::RemoveNode { partition, key, kind } => {
                format!("remove node {}/{}:{}", partition, kind, key)
            }
            Mutation::StoreEdge { partition, edge } => {
                format!("store edge {}/{}:{}", partition, edge.kind, edge.key)
            }
            Mutation::RemoveEdge { partition, key, kind } => {
                format!("remove edge {}/{}:{}", partition, kind, key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_checks_partition() {
        let ok = Mutation::StoreNode {
            partition: "main".into(),
            node: Node::new("p1", "Person"),
        };
        assert!(ok.validate().is_ok());

        let bad = Mutation::StoreNode {
            partition: "ma in".into(),
            node: Node::new("p1", "Person"),
        };
        assert!(matches!(bad.validate(), Err(GraphError::InvalidData(_))));
    }

    #[test]
    fn test_validate_remove() {
        let m = Mutation::RemoveEdge {
            partition: "main".into(),
            key: String::new(),
            kind: "Friend".into(),
        };
        assert!(m.validate().is_err());
        assert_eq!(m.describe(), "remove edge main/Friend:");
    }
}
