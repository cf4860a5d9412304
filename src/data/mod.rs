//! Graph data model: nodes, edges and attribute values

pub mod value;
pub mod node;
pub mod edge;

pub use value::Value;
pub use node::Node;
pub use edge::{Edge, EdgeEnd, EndSide};

use crate::error::{GraphError, Result};

pub const NODE_KEY: &str = "key";
pub const NODE_KIND: &str = "kind";
pub const NODE_NAME: &str = "name";

/// Attribute names which are always valid and never registered per kind.
pub const RESERVED_ATTRS: &[&str] = &[
    "key",
    "name",
    "kind",
    "end1key",
    "end1kind",
    "end1role",
    "end1cascading",
    "end1cascadinglast",
    "end2key",
    "end2kind",
    "end2role",
    "end2cascading",
    "end2cascadinglast",
];

pub fn is_reserved_attr(attr: &str) -> bool {
    RESERVED_ATTRS.contains(&attr)
}

/// Validate a kind, role or partition name.
///
/// Allowed characters: [a-zA-Z0-9_-], at least one character.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GraphError::InvalidData(format!("{} must not be empty", what)));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if !valid {
        return Err(GraphError::InvalidData(format!(
            "{} {:?} can only contain a-z, A-Z, 0-9, _, -",
            what, name
        )));
    }

    Ok(())
}

/// Validate a free-form attribute name stored alongside the reserved ones.
pub fn validate_attr(attr: &str) -> Result<()> {
    if attr.is_empty() || attr.starts_with('\u{0}') {
        return Err(GraphError::InvalidAttr(attr.to_string()));
    }
    Ok(())
}

/// Deterministic 128-bit id of a node or edge within a partition.
///
/// BLAKE3 over `class \0 partition \0 kind \0 key`, first 16 bytes.
pub fn entity_id(class: &str, partition: &str, kind: &str, key: &str) -> u128 {
    let mut hasher = blake3::Hasher::new();
    for part in [class, partition, kind, key] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    let hash = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    u128::from_le_bytes(bytes)
}
