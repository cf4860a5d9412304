//! Node records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::{is_reserved_attr, validate_attr, validate_name, Value, NODE_KEY, NODE_KIND, NODE_NAME};
use crate::error::{GraphError, Result};

/// A node identified by `(partition, kind, key)`.
///
/// `attrs` never contains `key` or `kind`; `name` is an ordinary attribute
/// slot which is treated as reserved by the schema registries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    pub kind: String,
    pub attrs: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_attr(attr, value);
        self
    }

    /// Set an attribute. `key` and `kind` update the identity fields.
    pub fn set_attr(&mut self, attr: impl Into<String>, value: impl Into<Value>) {
        let attr = attr.into();
        let value = value.into();
        match attr.as_str() {
            NODE_KEY => self.key = value.to_string(),
            NODE_KIND => self.kind = value.to_string(),
            _ => {
                self.attrs.insert(attr, value);
            }
        }
    }

    /// Read an attribute, including the identity fields.
    pub fn attr(&self, attr: &str) -> Option<Value> {
        match attr {
            NODE_KEY => Some(Value::String(self.key.clone())),
            NODE_KIND => Some(Value::String(self.kind.clone())),
            _ => self.attrs.get(attr).cloned(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.attrs.get(NODE_NAME).and_then(Value::as_str)
    }

    /// Attribute names which take part in the per-kind attribute registry.
    pub fn registry_attrs(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .keys()
            .map(String::as_str)
            .filter(|a| !is_reserved_attr(a))
    }

    /// Check key, kind and attribute names.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(GraphError::InvalidData(format!(
                "Node of kind {:?} is missing a key",
                self.kind
            )));
        }
        validate_name("Node kind", &self.kind)?;
        for attr in self.attrs.keys() {
            validate_attr(attr)?;
        }
        Ok(())
    }

    /// Copy all attributes of `other` over this node.
    pub fn merge_from(&mut self, other: &Node) {
        for (attr, value) in &other.attrs {
            self.attrs.insert(attr.clone(), value.clone());
        }
    }
}
