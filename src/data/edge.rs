//! Edge records.
//!
//! An edge is an undirected pair of directed ends. Each end names the node
//! it is attached to, the role that node plays, and two cascade flags.
//! From the point of view of the node attached at an end, the edge is
//! described by a spec string:
//!
//! ```text
//! <own role>:<edge kind>:<far role>:<far kind>
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::{validate_attr, validate_name, Value};
use crate::error::{GraphError, Result};

/// One side of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEnd {
    pub key: String,
    pub kind: String,
    pub role: String,
    /// Remove the far node when the node at this end is removed.
    pub cascading: bool,
    /// Remove the far node only once it has no other edge of this spec.
    pub cascading_last: bool,
}

impl EdgeEnd {
    pub fn new(key: impl Into<String>, kind: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            role: role.into(),
            cascading: false,
            cascading_last: false,
        }
    }

    pub fn cascading(mut self, cascading: bool) -> Self {
        self.cascading = cascading;
        self
    }

    /// Mark this end cascading-last (implies cascading).
    pub fn cascading_last(mut self, cascading_last: bool) -> Self {
        self.cascading_last = cascading_last;
        if cascading_last {
            self.cascading = true;
        }
        self
    }

    pub fn points_at(&self, key: &str, kind: &str) -> bool {
        self.key == key && self.kind == kind
    }

    fn validate(&self, which: &str) -> Result<()> {
        if self.key.is_empty() {
            return Err(GraphError::InvalidData(format!("Edge {} is missing a key", which)));
        }
        validate_name(&format!("Edge {} kind", which), &self.kind)?;
        validate_name(&format!("Edge {} role", which), &self.role)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndSide {
    End1,
    End2,
}

impl EndSide {
    pub fn other(self) -> EndSide {
        match self {
            EndSide::End1 => EndSide::End2,
            EndSide::End2 => EndSide::End1,
        }
    }
}

/// An edge identified by `(partition, kind, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub key: String,
    pub kind: String,
    pub end1: EdgeEnd,
    pub end2: EdgeEnd,
    pub attrs: BTreeMap<String, Value>,
}

impl Edge {
    pub fn new(key: impl Into<String>, kind: impl Into<String>, end1: EdgeEnd, end2: EdgeEnd) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            end1,
            end2,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(attr.into(), value.into());
        self
    }

    pub fn end(&self, side: EndSide) -> &EdgeEnd {
        match side {
            EndSide::End1 => &self.end1,
            EndSide::End2 => &self.end2,
        }
    }

    /// Spec of this edge as seen from the node at `side`.
    pub fn spec(&self, side: EndSide) -> String {
        let own = self.end(side);
        let far = self.end(side.other());
        format!("{}:{}:{}:{}", own.role, self.kind, far.role, far.kind)
    }

    /// Which end is attached to the given node. End1 wins for self-loops.
    pub fn side_of(&self, key: &str, kind: &str) -> Option<EndSide> {
        if self.end1.points_at(key, kind) {
            Some(EndSide::End1)
        } else if self.end2.points_at(key, kind) {
            Some(EndSide::End2)
        } else {
            None
        }
    }

    /// Copy of this edge with `side` moved to `end1`.
    pub fn oriented(&self, side: EndSide) -> Edge {
        let mut edge = self.clone();
        if side == EndSide::End2 {
            std::mem::swap(&mut edge.end1, &mut edge.end2);
        }
        edge
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(GraphError::InvalidData(format!(
                "Edge of kind {:?} is missing a key",
                self.kind
            )));
        }
        validate_name("Edge kind", &self.kind)?;
        self.end1.validate("end1")?;
        self.end2.validate("end2")?;
        for attr in self.attrs.keys() {
            validate_attr(attr)?;
        }
        Ok(())
    }
}

/// Spec pattern `role:kind:farrole:farkind`; empty parts match anything.
pub fn spec_matches(pattern: &str, spec: &str) -> bool {
    let pattern: Vec<&str> = pattern.split(':').collect();
    let spec: Vec<&str> = spec.split(':').collect();
    if pattern.len() != 4 || spec.len() != 4 {
        return false;
    }
    pattern
        .iter()
        .zip(spec.iter())
        .all(|(p, s)| p.is_empty() || p == s)
}
