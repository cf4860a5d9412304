//! Runtime configuration for the graph manager and the cluster layer.
//!
//! Both configs are plain serde structs with defaults. They can be read
//! from / written to a JSON file next to a store, e.g. `graph_config.json`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for a `GraphManager`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum time to wait for the mutation locks. `None` blocks forever.
    pub lock_timeout_ms: Option<u64>,
    /// Maximum number of rule firings within one top-level operation
    /// (default: 100_000). Exceeding it is a fatal `RuleCycle`.
    pub max_rule_dispatches: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: None,
            max_rule_dispatches: 100_000,
        }
    }
}

impl GraphConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Read config from a JSON file. Returns None if file doesn't exist.
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    /// Write config to a JSON file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

/// Configuration for a `Cluster`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Entries moved per transfer step before the worker checks for
    /// cancellation (default: 64).
    pub transfer_batch: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { transfer_batch: 64 }
    }
}

impl ClusterConfig {
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
