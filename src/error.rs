//! Error types for the graph manager, transactions and cluster storage

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Cannot open graph storage of version: {stored} - max supported version: {supported}")]
    VersionTooNew { stored: u64, supported: u64 },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid attribute name: {0:?}")]
    InvalidAttr(String),

    #[error("Rule '{rule}' failed: {message}")]
    Rule { rule: String, message: String },

    #[error("Rule dispatch exceeded {limit} firings in one operation")]
    RuleCycle { limit: usize },

    // Transaction lifecycle
    #[error("Transaction was already committed")]
    AlreadyCommitted,

    #[error("Transaction is closed")]
    TransactionClosed,

    #[error("Rolling threshold must be at least 1 (got {0})")]
    InvalidThreshold(i64),

    #[error("Timed out acquiring the {0} lock")]
    LockTimeout(&'static str),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Frame decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    // Cluster
    #[error("Cluster member '{0}' not found")]
    MemberNotFound(String),

    #[error("Transfer on member '{0}' was cancelled")]
    TransferCancelled(String),
}

impl GraphError {
    /// Get error code for protocol adapters
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::VersionTooNew { .. } => "VERSION_TOO_NEW",
            GraphError::InvalidData(_) => "INVALID_DATA",
            GraphError::InvalidAttr(_) => "INVALID_ATTR",
            GraphError::Rule { .. } => "RULE_ERROR",
            GraphError::RuleCycle { .. } => "RULE_CYCLE",
            GraphError::AlreadyCommitted => "ALREADY_COMMITTED",
            GraphError::TransactionClosed => "TRANSACTION_CLOSED",
            GraphError::InvalidThreshold(_) => "INVALID_THRESHOLD",
            GraphError::LockTimeout(_) => "LOCK_TIMEOUT",
            GraphError::MemberNotFound(_) => "MEMBER_NOT_FOUND",
            GraphError::TransferCancelled(_) => "TRANSFER_CANCELLED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Fatal errors halt the enclosing operation and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GraphError::VersionTooNew { .. } | GraphError::RuleCycle { .. })
    }

    /// Validation errors are returned before any storage is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GraphError::InvalidData(_) | GraphError::InvalidAttr(_) | GraphError::InvalidThreshold(_)
        )
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        GraphError::Storage(format!("{} lock poisoned", what))
    }
}
