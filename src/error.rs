use std::{path::PathBuf, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid vector: {0}")]
    InvalidVector(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("embedding timed out after {timeout:?}")]
    EmbeddingTimeout { timeout: Duration },

    #[error("index is full: {capacity} nodes")]
    CapacityExhausted { capacity: usize },

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("mapping inconsistency: {0}")]
    MappingInconsistency(String),

    #[error("snapshot was built with model '{stored}', active model is '{active}'")]
    ProviderChanged { stored: String, active: String },

    #[error("document '{document}' is already indexed for tenant '{tenant}'")]
    DuplicateDocument { tenant: String, document: String },

    #[error("invalid tenant id: {0}")]
    InvalidTenant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Embedding(_) | Error::EmbeddingTimeout { .. })
    }

    /// Whether the tenant index must be rebuilt before it can be used.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            Error::DimensionMismatch { .. } | Error::ProviderChanged { .. }
        )
    }

    /// Short user-facing description for a failed operation.
    ///
    /// A failed search caused by the embedding provider is reported as
    /// unavailable, never as an empty result.
    pub fn user_message(&self, operation: Operation) -> &'static str {
        match (operation, self.is_retryable()) {
            (Operation::AddDocument, _)
                if matches!(self, Error::CapacityExhausted { .. }) =>
            {
                "document not indexed, index is full"
            }
            (Operation::AddDocument, _) => "document not indexed, retry",
            (Operation::Search, true) => "search temporarily unavailable",
            (Operation::Search, false) => "search failed",
        }
    }
}

/// Service-level operation an error is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AddDocument,
    Search,
}
