//! Storage error types.

use crate::change::EntityKind;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAL error: {0}")]
    Wal(#[from] tokenflow_wal::WalError),

    #[error("core error: {0}")]
    Core(#[from] tokenflow_core::CoreError),

    /// Another transaction changed or removed the entity since it was read.
    #[error("optimistic lock conflict on {kind} {id}: expected revision {expected}, found {}", .actual.map(|r| r.to_string()).unwrap_or_else(|| "none".into()))]
    OptimisticLock {
        kind: EntityKind,
        id: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("{kind} {id} already exists")]
    DuplicateEntity { kind: EntityKind, id: String },

    #[error("process definition not found: {key}{}", .version.map(|v| format!(" v{}", v)).unwrap_or_default())]
    DefinitionNotFound { key: String, version: Option<u32> },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Persistent state that cannot be trusted.
    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("store is closed")]
    Closed,
}

impl StorageError {
    /// Whether re-running the transaction from a fresh read may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::OptimisticLock { .. } => true,
            StorageError::Wal(e) => e.is_retryable(),
            StorageError::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, StorageError::OptimisticLock { .. })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) | StorageError::Wal(_) => "STORAGE_IO",
            StorageError::Json(_)
            | StorageError::SnapshotNotFound(_)
            | StorageError::Corruption(_) => "STORAGE_CORRUPTION",
            StorageError::Core(e) => e.error_code(),
            StorageError::OptimisticLock { .. } => "OPTIMISTIC_LOCK",
            StorageError::DuplicateEntity { .. } => "DUPLICATE_ENTITY",
            StorageError::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
            StorageError::Closed => "SHUTTING_DOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_and_classification() {
        let err = StorageError::OptimisticLock {
            kind: EntityKind::Job,
            id: "j1".into(),
            expected: 2,
            actual: Some(3),
        };
        assert!(err.is_retryable());
        assert!(err.is_optimistic_lock());
        assert_eq!(
            err.to_string(),
            "optimistic lock conflict on job j1: expected revision 2, found 3"
        );

        let gone = StorageError::OptimisticLock {
            kind: EntityKind::Execution,
            id: "e1".into(),
            expected: 1,
            actual: None,
        };
        assert!(gone.to_string().ends_with("found none"));

        let missing = StorageError::DefinitionNotFound {
            key: "order".into(),
            version: Some(2),
        };
        assert_eq!(missing.to_string(), "process definition not found: order v2");
        assert!(!missing.is_retryable());
    }
}
