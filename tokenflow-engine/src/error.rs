//! Engine error types.

use thiserror::Error;

/// Errors returned by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] tokenflow_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] tokenflow_storage::StorageError),

    #[error("WAL error: {0}")]
    Wal(#[from] tokenflow_wal::WalError),

    #[error("process instance not found: {0}")]
    ProcessInstanceNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("process instance {0} is suspended")]
    Suspended(String),

    #[error("execution {0} is not waiting in an activity")]
    NotWaiting(String),

    #[error("job {job_id} is locked by {owner}")]
    JobLocked { job_id: String, owner: String },

    #[error("command nesting exceeds depth {0}")]
    NestingTooDeep(usize),

    #[error("command {0} was not executed")]
    NotExecuted(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Whether a concurrent writer won the race for the same rows.
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, EngineError::Storage(e) if e.is_optimistic_lock())
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Io(_) => true,
            EngineError::Storage(e) => e.is_retryable(),
            EngineError::Wal(e) => e.is_retryable(),
            EngineError::JobLocked { .. } => true,
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Io(_) | EngineError::Wal(_) => "STORAGE_IO",
            EngineError::Json(_) => "BAD_REQUEST",
            EngineError::Core(e) => e.error_code(),
            EngineError::Storage(e) => e.error_code(),
            EngineError::ProcessInstanceNotFound(_) => "PROCESS_INSTANCE_NOT_FOUND",
            EngineError::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            EngineError::JobNotFound(_) => "JOB_NOT_FOUND",
            EngineError::Suspended(_) => "SUSPENDED",
            EngineError::NotWaiting(_) => "NOT_WAITING",
            EngineError::JobLocked { .. } => "JOB_LOCKED",
            EngineError::NestingTooDeep(_) | EngineError::NotExecuted(_) => "INTERNAL_ERROR",
            EngineError::InvalidArgument(_) => "BAD_REQUEST",
            EngineError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}
