//! Core error types.

use thiserror::Error;

/// Errors raised by the process virtual machine.
///
/// Everything here aborts the command that triggered it. Business errors
/// thrown by delegates travel as [`DelegateError::Bpmn`] and only surface as
/// [`CoreError::UnhandledBpmnError`] when no boundary event catches them.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid process definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid condition expression: {reason}")]
    InvalidCondition { reason: String },

    #[error("activity not found: {activity_id}")]
    ActivityNotFound { activity_id: String },

    #[error("sequence flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },

    #[error("execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },

    #[error("execution {execution_id} still has active children")]
    ExecutionHasActiveChildren { execution_id: String },

    #[error("execution {execution_id} is not positioned at an activity")]
    NoCurrentActivity { execution_id: String },

    #[error("inconsistent execution tree: {reason}")]
    InconsistentTree { reason: String },

    #[error("no behavior registered for activity type {activity_type}")]
    MissingBehavior { activity_type: String },

    #[error("unknown delegate: {name}")]
    UnknownDelegate { name: String },

    #[error("unknown execution listener: {name}")]
    UnknownListener { name: String },

    #[error("no outgoing sequence flow of activity {activity_id} can be taken")]
    NoOutgoingSequenceFlow { activity_id: String },

    #[error("activity {activity_id} does not accept signals")]
    SignalNotSupported { activity_id: String },

    #[error("delegate failed in activity {activity_id}: {message}")]
    DelegateFailed { activity_id: String, message: String },

    #[error("listener {listener} failed on '{event}': {message}")]
    ListenerFailed {
        listener: String,
        event: String,
        message: String,
    },

    #[error("unhandled BPMN error '{code}' thrown in activity {activity_id}: {message}")]
    UnhandledBpmnError {
        activity_id: String,
        code: String,
        message: String,
    },

    /// The instance count of a multi-instance activity cannot be resolved.
    #[error("multi-instance activity {activity_id}: {reason}")]
    InvalidMultiInstance { activity_id: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Core errors are deterministic; retrying the same command yields the
    /// same failure.
    pub fn is_retryable(&self) -> bool {
        false
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidCondition { .. } => "INVALID_DEFINITION",
            CoreError::ActivityNotFound { .. } => "ACTIVITY_NOT_FOUND",
            CoreError::FlowNotFound { .. } => "ACTIVITY_NOT_FOUND",
            CoreError::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            CoreError::ExecutionHasActiveChildren { .. } => "INCONSISTENT_STATE",
            CoreError::NoCurrentActivity { .. } => "INCONSISTENT_STATE",
            CoreError::InconsistentTree { .. } => "INCONSISTENT_STATE",
            CoreError::MissingBehavior { .. } => "CONFIGURATION",
            CoreError::UnknownDelegate { .. } => "CONFIGURATION",
            CoreError::UnknownListener { .. } => "CONFIGURATION",
            CoreError::NoOutgoingSequenceFlow { .. } => "NO_OUTGOING_FLOW",
            CoreError::SignalNotSupported { .. } => "NOT_WAITING",
            CoreError::DelegateFailed { .. } => "DELEGATE_FAILED",
            CoreError::ListenerFailed { .. } => "DELEGATE_FAILED",
            CoreError::UnhandledBpmnError { .. } => "UNHANDLED_BPMN_ERROR",
            CoreError::InvalidMultiInstance { .. } => "BAD_REQUEST",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}

/// Error returned by user code plugged into the engine (service task
/// delegates and execution listeners).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegateError {
    /// A business error that error boundary events may catch.
    #[error("BPMN error '{code}': {message}")]
    Bpmn { code: String, message: String },

    /// A technical failure. Aborts the command; jobs are retried.
    #[error("{0}")]
    Failed(String),
}

impl DelegateError {
    pub fn bpmn(code: impl Into<String>, message: impl Into<String>) -> Self {
        DelegateError::Bpmn {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        DelegateError::Failed(message.into())
    }
}
