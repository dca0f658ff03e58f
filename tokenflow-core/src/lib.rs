//! # tokenflow-core
//!
//! Process virtual machine for tokenflow.
//!
//! This crate provides:
//! - Process definition parsing and validation
//! - The execution tree and hierarchical variable scopes
//! - Activity behaviors, delegates and execution listeners
//! - Atomic operations and the interpreter that drives them
//! - Job and history records shared with storage and the engine

pub mod behavior;
pub mod clock;
pub mod condition;
pub mod definition;
pub mod error;
pub mod execution;
pub mod history;
pub mod interpreter;
pub mod job;
pub mod operation;
mod variables;

pub use behavior::{
    take_outgoing, ActivityBehavior, BehaviorOutcome, BehaviorRegistry, Delegate,
    DelegateExecution, ExecutionListener,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::Condition;
pub use definition::{
    Activity, ActivityKind, ActivityType, LoopCardinality, MultiInstance, ProcessDefinition,
    ProcessDefinitionRaw, SequenceFlow,
};
pub use error::{CoreError, DelegateError};
pub use execution::{Execution, ExecutionTree};
pub use history::{HistoricProcessInstance, ProcessInstanceState};
pub use interpreter::{Continuation, Interpreter, RuntimeSettings, UnhandledErrorPolicy};
pub use job::{Incident, Job, JobKind, JobRequest, DEFAULT_RETRIES};
pub use operation::AtomicOperation;
