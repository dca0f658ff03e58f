//! # tokenflow-engine
//!
//! Process engine for tokenflow.
//!
//! This crate provides:
//! - Commands run through an interceptor chain with optimistic-lock retries
//! - A command context that loads instances and flushes one change set per command
//! - Job retries with pluggable backoff and incidents on exhaustion
//! - A background job executor with lock-based acquisition
//! - Automatic checkpoints that snapshot the store and compact the WAL
//! - File and environment configuration

pub mod backoff;
pub mod checkpoint;
pub mod command;
pub mod commands;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod job_executor;

pub use backoff::{BackoffPolicy, RetryBackoff};
pub use checkpoint::{CheckpointManager, CheckpointStats};
pub use command::{Command, CommandExecutor, CommandInterceptor, LogInterceptor, RetryInterceptor};
pub use config::{
    CheckpointConfig, Config, ConfigError, EngineConfig, FsyncPolicy, JobExecutorConfig,
    StorageConfig,
};
pub use context::{CommandContext, EngineServices, MAX_NESTING_DEPTH};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::EngineError;
pub use job_executor::{JobExecutor, JobExecutorStats};
