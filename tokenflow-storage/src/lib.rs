//! # tokenflow-storage
//!
//! Storage layer for tokenflow.
//!
//! This crate provides:
//! - Deployed process definitions with versioning
//! - Tables for executions, jobs, incidents and process history
//! - Atomic change sets validated by optimistic locking
//! - Durability through the write-ahead log and replay on open
//! - Checkpoints that snapshot the tables and compact the log

pub mod change;
pub mod error;
pub mod index;
pub mod snapshot;
pub mod store;

pub use change::{Change, ChangeSet, Entity, EntityKind, Record};
pub use error::StorageError;
pub use index::DueIndex;
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use store::{
    CheckpointResult, DeployResult, EngineStore, StoreConfig, StoreStats, StoredDefinition,
};
