//! # tokenflow-wal
//!
//! Write-ahead log underneath the tokenflow engine store.
//!
//! Every committed command is appended here before it becomes visible:
//! - Records framed with a magic, length and crc32c checksum
//! - Segment files whose header records the first sequence number
//! - Rotation and compaction of segments covered by a store snapshot
//! - Configurable fsync policies (every write, every N, group commit, never)
//! - Truncation of torn writes on recovery

pub mod entry;
pub mod error;
pub mod recovery;
pub mod segment;
pub mod wal;

pub use entry::{WalEntry, WalEntryType, WalRecord};
pub use error::WalError;
pub use recovery::{repair_wal, verify_wal, RecoveryResult};
pub use segment::{Segment, SegmentId, SEGMENT_HEADER_SIZE};
pub use wal::{FsyncPolicy, Wal, WalConfig, WalOffset, WalStats};

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;
