//! WAL error types.

use crate::segment::SegmentId;
use thiserror::Error;

/// Errors raised while writing, reading or compacting the commit log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record's payload does not match its checksum.
    #[error("record at offset {offset} fails its checksum ({expected:#010x} stored, {actual:#010x} computed)")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("unreadable record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    /// The segment file does not start with a valid segment header.
    #[error("segment {segment}: {reason}")]
    BadSegment { segment: SegmentId, reason: String },

    #[error("record of {size} bytes exceeds the {max} byte limit")]
    RecordTooLarge { size: usize, max: usize },

    #[error("segment offset {0} does not fit in 40 bits")]
    OffsetOverflow(u64),

    /// The requested position lies in a segment removed by compaction.
    #[error("segment {requested} was compacted; the log starts at segment {earliest}")]
    Compacted {
        requested: SegmentId,
        earliest: SegmentId,
    },

    #[error("WAL is closed")]
    Closed,

    #[error("entry encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WalError {
    /// Whether a failed append may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_))
    }

    /// Whether the error means bytes on disk are damaged rather than missing.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            WalError::CorruptedRecord { .. }
                | WalError::InvalidHeader { .. }
                | WalError::BadSegment { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let io = WalError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let crc = WalError::CorruptedRecord {
            offset: 16,
            expected: 1,
            actual: 2,
        };
        assert!(crc.is_corruption());
        assert!(!crc.is_retryable());

        let gone = WalError::Compacted {
            requested: 2,
            earliest: 5,
        };
        assert_eq!(
            gone.to_string(),
            "segment 2 was compacted; the log starts at segment 5"
        );
        assert!(!gone.is_corruption());
    }
}
