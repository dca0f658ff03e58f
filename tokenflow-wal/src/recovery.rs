//! Offline integrity checks.
//!
//! `verify_wal` reports torn tails and corrupt records without touching the
//! files; `repair_wal` truncates every segment after its last valid record.

use crate::entry::WalRecord;
use crate::error::WalError;
use crate::segment::{list_segments, segment_filename, Segment, SegmentId, SEGMENT_HEADER_SIZE};
use std::path::{Path, PathBuf};

/// Outcome of a scan.
#[derive(Debug, Default)]
pub struct RecoveryResult {
    pub valid_records: u64,
    pub invalid_records: u64,
    /// Bytes after the last valid record of each segment.
    pub bytes_truncated: u64,
    /// Segments that had a torn tail or corrupt records.
    pub damaged_segments: Vec<SegmentId>,
    pub max_sequence: u64,
}

struct SegmentScan {
    valid: u64,
    invalid: u64,
    valid_end: u64,
    max_sequence: u64,
}

/// Walks every segment of a log directory.
pub struct RecoveryScanner {
    dir: PathBuf,
    segment_size: u64,
}

impl RecoveryScanner {
    pub fn new(dir: impl AsRef<Path>, segment_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            segment_size,
        }
    }

    pub fn scan(&self, repair: bool) -> Result<RecoveryResult, WalError> {
        let mut result = RecoveryResult::default();

        for id in list_segments(&self.dir)? {
            let mut segment = match Segment::open(&self.dir, id, self.segment_size) {
                Ok(segment) => segment,
                Err(e @ WalError::BadSegment { .. }) => {
                    tracing::warn!(segment = id, error = %e, "unreadable segment header");
                    result.damaged_segments.push(id);
                    // Only a header cut short by a crash is safe to drop.
                    if repair && Segment::header_is_torn(&self.dir, id)? {
                        std::fs::remove_file(self.dir.join(segment_filename(id)))?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let scan = scan_segment(&segment)?;
            let tail = segment.size() - scan.valid_end;

            result.valid_records += scan.valid;
            result.invalid_records += scan.invalid;
            result.bytes_truncated += tail;
            result.max_sequence = result.max_sequence.max(scan.max_sequence);

            if tail > 0 || scan.invalid > 0 {
                result.damaged_segments.push(id);
                if repair {
                    segment.truncate_at(scan.valid_end)?;
                    tracing::warn!(
                        segment = id,
                        offset = scan.valid_end,
                        removed = tail,
                        "segment truncated during repair"
                    );
                }
            }
        }

        Ok(result)
    }
}

/// Decodes records up to the first torn or damaged one.
fn scan_segment(segment: &Segment) -> Result<SegmentScan, WalError> {
    let mut buf = segment.record_bytes()?;
    let mut scan = SegmentScan {
        valid: 0,
        invalid: 0,
        valid_end: SEGMENT_HEADER_SIZE,
        max_sequence: 0,
    };

    loop {
        match WalRecord::decode(&mut buf, scan.valid_end) {
            Ok(Some(record)) => {
                scan.valid += 1;
                scan.valid_end += record.disk_size() as u64;
                scan.max_sequence = scan.max_sequence.max(record.header.sequence);
            }
            Ok(None) => break,
            Err(WalError::Io(e)) => return Err(WalError::Io(e)),
            Err(e) => {
                tracing::debug!(segment = segment.id(), error = %e, "damaged record");
                scan.invalid += 1;
                break;
            }
        }
    }

    Ok(scan)
}

pub fn verify_wal(dir: impl AsRef<Path>, segment_size: u64) -> Result<RecoveryResult, WalError> {
    RecoveryScanner::new(dir, segment_size).scan(false)
}

pub fn repair_wal(dir: impl AsRef<Path>, segment_size: u64) -> Result<RecoveryResult, WalError> {
    RecoveryScanner::new(dir, segment_size).scan(true)
}
