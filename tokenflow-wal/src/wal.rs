//! The write-ahead log.

use crate::entry::{WalEntry, WalRecord};
use crate::error::WalError;
use crate::segment::{list_segments, segment_filename, Segment, SegmentId, SEGMENT_HEADER_SIZE};
use crate::DEFAULT_SEGMENT_SIZE;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// When appended records are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every append.
    #[default]
    EveryWrite,
    /// Fsync once N appends are pending.
    EveryN(u32),
    /// Fsync when the last sync is older than N milliseconds (group commit).
    EveryMs(u32),
    /// Only sync on explicit `sync()` or `close()`.
    Never,
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Segment directory.
    pub dir: PathBuf,
    /// Rotation threshold.
    pub segment_size: u64,
    pub fsync_policy: FsyncPolicy,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}

/// Position of a record: segment id in the high 24 bits, byte offset in the
/// low 40 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalOffset(u64);

impl WalOffset {
    const OFFSET_BITS: u64 = 40;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    pub fn new(segment_id: SegmentId, offset: u64) -> Result<Self, WalError> {
        if offset > Self::OFFSET_MASK {
            return Err(WalError::OffsetOverflow(offset));
        }
        Ok(Self((segment_id << Self::OFFSET_BITS) | offset))
    }

    /// The very beginning of the log.
    pub fn start() -> Self {
        Self(0)
    }

    pub fn segment_id(&self) -> SegmentId {
        self.0 >> Self::OFFSET_BITS
    }

    pub fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Inverse of [`WalOffset::as_u64`], for offsets persisted elsewhere.
    pub fn from_u64(packed: u64) -> Self {
        Self(packed)
    }
}

/// I/O counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    pub appends: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
    pub segments: usize,
}

struct WriterState {
    segment: Segment,
    pending_writes: u64,
    last_sync: Instant,
}

/// Append-only, segmented log.
///
/// Appends are serialized by the writer mutex; readers re-open segment files
/// and never block the writer for longer than a directory listing.
pub struct Wal {
    config: WalConfig,
    writer: Mutex<WriterState>,
    next_sequence: AtomicU64,
    closed: AtomicBool,
    appends: AtomicU64,
    bytes_written: AtomicU64,
    fsyncs: AtomicU64,
}

impl Wal {
    /// Opens the log, creating the directory and first segment if needed.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        std::fs::create_dir_all(&config.dir)?;

        let mut ids = list_segments(&config.dir)?;
        // A crash while creating a segment can leave a file shorter than its
        // header; it never held a record.
        if let Some(&latest) = ids.last() {
            if Segment::header_is_torn(&config.dir, latest)? {
                tracing::warn!(segment = latest, "removing segment with torn header");
                std::fs::remove_file(config.dir.join(segment_filename(latest)))?;
                ids.pop();
            }
        }

        let segment = match ids.last() {
            Some(&latest) => {
                let mut segment = Segment::open(&config.dir, latest, config.segment_size)?;
                let valid_end = segment
                    .records()?
                    .last()
                    .map(|(offset, record)| offset + record.disk_size() as u64)
                    .unwrap_or(SEGMENT_HEADER_SIZE);
                if valid_end < segment.size() {
                    tracing::warn!(
                        segment = latest,
                        dropped = segment.size() - valid_end,
                        "truncating torn WAL tail"
                    );
                    segment.truncate_at(valid_end)?;
                }
                segment
            }
            None => Segment::create(&config.dir, 1, 1, config.segment_size)?,
        };
        let next_sequence = segment.next_sequence()?;

        tracing::info!(
            dir = %config.dir.display(),
            first_segment = ids.first().copied().unwrap_or(1),
            segments = ids.len().max(1),
            next_sequence,
            "WAL opened"
        );

        Ok(Self {
            config,
            writer: Mutex::new(WriterState {
                segment,
                pending_writes: 0,
                last_sync: Instant::now(),
            }),
            next_sequence: AtomicU64::new(next_sequence),
            closed: AtomicBool::new(false),
            appends: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            fsyncs: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Appends an entry and applies the fsync policy.
    ///
    /// Returns the assigned sequence number and the record's position.
    pub fn append(&self, entry: &WalEntry) -> Result<(u64, WalOffset), WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }

        let payload = Bytes::from(serde_json::to_vec(entry)?);
        let mut writer = self.writer.lock();

        // Sequence is taken under the writer lock so file order matches it.
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = WalRecord::new(entry.entry_type(), sequence, payload);

        if !writer.segment.can_fit(record.disk_size()) {
            self.rotate_locked(&mut writer, sequence)?;
        }

        let segment_id = writer.segment.id();
        let offset = writer.segment.append(&record)?;
        writer.pending_writes += 1;
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(record.disk_size() as u64, Ordering::Relaxed);

        let due = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => writer.pending_writes >= u64::from(n.max(1)),
            FsyncPolicy::EveryMs(ms) => {
                writer.last_sync.elapsed() >= Duration::from_millis(u64::from(ms))
            }
            FsyncPolicy::Never => false,
        };
        if due {
            self.sync_locked(&mut writer)?;
        }

        Ok((sequence, WalOffset::new(segment_id, offset)?))
    }

    fn sync_locked(&self, writer: &mut WriterState) -> Result<(), WalError> {
        if writer.segment.sync()? {
            self.fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        writer.pending_writes = 0;
        writer.last_sync = Instant::now();
        Ok(())
    }

    fn rotate_locked(&self, writer: &mut WriterState, base_sequence: u64) -> Result<(), WalError> {
        self.sync_locked(writer)?;
        let next_id = writer.segment.id() + 1;
        writer.segment =
            Segment::create(&self.config.dir, next_id, base_sequence, self.config.segment_size)?;
        tracing::debug!(segment = next_id, base_sequence, "WAL rotated");
        Ok(())
    }

    /// Forces pending writes to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut writer = self.writer.lock();
        self.sync_locked(&mut writer)
    }

    /// Starts a new segment unless the current one is still empty.
    ///
    /// Returns the position where the next record lands. Every record written
    /// before the call sits in an older segment afterwards.
    pub fn rotate(&self) -> Result<WalOffset, WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        let mut writer = self.writer.lock();
        if !writer.segment.is_empty() {
            let base = self.next_sequence.load(Ordering::SeqCst);
            self.rotate_locked(&mut writer, base)?;
        }
        WalOffset::new(writer.segment.id(), writer.segment.size())
    }

    /// Deletes every segment that ends before `before`.
    ///
    /// The segment being written is never deleted. Returns how many segments
    /// were removed.
    pub fn compact_before(&self, before: WalOffset) -> Result<usize, WalError> {
        let writer = self.writer.lock();
        let limit = before.segment_id().min(writer.segment.id());
        let mut deleted = 0;
        for id in list_segments(&self.config.dir)? {
            if id >= limit {
                break;
            }
            std::fs::remove_file(self.config.dir.join(segment_filename(id)))?;
            tracing::info!(segment = id, "compacted WAL segment");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Segment ids on disk, ascending.
    pub fn segment_ids(&self) -> Result<Vec<SegmentId>, WalError> {
        let _writer = self.writer.lock();
        list_segments(&self.config.dir)
    }

    /// Bytes held by all segments.
    pub fn total_size(&self) -> Result<u64, WalError> {
        let _writer = self.writer.lock();
        let mut total = 0;
        for id in list_segments(&self.config.dir)? {
            total += std::fs::metadata(self.config.dir.join(segment_filename(id)))?.len();
        }
        Ok(total)
    }

    /// Reads entries at or after `from`, in log order.
    ///
    /// `from` must not point into a compacted segment; [`WalOffset::start`]
    /// reads whatever the log still holds.
    pub fn read_from(
        &self,
        from: WalOffset,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, WalOffset, WalEntry)>, WalError> {
        // Hold the writer so no half-written record is observed.
        let _writer = self.writer.lock();
        let limit = limit.unwrap_or(usize::MAX);
        let ids = list_segments(&self.config.dir)?;
        if let Some(&earliest) = ids.first() {
            if from.segment_id() != 0 && from.segment_id() < earliest {
                return Err(WalError::Compacted {
                    requested: from.segment_id(),
                    earliest,
                });
            }
        }

        let mut results = Vec::new();
        for id in ids.into_iter().filter(|&id| id >= from.segment_id()) {
            let segment = Segment::open(&self.config.dir, id, self.config.segment_size)?;
            for (offset, record) in segment.records()? {
                let position = WalOffset::new(id, offset)?;
                if position < from {
                    continue;
                }
                if results.len() >= limit {
                    return Ok(results);
                }
                let entry: WalEntry = serde_json::from_slice(&record.payload)?;
                results.push((record.header.sequence, position, entry));
            }
        }

        Ok(results)
    }

    /// Reads the whole log.
    pub fn read_all(&self) -> Result<Vec<(u64, WalOffset, WalEntry)>, WalError> {
        self.read_from(WalOffset::start(), None)
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Syncs and refuses further appends.
    pub fn close(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            appends: self.appends.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            segments: list_segments(&self.config.dir).map(|s| s.len()).unwrap_or(0),
        }
    }
}
