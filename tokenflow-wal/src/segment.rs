//! Segment files.
//!
//! Each segment starts with a fixed header naming the sequence number of its
//! first record, so the log can number new records correctly even after every
//! older segment was compacted away:
//!
//! ```text
//! +-------------+-----------+------------+--------------------+
//! | "TFSG" 4    | version 1 | unused 3   | base sequence 8    |
//! +-------------+-----------+------------+--------------------+
//! | records ...                                               |
//! +-----------------------------------------------------------+
//! ```
//!
//! Record offsets are byte positions within the file, header included.

use crate::entry::WalRecord;
use crate::error::WalError;
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment number, increasing from 1.
pub type SegmentId = u64;

/// Segment magic: "TFSG".
pub const SEGMENT_MAGIC: [u8; 4] = *b"TFSG";

pub const SEGMENT_VERSION: u8 = 1;

/// Bytes before the first record of a segment.
pub const SEGMENT_HEADER_SIZE: u64 = 16;

const SEGMENT_SUFFIX: &str = ".tflog";
const SEGMENT_DIGITS: usize = 20;

/// `00000000000000000007.tflog` for segment 7.
pub fn segment_filename(id: SegmentId) -> String {
    format!("{:0width$}{}", id, SEGMENT_SUFFIX, width = SEGMENT_DIGITS)
}

pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let digits = name.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != SEGMENT_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn encode_header(base_sequence: u64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_SIZE as usize);
    buf.put_slice(&SEGMENT_MAGIC);
    buf.put_u8(SEGMENT_VERSION);
    buf.put_slice(&[0; 3]);
    buf.put_u64(base_sequence);
    buf
}

fn decode_header(id: SegmentId, mut header: &[u8]) -> Result<u64, WalError> {
    let bad = |reason: String| WalError::BadSegment {
        segment: id,
        reason,
    };
    if header.len() < SEGMENT_HEADER_SIZE as usize {
        return Err(bad(format!("header is {} bytes", header.len())));
    }
    if header[..4] != SEGMENT_MAGIC {
        return Err(bad(format!("bad magic {:?}", &header[..4])));
    }
    if header[4] != SEGMENT_VERSION {
        return Err(bad(format!("unsupported version {}", header[4])));
    }
    header.advance(8);
    Ok(header.get_u64())
}

/// One segment file, open for append.
pub struct Segment {
    id: SegmentId,
    base_sequence: u64,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    unsynced: bool,
}

impl Segment {
    /// Creates segment `id` whose first record will carry `base_sequence`.
    ///
    /// The header is synced before returning. Fails if the file exists.
    pub fn create(
        dir: &Path,
        id: SegmentId,
        base_sequence: u64,
        max_size: u64,
    ) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&encode_header(base_sequence))?;
        file.sync_all()?;
        Ok(Self {
            id,
            base_sequence,
            path,
            file,
            size: SEGMENT_HEADER_SIZE,
            max_size,
            unsynced: false,
        })
    }

    /// Opens an existing segment and checks its header.
    pub fn open(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        let mut header = Vec::with_capacity(SEGMENT_HEADER_SIZE as usize);
        (&mut file)
            .take(SEGMENT_HEADER_SIZE)
            .read_to_end(&mut header)?;
        let base_sequence = decode_header(id, &header)?;
        Ok(Self {
            id,
            base_sequence,
            path,
            file,
            size,
            max_size,
            unsynced: false,
        })
    }

    /// Whether the file on disk is too short to hold a header, as left by a
    /// crash between creating and writing it.
    pub fn header_is_torn(dir: &Path, id: SegmentId) -> Result<bool, WalError> {
        let len = std::fs::metadata(dir.join(segment_filename(id)))?.len();
        Ok(len < SEGMENT_HEADER_SIZE)
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Sequence number of the first record written to this segment.
    pub fn base_sequence(&self) -> u64 {
        self.base_sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size including the header.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size <= SEGMENT_HEADER_SIZE
    }

    /// An empty segment takes any record so oversized entries still land.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.is_empty() || self.size + record_size as u64 <= self.max_size
    }

    /// Appends a record and returns its offset in the file.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64, WalError> {
        let encoded = record.encode()?;
        let offset = self.size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encoded)?;
        self.size += encoded.len() as u64;
        self.unsynced = true;
        Ok(offset)
    }

    /// Flushes appended records; returns whether there was anything to flush.
    pub fn sync(&mut self) -> Result<bool, WalError> {
        if !self.unsynced {
            return Ok(false);
        }
        self.file.sync_data()?;
        self.unsynced = false;
        Ok(true)
    }

    /// Every complete record after the header, with its file offset.
    ///
    /// Stops quietly at a torn tail; a damaged record in between is an error.
    pub fn records(&self) -> Result<Vec<(u64, WalRecord)>, WalError> {
        let mut buf = self.record_bytes()?;
        let mut records = Vec::new();
        let mut offset = SEGMENT_HEADER_SIZE;
        while let Some(record) = WalRecord::decode(&mut buf, offset)? {
            let size = record.disk_size() as u64;
            records.push((offset, record));
            offset += size;
        }
        Ok(records)
    }

    /// Raw bytes following the header.
    pub fn record_bytes(&self) -> Result<BytesMut, WalError> {
        let data = std::fs::read(&self.path)?;
        let start = (SEGMENT_HEADER_SIZE as usize).min(data.len());
        Ok(BytesMut::from(&data[start..]))
    }

    /// Sequence number the next record appended here would take.
    pub fn next_sequence(&self) -> Result<u64, WalError> {
        Ok(self
            .records()?
            .last()
            .map(|(_, record)| record.header.sequence + 1)
            .unwrap_or(self.base_sequence))
    }

    /// Cuts the file at `offset`, never below the header.
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), WalError> {
        let offset = offset.max(SEGMENT_HEADER_SIZE);
        self.file.set_len(offset)?;
        self.size = offset;
        self.unsynced = true;
        self.sync()?;
        Ok(())
    }

    /// Deletes the file.
    pub fn remove(self) -> Result<(), WalError> {
        let Segment { file, path, .. } = self;
        drop(file);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

/// Segment ids present in `dir`, ascending. Other files are ignored.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, WalError> {
    let mut ids: Vec<SegmentId> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| parse_segment_filename(&entry.file_name().to_string_lossy()))
        .collect();
    ids.sort_unstable();
    Ok(ids)
}
