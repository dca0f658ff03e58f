//! Log record framing and typed entries.
//!
//! On-disk layout of one record (big endian):
//!
//! ```text
//! +---------+--------+---------+----------+-----------+-----------+
//! | magic 4 | type 1 | flags 1 | unused 2 | length 4  | crc32c 4  |
//! +---------+--------+---------+----------+-----------+-----------+
//! | sequence 8                 | payload (length bytes, JSON)     |
//! +----------------------------+----------------------------------+
//! ```

use crate::error::WalError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Record magic: "TFLW".
pub const WAL_MAGIC: [u8; 4] = *b"TFLW";

/// Largest accepted payload (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Discriminator stored in the record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// A process definition was deployed.
    PutDefinition = 1,
    /// A command committed a change set.
    Commit = 2,
    /// Checkpoint marker.
    Checkpoint = 3,
    /// Padding.
    Noop = 255,
}

impl TryFrom<u8> for WalEntryType {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WalEntryType::PutDefinition),
            2 => Ok(WalEntryType::Commit),
            3 => Ok(WalEntryType::Checkpoint),
            255 => Ok(WalEntryType::Noop),
            other => Err(WalError::InvalidHeader {
                offset: 0,
                reason: format!("unknown entry type: {}", other),
            }),
        }
    }
}

/// Decoded record header.
#[derive(Debug, Clone)]
pub struct WalRecordHeader {
    pub entry_type: WalEntryType,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub sequence: u64,
}

/// Header plus raw payload.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: Bytes,
}

impl WalRecord {
    pub fn new(entry_type: WalEntryType, sequence: u64, payload: Bytes) -> Self {
        Self {
            header: WalRecordHeader {
                entry_type,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc32c::crc32c(&payload),
                sequence,
            },
            payload,
        }
    }

    /// Serializes header and payload into a single buffer.
    pub fn encode(&self) -> Result<BytesMut, WalError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&WAL_MAGIC);
        buf.put_u8(self.header.entry_type as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u64(self.header.sequence);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds an incomplete record or
    /// zero padding; the buffer is left untouched in that case.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, WalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != WAL_MAGIC {
            if magic == [0; 4] {
                return Ok(None);
            }
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let entry_type = WalEntryType::try_from(buf[4]).map_err(|_| WalError::InvalidHeader {
            offset,
            reason: format!("unknown entry type: {}", buf[4]),
        })?;
        let flags = buf[5];

        let mut header = &buf[8..RECORD_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;
        let crc_expected = header.get_u32();
        let sequence = header.get_u64();

        if payload_len > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(WalError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            header: WalRecordHeader {
                entry_type,
                flags,
                payload_len: payload_len as u32,
                crc32c: crc_expected,
                sequence,
            },
            payload,
        }))
    }

    /// Size of the record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}

/// Typed log entry.
///
/// Change payloads are opaque JSON here; the store owns their schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalEntry {
    PutDefinition {
        key: String,
        version: u32,
        checksum: String,
        /// Full definition document, replayed on recovery.
        definition: serde_json::Value,
    },
    Commit {
        /// Name of the command that produced the change set.
        command: String,
        /// Serialized changes, applied in order.
        changes: Vec<serde_json::Value>,
        /// Commit time in Unix milliseconds.
        timestamp: i64,
    },
    Checkpoint {
        timestamp: i64,
    },
}

impl WalEntry {
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalEntry::PutDefinition { .. } => WalEntryType::PutDefinition,
            WalEntry::Commit { .. } => WalEntryType::Commit,
            WalEntry::Checkpoint { .. } => WalEntryType::Checkpoint,
        }
    }

    /// Number of changes carried by a commit entry.
    pub fn change_count(&self) -> usize {
        match self {
            WalEntry::Commit { changes, .. } => changes.len(),
            _ => 0,
        }
    }
}
