//! Write-ahead log.
//!
//! Every committed atomic operation appends one record listing the byte-range
//! changes it made to each page. Records are replayed on open to bring pages
//! that were not flushed before a crash up to date, after which the log is
//! checkpointed (truncated back to its header).
//!
//! # File Format
//!
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-7      | magic number                                     |
//! | 8-15     | LSN segment of the current session               |
//! | 16-      | records                                          |
//! +----------+--------------------------------------------------+
//! ```
//!
//! # Record Format
//!
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | record_length (4 bytes, includes header+payload) |
//! | 4        | record_type (1 byte)                             |
//! | 5-12     | operation_id (8 bytes)                           |
//! | 13-20    | LSN segment (8 bytes)                            |
//! | 21-28    | LSN position (8 bytes)                           |
//! | 29-N     | payload: page count (4 bytes), then per page     |
//! |          |   name length (2), name, page index (8), changes |
//! | N-N+3    | CRC32 checksum (4 bytes)                         |
//! +----------+--------------------------------------------------+
//! ```
//!
//! A record whose length runs past the end of the file, or whose checksum does
//! not match, marks a torn tail: reading stops there and the tail is dropped.

// Record lengths, name lengths and page counts fit their u32/u16 fields
#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::storage::page::{Lsn, PageIndex};
use crate::storage::wal_changes::WalChanges;

/// Magic number at the start of every log file.
pub const WAL_MAGIC: u64 = 0x5342_5452_4545_574C;

/// Size of the file header.
pub const WAL_HEADER_SIZE: usize = 16;

/// Record header size (before payload).
/// `record_length` (4) + `record_type` (1) + `operation_id` (8) + lsn (16) = 29 bytes
const RECORD_HEADER_SIZE: usize = 29;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// Type byte of an atomic operation record.
const ATOMIC_OPERATION_RECORD: u8 = 0x01;

/// The changes one atomic operation made to one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChanges {
    /// Name of the page file.
    pub file: String,
    /// Page within the file.
    pub page_index: PageIndex,
    /// Byte-range patches.
    pub changes: WalChanges,
}

/// One committed atomic operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// LSN stamped into every page the operation touched.
    pub lsn: Lsn,
    /// Id of the atomic operation.
    pub operation_id: u64,
    /// Per-page changes, in the order the pages were first touched.
    pub pages: Vec<PageChanges>,
}

impl WalRecord {
    /// Serialize the record, checksum included.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_size: usize = 4 + self
            .pages
            .iter()
            .map(|page| 2 + page.file.len() + 8 + page.changes.serialized_size())
            .sum::<usize>();
        let total = RECORD_HEADER_SIZE + payload_size + CHECKSUM_SIZE;

        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&(total as u32).to_le_bytes());
        bytes.push(ATOMIC_OPERATION_RECORD);
        bytes.extend_from_slice(&self.operation_id.to_le_bytes());
        bytes.extend_from_slice(&self.lsn.segment.to_le_bytes());
        bytes.extend_from_slice(&self.lsn.position.to_le_bytes());

        bytes.extend_from_slice(&(self.pages.len() as u32).to_le_bytes());
        for page in &self.pages {
            bytes.extend_from_slice(&(page.file.len() as u16).to_le_bytes());
            bytes.extend_from_slice(page.file.as_bytes());
            bytes.extend_from_slice(&page.page_index.to_le_bytes());
            bytes.extend_from_slice(&page.changes.to_bytes());
        }

        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Deserialize one record from the start of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupied.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalError> {
        let corrupt = |reason: &str| WalError::CorruptRecord(reason.to_string());

        let total = read_u32(bytes, 0).ok_or_else(|| corrupt("truncated record length"))?;
        if total < RECORD_HEADER_SIZE + 4 + CHECKSUM_SIZE {
            return Err(corrupt("record length too small"));
        }
        let record = bytes.get(..total).ok_or_else(|| corrupt("truncated record"))?;

        let body_end = total - CHECKSUM_SIZE;
        let expected = u32::from_le_bytes(read_array(record, body_end).ok_or_else(|| corrupt("missing checksum"))?);
        let actual = crc32fast::hash(&record[..body_end]);
        if expected != actual {
            return Err(WalError::ChecksumMismatch { expected, actual });
        }

        if record[4] != ATOMIC_OPERATION_RECORD {
            return Err(WalError::CorruptRecord(format!(
                "unknown record type {}",
                record[4]
            )));
        }
        let read_u64 = |at: usize| {
            read_array(record, at)
                .map(u64::from_le_bytes)
                .ok_or_else(|| corrupt("truncated header"))
        };
        let operation_id = read_u64(5)?;
        let lsn = Lsn::new(read_u64(13)?, read_u64(21)?);

        let body = &record[..body_end];
        let count = read_u32(body, RECORD_HEADER_SIZE).ok_or_else(|| corrupt("missing page count"))?;
        let mut position = RECORD_HEADER_SIZE + 4;
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let name_len = read_array(body, position)
                .map(u16::from_le_bytes)
                .ok_or_else(|| corrupt("truncated file name length"))?;
            position += 2;
            let name = body
                .get(position..position + usize::from(name_len))
                .ok_or_else(|| corrupt("truncated file name"))?;
            let file = String::from_utf8(name.to_vec()).map_err(|_| corrupt("file name is not UTF-8"))?;
            position += usize::from(name_len);
            let page_index = read_array(body, position)
                .map(u64::from_le_bytes)
                .ok_or_else(|| corrupt("truncated page index"))?;
            position += 8;
            let (changes, used) = WalChanges::from_bytes(&body[position..])
                .ok_or_else(|| corrupt("truncated page changes"))?;
            position += used;
            pages.push(PageChanges {
                file,
                page_index,
                changes,
            });
        }

        Ok((
            Self {
                lsn,
                operation_id,
                pages,
            },
            total,
        ))
    }
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Option<[u8; N]> {
    bytes.get(offset..offset + N)?.try_into().ok()
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<usize> {
    read_array(bytes, offset)
        .map(u32::from_le_bytes)
        .and_then(|v| usize::try_from(v).ok())
}

enum Backend {
    Memory(Vec<u8>),
    File(File),
}

/// The write-ahead log of one storage instance.
///
/// Not synchronized; the atomic operations manager owns it behind its commit
/// lock.
pub struct WriteAheadLog {
    backend: Backend,
    segment: u64,
    position: u64,
    sync_on_commit: bool,
}

impl WriteAheadLog {
    /// A log that lives only in memory. Nothing survives a restart.
    #[must_use]
    pub fn in_memory() -> Self {
        let mut buffer = Vec::with_capacity(WAL_HEADER_SIZE);
        buffer.extend_from_slice(&encode_header(1));
        Self {
            backend: Backend::Memory(buffer),
            segment: 1,
            position: 0,
            sync_on_commit: false,
        }
    }

    /// Open (or create) a log file.
    ///
    /// Returns the log together with every intact record it contained. The
    /// session starts a new LSN segment, greater than any segment in the file,
    /// and the header is rewritten immediately so that the segment is never
    /// reused.
    pub fn open(path: &Path, sync_on_commit: bool) -> Result<(Self, Vec<WalRecord>), WalError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let (previous_segment, records, valid_len) = if contents.is_empty() {
            (0, Vec::new(), WAL_HEADER_SIZE)
        } else {
            let magic = read_array(&contents, 0)
                .map(u64::from_le_bytes)
                .ok_or_else(|| WalError::CorruptRecord("truncated log header".to_string()))?;
            if magic != WAL_MAGIC {
                return Err(WalError::CorruptRecord(format!(
                    "bad log magic number {magic:#x}"
                )));
            }
            let segment = read_array(&contents, 8)
                .map(u64::from_le_bytes)
                .ok_or_else(|| WalError::CorruptRecord("truncated log header".to_string()))?;
            let (records, valid_len) = read_records(&contents[WAL_HEADER_SIZE..]);
            (segment, records, WAL_HEADER_SIZE + valid_len)
        };

        let max_segment = records
            .iter()
            .map(|r| r.lsn.segment)
            .fold(previous_segment, u64::max);
        let segment = max_segment + 1;

        file.set_len(valid_len as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(segment))?;
        file.sync_all()?;

        tracing::debug!(
            path = %path.display(),
            segment,
            records = records.len(),
            "opened write-ahead log"
        );

        Ok((
            Self {
                backend: Backend::File(file),
                segment,
                position: 0,
                sync_on_commit,
            },
            records,
        ))
    }

    /// LSN segment of this session.
    #[must_use]
    pub const fn segment(&self) -> u64 {
        self.segment
    }

    /// Allocate the next LSN.
    pub const fn next_lsn(&mut self) -> Lsn {
        self.position += 1;
        Lsn::new(self.segment, self.position)
    }

    /// Append a record, syncing if configured to.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let bytes = record.to_bytes();
        match &mut self.backend {
            Backend::Memory(buffer) => buffer.extend_from_slice(&bytes),
            Backend::File(file) => {
                file.seek(SeekFrom::End(0))?;
                file.write_all(&bytes)?;
                if self.sync_on_commit {
                    file.sync_data()?;
                }
            }
        }
        Ok(())
    }

    /// Make every appended record durable.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if let Backend::File(file) = &mut self.backend {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Read back every record currently in the log.
    pub fn records(&mut self) -> Result<Vec<WalRecord>, WalError> {
        let contents = match &mut self.backend {
            Backend::Memory(buffer) => buffer.clone(),
            Backend::File(file) => {
                let mut contents = Vec::new();
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut contents)?;
                contents
            }
        };
        let tail = contents.get(WAL_HEADER_SIZE..).unwrap_or_default();
        Ok(read_records(tail).0)
    }

    /// Drop every record. Called once all pages they describe are flushed.
    pub fn checkpoint(&mut self) -> Result<(), WalError> {
        match &mut self.backend {
            Backend::Memory(buffer) => buffer.truncate(WAL_HEADER_SIZE),
            Backend::File(file) => {
                file.set_len(WAL_HEADER_SIZE as u64)?;
                file.sync_all()?;
            }
        }
        Ok(())
    }
}

fn encode_header(segment: u64) -> [u8; WAL_HEADER_SIZE] {
    let mut header = [0u8; WAL_HEADER_SIZE];
    header[..8].copy_from_slice(&WAL_MAGIC.to_le_bytes());
    header[8..].copy_from_slice(&segment.to_le_bytes());
    header
}

/// Decode records until the end or the first damaged record.
///
/// Returns the records and the length of the intact prefix.
fn read_records(mut bytes: &[u8]) -> (Vec<WalRecord>, usize) {
    let mut records = Vec::new();
    let mut consumed = 0;
    while !bytes.is_empty() {
        match WalRecord::from_bytes(bytes) {
            Ok((record, len)) => {
                records.push(record);
                consumed += len;
                bytes = &bytes[len..];
            }
            Err(e) => {
                tracing::warn!(
                    offset = consumed,
                    error = %e,
                    "dropping torn write-ahead log tail"
                );
                break;
            }
        }
    }
    (records, consumed)
}

/// Errors that can occur in the write-ahead log.
#[derive(Debug)]
pub enum WalError {
    /// I/O error.
    Io(std::io::Error),
    /// A record could not be decoded.
    CorruptRecord(String),
    /// A record's checksum does not match its contents.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::CorruptRecord(reason) => write!(f, "corrupt log record: {reason}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "log record checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
