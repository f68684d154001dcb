//! Durable pages.
//!
//! Every page starts with a fixed header shared by all page kinds:
//!
//! ```text
//! +--------+--------------------------------------------+
//! | 0-7    | magic number                               |
//! | 8-11   | CRC32 of the page, checksum field zeroed   |
//! | 12-19  | LSN segment                                |
//! | 20-27  | LSN position                               |
//! | 28-    | page kind specific data                    |
//! +--------+--------------------------------------------+
//! ```
//!
//! Page-level integers are little-endian. Keys and values stored inside a page
//! use their serializer's own (big-endian) encoding.

// Offsets and lengths are bounded by the page size, which fits in i32
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

/// Default page size in bytes (8KB).
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Marks a page that has been written by this engine at least once.
pub const MAGIC_NUMBER: u64 = 0xFACB_03FE;

/// Offset of the magic number.
pub const MAGIC_NUMBER_OFFSET: usize = 0;
/// Offset of the CRC32 checksum.
pub const CRC32_OFFSET: usize = 8;
/// Offset of the LSN segment.
pub const WAL_SEGMENT_OFFSET: usize = 12;
/// Offset of the LSN position.
pub const WAL_POSITION_OFFSET: usize = 20;
/// First byte available to page kinds.
pub const NEXT_FREE_POSITION: usize = 28;

/// Index of a page within its file (0-indexed).
pub type PageIndex = u64;

/// Log sequence number: the version stamp of a page.
///
/// The segment changes every time the storage is opened; the position grows
/// with every committed atomic operation within a segment. Ordering is
/// lexicographic, so LSNs are monotonic across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    pub segment: u64,
    pub position: u64,
}

impl Lsn {
    /// Create an LSN.
    #[must_use]
    pub const fn new(segment: u64, position: u64) -> Self {
        Self { segment, position }
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment, self.position)
    }
}

/// A raw page buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed page of `page_size` bytes.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Create a page from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.into(),
        }
    }

    /// Page size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read an i32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        i32::from_le_bytes(bytes)
    }

    /// Write an i32 (little-endian) at the given offset.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.read_i32(offset) as u32
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_i32(offset, value as i32);
    }

    /// Read an i64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        i64::from_le_bytes(bytes)
    }

    /// Write an i64 (little-endian) at the given offset.
    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        self.read_i64(offset) as u64
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_i64(offset, value as i64);
    }

    /// Move `len` bytes from `from` to `to` within the page; ranges may overlap.
    pub fn move_data(&mut self, from: usize, to: usize, len: usize) {
        self.data.copy_within(from..from + len, to);
    }

    /// The LSN of the last atomic operation that changed this page.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        Lsn::new(
            self.read_u64(WAL_SEGMENT_OFFSET),
            self.read_u64(WAL_POSITION_OFFSET),
        )
    }

    /// Stamp the page with an LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.write_u64(WAL_SEGMENT_OFFSET, lsn.segment);
        self.write_u64(WAL_POSITION_OFFSET, lsn.position);
    }

    /// Whether the page has ever been stamped by [`Page::seal`].
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.read_u64(MAGIC_NUMBER_OFFSET) == MAGIC_NUMBER
    }

    /// Compute CRC32 checksum of the page data (excluding the checksum field itself).
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CRC32_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.data[CRC32_OFFSET + 4..]);
        hasher.finalize()
    }

    /// Write the magic number and checksum before the page goes to disk.
    pub fn seal(&mut self) {
        self.write_u64(MAGIC_NUMBER_OFFSET, MAGIC_NUMBER);
        let checksum = self.compute_checksum();
        self.write_u32(CRC32_OFFSET, checksum);
    }

    /// Verify the checksum of a page read back from disk.
    ///
    /// Pages that were never sealed (all zeros) are accepted as is.
    pub fn verify(&self) -> Result<(), PageError> {
        if !self.is_sealed() {
            return Ok(());
        }
        let expected = self.read_u32(CRC32_OFFSET);
        let actual = self.compute_checksum();
        if expected == actual {
            Ok(())
        } else {
            Err(PageError::ChecksumMismatch { expected, actual })
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.data.len())
            .field("lsn", &self.lsn())
            .finish_non_exhaustive()
    }
}

/// Errors related to page operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PageError {}
