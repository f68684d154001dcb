//! Page store abstraction.
//!
//! A [`PageStore`] is the durable home of a set of named page files. The page
//! cache reads pages from it on first access and writes dirty pages back on
//! flush. Two implementations exist:
//!
//! - [`DiskStore`](crate::storage::DiskStore): one OS file per page file, in a directory
//! - [`MemoryStore`](crate::storage::MemoryStore): in-memory, with fault injection for tests
//!
//! # Design
//!
//! Files are addressed by name. Runtime file ids are a page cache concern, and
//! the write-ahead log records names so that recovery can find files again
//! after a restart.

use crate::storage::page::{PageError, PageIndex};
use crate::storage::wal::WalError;

/// Runtime identifier of an open page file.
pub type FileId = u32;

/// Durable storage for named page files.
///
/// All methods take `&self`; implementations synchronize internally.
pub trait PageStore: Send + Sync {
    /// Whether a file with this name exists.
    fn exists(&self, name: &str) -> bool;

    /// Create an empty file. Fails if it already exists.
    fn create(&self, name: &str) -> Result<(), StorageError>;

    /// Delete a file and all of its pages.
    fn delete(&self, name: &str) -> Result<(), StorageError>;

    /// Drop every page of a file, leaving it empty.
    fn truncate(&self, name: &str) -> Result<(), StorageError>;

    /// Number of whole pages stored in a file.
    fn page_count(&self, name: &str) -> Result<u64, StorageError>;

    /// Read page `index` into `buffer`, which is exactly one page long.
    fn read_page(&self, name: &str, index: PageIndex, buffer: &mut [u8])
    -> Result<(), StorageError>;

    /// Write one page. Writing past the end extends the file.
    fn write_page(&self, name: &str, index: PageIndex, buffer: &[u8]) -> Result<(), StorageError>;

    /// Make previous writes to a file durable.
    fn sync(&self, name: &str) -> Result<(), StorageError>;

    /// Release any handle held for a file.
    fn close(&self, name: &str) -> Result<(), StorageError>;
}

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// No file with this name exists.
    FileNotFound(String),
    /// A file with this name already exists.
    FileAlreadyExists(String),
    /// The file id is not registered with the page cache.
    UnknownFile(FileId),
    /// Page index past the end of the file.
    PageOutOfBounds {
        file: String,
        page_index: PageIndex,
        filled_up_to: u64,
    },
    /// A page failed checksum verification.
    Checksum {
        file: String,
        page_index: PageIndex,
        source: PageError,
    },
    /// WAL error.
    Wal(WalError),
    /// The atomic operation was already committed or rolled back.
    OperationCompleted(u64),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::FileNotFound(name) => write!(f, "file not found: {name}"),
            Self::FileAlreadyExists(name) => write!(f, "file already exists: {name}"),
            Self::UnknownFile(id) => write!(f, "file id {id} is not open"),
            Self::PageOutOfBounds {
                file,
                page_index,
                filled_up_to,
            } => write!(
                f,
                "page {page_index} of {file} out of bounds (filled up to: {filled_up_to})"
            ),
            Self::Checksum {
                file,
                page_index,
                source,
            } => write!(f, "page {page_index} of {file} is corrupted: {source}"),
            Self::Wal(e) => write!(f, "WAL error: {e}"),
            Self::OperationCompleted(id) => {
                write!(f, "atomic operation {id} is already completed")
            }
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Checksum { source, .. } => Some(source),
            Self::Wal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WalError> for StorageError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let error = StorageError::PageOutOfBounds {
            file: "idx.sbt".to_string(),
            page_index: 9,
            filled_up_to: 3,
        };
        assert_eq!(
            error.to_string(),
            "page 9 of idx.sbt out of bounds (filled up to: 3)"
        );
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;

        let error = StorageError::Checksum {
            file: "idx.sbt".to_string(),
            page_index: 0,
            source: PageError::ChecksumMismatch {
                expected: 1,
                actual: 2,
            },
        };
        assert!(error.source().is_some());
        assert!(StorageError::FileNotFound("x".to_string()).source().is_none());
    }
}
