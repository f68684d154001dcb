//! Page-oriented storage for the index engine.
//!
//! # Layers
//!
//! - [`PageStore`]: durable home of named page files ([`DiskStore`] or
//!   [`MemoryStore`])
//! - [`PageCache`]: committed page images, loaded on demand and flushed back
//! - [`WriteAheadLog`]: one record of byte-range changes per committed
//!   atomic operation, replayed on open
//! - [`AtomicOperationsManager`]: copy-on-write atomic operations and the
//!   component locks trees use to serialize structural changes
//! - [`btree`]: the SBTree index built on top of all of the above
//!
//! # Usage
//!
//! ```ignore
//! use sbtree::config::IndexConfig;
//! use sbtree::storage::Storage;
//!
//! let storage = Storage::open(path, &IndexConfig::from_env()?)?;
//! storage.atomic_operations().execute_inside(|op| {
//!     let (index, mut page) = op.add_page(file)?;
//!     page.write_bytes(28, b"hello");
//!     Ok::<_, StorageError>(())
//! })?;
//! storage.flush()?;
//! ```

mod atomic;
pub mod btree;
mod cache;
mod engine;
mod file;
mod io;
mod memory;
mod page;
mod wal;
mod wal_changes;

pub use atomic::{AtomicOperation, AtomicOperationsManager, ComponentReadGuard, PageWriteGuard};
pub use cache::{PageCache, PageReadGuard};
pub use engine::{Storage, WAL_FILE_NAME};
pub use file::DiskStore;
pub use io::{FileId, PageStore, StorageError};
pub use memory::{FaultConfig, MemoryStore, MemoryStoreStats};
pub use page::{
    DEFAULT_PAGE_SIZE, Lsn, MAGIC_NUMBER, MIN_PAGE_SIZE, NEXT_FREE_POSITION, Page, PageError,
    PageIndex,
};
pub use wal::{PageChanges, WalError, WalRecord, WriteAheadLog};
pub use wal_changes::WalChanges;
