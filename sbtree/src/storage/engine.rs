//! Storage instance: page store, page cache, write-ahead log and atomic
//! operations wired together.
//!
//! # Recovery
//!
//! Opening a directory-backed storage replays the write-ahead log. A logged
//! page change is applied only if the page's LSN is older than the record's,
//! so replaying a record twice is harmless. Afterwards every page is flushed
//! and the log is checkpointed.

use std::path::Path;
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::storage::atomic::AtomicOperationsManager;
use crate::storage::cache::PageCache;
use crate::storage::file::DiskStore;
use crate::storage::io::{PageStore, StorageError};
use crate::storage::memory::MemoryStore;
use crate::storage::wal::{WalRecord, WriteAheadLog};

/// Name of the log file inside a storage directory.
pub const WAL_FILE_NAME: &str = "wal.log";

/// A storage instance shared by the trees that live in it.
pub struct Storage {
    cache: Arc<PageCache>,
    atomic_operations: AtomicOperationsManager,
    config: IndexConfig,
}

impl Storage {
    /// Open (or create) directory-backed storage, recovering from the log.
    pub fn open(directory: &Path, config: &IndexConfig) -> Result<Self, StorageError> {
        let store = DiskStore::open(directory, config.page_size)?;
        let (wal, records) =
            WriteAheadLog::open(&directory.join(WAL_FILE_NAME), config.wal_sync_on_commit)?;
        let cache = Arc::new(PageCache::new(Box::new(store), config.page_size));

        let replayed = recover(&cache, &records)?;
        let storage = Self::assemble(cache, wal, config);
        storage.flush()?;

        tracing::info!(
            directory = %directory.display(),
            records = records.len(),
            replayed,
            "opened storage"
        );
        Ok(storage)
    }

    /// Storage that lives only in memory.
    #[must_use]
    pub fn in_memory(config: &IndexConfig) -> Self {
        Self::with_store(Box::new(MemoryStore::new(config.page_size)), config)
    }

    /// Storage over an arbitrary page store, with an in-memory log.
    #[must_use]
    pub fn with_store(store: Box<dyn PageStore>, config: &IndexConfig) -> Self {
        let cache = Arc::new(PageCache::new(store, config.page_size));
        Self::assemble(cache, WriteAheadLog::in_memory(), config)
    }

    fn assemble(cache: Arc<PageCache>, wal: WriteAheadLog, config: &IndexConfig) -> Self {
        let atomic_operations = AtomicOperationsManager::new(Arc::clone(&cache), wal);
        Self {
            cache,
            atomic_operations,
            config: config.clone(),
        }
    }

    /// The configuration this storage was opened with.
    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The page cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// The atomic operations manager.
    #[must_use]
    pub const fn atomic_operations(&self) -> &AtomicOperationsManager {
        &self.atomic_operations
    }

    /// Page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.cache.page_size()
    }

    /// Write every committed page to the store and truncate the log.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.atomic_operations.checkpoint()
    }
}

/// Apply logged changes that did not reach the store. Returns how many page
/// changes were applied.
fn recover(cache: &PageCache, records: &[WalRecord]) -> Result<usize, StorageError> {
    let mut applied = 0;
    for record in records {
        for page in &record.pages {
            if !cache.file_exists(&page.file) {
                tracing::warn!(
                    file = %page.file,
                    lsn = %record.lsn,
                    "skipping log record for missing file"
                );
                continue;
            }
            let file = cache.open_file(&page.file)?;
            if page.page_index < cache.filled_up_to(file)? {
                let current = cache.load_for_read(file, page.page_index)?.lsn();
                if current >= record.lsn {
                    continue;
                }
            }
            cache.install(file, page.page_index, &page.changes)?;
            applied += 1;
        }
    }
    if applied > 0 {
        tracing::info!(applied, "replayed write-ahead log");
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::io::FileId;
    use crate::storage::page::{Lsn, MIN_PAGE_SIZE, NEXT_FREE_POSITION};
    use tempfile::tempdir;

    fn config() -> IndexConfig {
        IndexConfig::default().with_page_size(MIN_PAGE_SIZE)
    }

    fn write_page(storage: &Storage, name: &str, value: u8) -> FileId {
        storage
            .atomic_operations()
            .calculate_inside(|op| -> Result<FileId, StorageError> {
                let file = match storage.cache().file_id(name) {
                    Some(file) => file,
                    None if storage.cache().file_exists(name) => op.open_file(name)?,
                    None => op.add_file(name)?,
                };
                if op.filled_up_to(file)? == 0 {
                    op.add_page(file)?;
                }
                op.load_for_write(file, 0)?.write_u8(NEXT_FREE_POSITION, value);
                Ok(file)
            })
            .expect("write page")
    }

    #[test]
    fn test_reopen_after_flush() {
        let dir = tempdir().expect("create temp dir");
        {
            let storage = Storage::open(dir.path(), &config()).expect("open");
            write_page(&storage, "a.sbt", 5);
            storage.flush().expect("flush");
        }

        let storage = Storage::open(dir.path(), &config()).expect("reopen");
        let file = storage.cache().open_file("a.sbt").expect("open file");
        let page = storage.cache().load_for_read(file, 0).expect("load");
        assert_eq!(page.read_u8(NEXT_FREE_POSITION), 5);
        assert_eq!(page.lsn().segment, 1);
    }

    #[test]
    fn test_recovery_replays_unflushed_commits() {
        let dir = tempdir().expect("create temp dir");
        {
            let storage = Storage::open(dir.path(), &config()).expect("open");
            write_page(&storage, "a.sbt", 1);
            storage.flush().expect("flush");
            write_page(&storage, "a.sbt", 2);
            write_page(&storage, "a.sbt", 3);
            // Dropped without flushing: only the log has the last two commits.
        }

        let storage = Storage::open(dir.path(), &config()).expect("reopen");
        let file = storage.cache().open_file("a.sbt").expect("open file");
        let page = storage.cache().load_for_read(file, 0).expect("load");
        assert_eq!(page.read_u8(NEXT_FREE_POSITION), 3);
        assert_eq!(page.lsn(), Lsn::new(1, 3));

        // New commits get a newer segment.
        drop(page);
        write_page(&storage, "a.sbt", 4);
        let page = storage.cache().load_for_read(file, 0).expect("load");
        assert_eq!(page.lsn().segment, 2);
    }

    #[test]
    fn test_in_memory_storage() {
        let storage = Storage::in_memory(&config());
        assert_eq!(storage.page_size(), MIN_PAGE_SIZE);
        let file = write_page(&storage, "a.sbt", 9);
        storage.flush().expect("flush");
        let page = storage.cache().load_for_read(file, 0).expect("load");
        assert_eq!(page.read_u8(NEXT_FREE_POSITION), 9);
    }
}
