//! Page cache.
//!
//! Keeps the committed image of every page that has been touched since the
//! file was opened. Pages are read from the [`PageStore`] on first access,
//! changed only by installing the changes of a committed atomic operation, and
//! written back on flush.
//!
//! # Design
//!
//! - Each page lives in its own `Arc<RwLock<Page>>` frame. Read handles are
//!   owned guards, so a handle is released exactly once when it is dropped,
//!   whatever path the caller leaves by.
//! - There is no eviction: frames stay resident until their file is closed,
//!   truncated or deleted.
//! - Checksums are verified when a page is read from the store and stamped on
//!   a copy of the page when it is written back.

use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, ArcRwLockReadGuard, Mutex, RawMutex, RawRwLock, RwLock};

use crate::storage::io::{FileId, PageStore, StorageError};
use crate::storage::page::{Page, PageIndex};
use crate::storage::wal_changes::WalChanges;

/// Key of a cached page.
type FrameKey = (FileId, PageIndex);

/// Read access to a page.
///
/// Either the committed image held by the cache, or the private image of an
/// atomic operation that has already changed the page.
pub enum PageReadGuard {
    /// Committed page.
    Committed(ArcRwLockReadGuard<RawRwLock, Page>),
    /// Page changed by the current atomic operation.
    Private(ArcMutexGuard<RawMutex, Page>),
}

impl Deref for PageReadGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        match self {
            Self::Committed(guard) => &**guard,
            Self::Private(guard) => &**guard,
        }
    }
}

struct FileEntry {
    name: String,
    filled_up_to: u64,
}

#[derive(Default)]
struct FileRegistry {
    next_id: FileId,
    by_name: HashMap<String, FileId>,
    files: HashMap<FileId, FileEntry>,
}

impl FileRegistry {
    fn register(&mut self, name: &str, filled_up_to: u64) -> FileId {
        self.next_id += 1;
        let id = self.next_id;
        self.by_name.insert(name.to_string(), id);
        self.files.insert(
            id,
            FileEntry {
                name: name.to_string(),
                filled_up_to,
            },
        );
        id
    }

    fn unregister(&mut self, id: FileId) -> Option<FileEntry> {
        let entry = self.files.remove(&id)?;
        self.by_name.remove(&entry.name);
        Some(entry)
    }

    fn entry(&self, id: FileId) -> Result<&FileEntry, StorageError> {
        self.files.get(&id).ok_or(StorageError::UnknownFile(id))
    }
}

/// Cache of committed pages over a [`PageStore`].
pub struct PageCache {
    store: Box<dyn PageStore>,
    page_size: usize,
    files: RwLock<FileRegistry>,
    frames: Mutex<HashMap<FrameKey, Arc<RwLock<Page>>>>,
    dirty: Mutex<BTreeSet<FrameKey>>,
}

impl PageCache {
    /// Create a cache over `store`.
    #[must_use]
    pub fn new(store: Box<dyn PageStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size,
            files: RwLock::new(FileRegistry::default()),
            frames: Mutex::new(HashMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Create a new, empty file and open it.
    pub fn add_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut files = self.files.write();
        if files.by_name.contains_key(name) {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }
        self.store.create(name)?;
        let id = files.register(name, 0);
        tracing::debug!(file = name, id, "added file");
        Ok(id)
    }

    /// Open an existing file, or return its id if it is already open.
    pub fn open_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut files = self.files.write();
        if let Some(id) = files.by_name.get(name) {
            return Ok(*id);
        }
        if !self.store.exists(name) {
            return Err(StorageError::FileNotFound(name.to_string()));
        }
        let filled_up_to = self.store.page_count(name)?;
        let id = files.register(name, filled_up_to);
        tracing::debug!(file = name, id, filled_up_to, "opened file");
        Ok(id)
    }

    /// Whether a file exists, open or not.
    #[must_use]
    pub fn file_exists(&self, name: &str) -> bool {
        self.files.read().by_name.contains_key(name) || self.store.exists(name)
    }

    /// Id of an open file.
    #[must_use]
    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.files.read().by_name.get(name).copied()
    }

    /// Name of an open file.
    pub fn file_name(&self, id: FileId) -> Result<String, StorageError> {
        Ok(self.files.read().entry(id)?.name.clone())
    }

    /// Number of committed pages in a file.
    pub fn filled_up_to(&self, id: FileId) -> Result<u64, StorageError> {
        Ok(self.files.read().entry(id)?.filled_up_to)
    }

    /// Flush and forget an open file.
    pub fn close_file(&self, id: FileId, flush: bool) -> Result<(), StorageError> {
        if flush {
            self.flush_file(id)?;
        }
        self.drop_frames(id);
        let entry = self
            .files
            .write()
            .unregister(id)
            .ok_or(StorageError::UnknownFile(id))?;
        self.store.close(&entry.name)?;
        tracing::debug!(file = %entry.name, id, "closed file");
        Ok(())
    }

    /// Delete a file and every cached page of it.
    pub fn delete_file(&self, id: FileId) -> Result<(), StorageError> {
        self.drop_frames(id);
        let entry = self
            .files
            .write()
            .unregister(id)
            .ok_or(StorageError::UnknownFile(id))?;
        self.store.delete(&entry.name)?;
        tracing::debug!(file = %entry.name, id, "deleted file");
        Ok(())
    }

    /// Drop every page of a file.
    pub fn truncate_file(&self, id: FileId) -> Result<(), StorageError> {
        self.drop_frames(id);
        let mut files = self.files.write();
        let entry = files.files.get_mut(&id).ok_or(StorageError::UnknownFile(id))?;
        self.store.truncate(&entry.name)?;
        entry.filled_up_to = 0;
        tracing::debug!(file = %entry.name, id, "truncated file");
        Ok(())
    }

    /// Shared access to a committed page.
    pub fn load_for_read(
        &self,
        id: FileId,
        index: PageIndex,
    ) -> Result<PageReadGuard, StorageError> {
        Ok(PageReadGuard::Committed(self.frame(id, index)?.read_arc()))
    }

    /// Apply committed changes to a page, growing the file if the page is new.
    pub(crate) fn install(
        &self,
        id: FileId,
        index: PageIndex,
        changes: &WalChanges,
    ) -> Result<(), StorageError> {
        let filled_up_to = self.filled_up_to(id)?;
        let frame = if index < filled_up_to {
            self.frame(id, index)?
        } else {
            let frame = Arc::new(RwLock::new(Page::new(self.page_size)));
            self.frames.lock().insert((id, index), Arc::clone(&frame));
            if let Some(entry) = self.files.write().files.get_mut(&id) {
                entry.filled_up_to = entry.filled_up_to.max(index + 1);
            }
            frame
        };
        changes.apply_to(&mut frame.write());
        self.dirty.lock().insert((id, index));
        Ok(())
    }

    /// Write every dirty page of a file back to the store and sync it.
    pub fn flush_file(&self, id: FileId) -> Result<(), StorageError> {
        let name = self.file_name(id)?;
        let keys: Vec<FrameKey> = self
            .dirty
            .lock()
            .range((id, 0)..=(id, PageIndex::MAX))
            .copied()
            .collect();
        for key in &keys {
            self.write_back(&name, *key)?;
        }
        self.store.sync(&name)?;
        if !keys.is_empty() {
            tracing::debug!(file = %name, pages = keys.len(), "flushed file");
        }
        Ok(())
    }

    /// Flush every open file.
    pub fn flush(&self) -> Result<(), StorageError> {
        let ids: Vec<FileId> = self.files.read().files.keys().copied().collect();
        for id in ids {
            self.flush_file(id)?;
        }
        Ok(())
    }

    fn write_back(&self, name: &str, key: FrameKey) -> Result<(), StorageError> {
        let frame = self.frames.lock().get(&key).map(Arc::clone);
        if let Some(frame) = frame {
            let mut copy = frame.read().clone();
            copy.seal();
            self.store.write_page(name, key.1, copy.as_bytes())?;
        }
        self.dirty.lock().remove(&key);
        Ok(())
    }

    /// Find or load the frame of a committed page.
    fn frame(&self, id: FileId, index: PageIndex) -> Result<Arc<RwLock<Page>>, StorageError> {
        let (name, filled_up_to) = {
            let files = self.files.read();
            let entry = files.entry(id)?;
            (entry.name.clone(), entry.filled_up_to)
        };
        if index >= filled_up_to {
            return Err(StorageError::PageOutOfBounds {
                file: name,
                page_index: index,
                filled_up_to,
            });
        }

        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&(id, index)) {
            return Ok(Arc::clone(frame));
        }

        let mut page = Page::new(self.page_size);
        self.store.read_page(&name, index, page.as_bytes_mut())?;
        page.verify().map_err(|source| {
            tracing::error!(file = %name, page_index = index, error = %source, "page checksum mismatch");
            StorageError::Checksum {
                file: name.clone(),
                page_index: index,
                source,
            }
        })?;
        let frame = Arc::new(RwLock::new(page));
        frames.insert((id, index), Arc::clone(&frame));
        Ok(frame)
    }

    fn drop_frames(&self, id: FileId) {
        self.frames.lock().retain(|(file, _), _| *file != id);
        self.dirty.lock().retain(|(file, _)| *file != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::page::{MIN_PAGE_SIZE, NEXT_FREE_POSITION};

    fn cache() -> PageCache {
        PageCache::new(Box::new(MemoryStore::new(MIN_PAGE_SIZE)), MIN_PAGE_SIZE)
    }

    fn patch(offset: usize, bytes: &[u8]) -> WalChanges {
        let mut changes = WalChanges::new();
        changes.set_bytes(offset, bytes);
        changes
    }

    #[test]
    fn test_file_registry() {
        let cache = cache();
        assert!(!cache.file_exists("a.sbt"));
        let id = cache.add_file("a.sbt").expect("add file");
        assert!(cache.file_exists("a.sbt"));
        assert_eq!(cache.file_id("a.sbt"), Some(id));
        assert_eq!(cache.open_file("a.sbt").expect("open"), id);
        assert_eq!(cache.file_name(id).expect("name"), "a.sbt");
        assert!(matches!(
            cache.add_file("a.sbt"),
            Err(StorageError::FileAlreadyExists(_))
        ));
        assert!(matches!(
            cache.open_file("b.sbt"),
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_install_grows_file() {
        let cache = cache();
        let id = cache.add_file("a.sbt").expect("add file");
        assert!(matches!(
            cache.load_for_read(id, 0),
            Err(StorageError::PageOutOfBounds { .. })
        ));

        cache
            .install(id, 0, &patch(NEXT_FREE_POSITION, b"root"))
            .expect("install");
        assert_eq!(cache.filled_up_to(id).expect("filled"), 1);
        let page = cache.load_for_read(id, 0).expect("load");
        assert_eq!(page.read_bytes(NEXT_FREE_POSITION, 4), b"root");
    }

    #[test]
    fn test_flush_and_reopen() {
        let cache = cache();
        let id = cache.add_file("a.sbt").expect("add file");
        cache
            .install(id, 0, &patch(NEXT_FREE_POSITION, b"zero"))
            .expect("install");
        cache
            .install(id, 1, &patch(NEXT_FREE_POSITION, b"one!"))
            .expect("install");
        cache.close_file(id, true).expect("close");
        assert_eq!(cache.file_id("a.sbt"), None);

        let id = cache.open_file("a.sbt").expect("reopen");
        assert_eq!(cache.filled_up_to(id).expect("filled"), 2);
        let page = cache.load_for_read(id, 1).expect("load");
        assert!(page.is_sealed());
        assert_eq!(page.read_bytes(NEXT_FREE_POSITION, 4), b"one!");
    }

    #[test]
    fn test_truncate_and_delete() {
        let cache = cache();
        let id = cache.add_file("a.sbt").expect("add file");
        cache.install(id, 0, &patch(100, &[1])).expect("install");
        cache.flush().expect("flush");

        cache.truncate_file(id).expect("truncate");
        assert_eq!(cache.filled_up_to(id).expect("filled"), 0);

        cache.delete_file(id).expect("delete");
        assert!(!cache.file_exists("a.sbt"));
        assert!(matches!(
            cache.filled_up_to(id),
            Err(StorageError::UnknownFile(_))
        ));
    }

    #[test]
    fn test_corrupted_page_is_reported() {
        let store = MemoryStore::new(MIN_PAGE_SIZE);
        let mut page = Page::new(MIN_PAGE_SIZE);
        page.write_bytes(NEXT_FREE_POSITION, b"data");
        page.seal();
        page.write_u8(NEXT_FREE_POSITION, b'X');
        store.create("a.sbt").expect("create");
        store.write_page("a.sbt", 0, page.as_bytes()).expect("write");

        let cache = PageCache::new(Box::new(store), MIN_PAGE_SIZE);
        let id = cache.open_file("a.sbt").expect("open");
        assert!(matches!(
            cache.load_for_read(id, 0),
            Err(StorageError::Checksum { page_index: 0, .. })
        ));
    }
}
