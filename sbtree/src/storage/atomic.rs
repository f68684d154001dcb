//! Atomic operations.
//!
//! An atomic operation groups page changes so that they become visible, and
//! durable, all together or not at all.
//!
//! # Design
//!
//! - Copy-on-write: the first time an operation writes a page it takes a
//!   private copy of the committed image. Committed pages are never touched
//!   until commit.
//! - Commit (under the commit lock): allocate an LSN, stamp it into every
//!   private page, diff each private page against its committed image, append
//!   one log record with all the diffs, then install the diffs into the cache.
//! - Rollback drops the private pages. An operation dropped without being
//!   ended rolls back.
//! - Component locks: an operation can take a component (tree) exclusive lock
//!   that is held until it ends. Readers take the same lock shared.
//!
//! # Invariants
//!
//! - Within one operation pages are installed in the order they were first
//!   written.
//! - A component's committed pages only change while its exclusive lock is
//!   held, so readers holding the shared lock see a consistent state.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{
    ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawMutex, RawRwLock, RwLock,
};

use crate::storage::cache::{PageCache, PageReadGuard};
use crate::storage::io::{FileId, StorageError};
use crate::storage::page::{Page, PageIndex};
use crate::storage::wal::{PageChanges, WalRecord, WriteAheadLog};
use crate::storage::wal_changes::WalChanges;

/// Write access to an operation's private copy of a page.
pub struct PageWriteGuard {
    guard: ArcMutexGuard<RawMutex, Page>,
}

impl Deref for PageWriteGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

/// Shared lock on a component, released on drop.
pub struct ComponentReadGuard {
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

struct Shared {
    cache: Arc<PageCache>,
    /// The log doubles as the commit lock.
    wal: Mutex<WriteAheadLog>,
    component_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    next_operation_id: AtomicU64,
}

impl Shared {
    fn component_lock(&self, component: &str) -> Arc<RwLock<()>> {
        let mut locks = self.component_locks.lock();
        Arc::clone(
            locks
                .entry(component.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Flush the cache and drop every log record.
    fn checkpoint(&self, wal: &mut WriteAheadLog) -> Result<(), StorageError> {
        self.cache.flush()?;
        wal.checkpoint()?;
        Ok(())
    }
}

/// Starts, commits and rolls back atomic operations.
#[derive(Clone)]
pub struct AtomicOperationsManager {
    shared: Arc<Shared>,
}

impl AtomicOperationsManager {
    /// Create a manager over a cache and its log.
    #[must_use]
    pub fn new(cache: Arc<PageCache>, wal: WriteAheadLog) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                wal: Mutex::new(wal),
                component_locks: Mutex::new(HashMap::new()),
                next_operation_id: AtomicU64::new(1),
            }),
        }
    }

    /// Begin a new operation.
    #[must_use]
    pub fn start_atomic_operation(&self) -> AtomicOperation {
        let id = self.shared.next_operation_id.fetch_add(1, Ordering::Relaxed);
        AtomicOperation {
            id,
            shared: Arc::clone(&self.shared),
            pages: HashMap::new(),
            order: Vec::new(),
            filled_up_to: HashMap::new(),
            locks: Vec::new(),
            completed: false,
        }
    }

    /// Commit (or, if `rollback` is set, discard) an operation.
    pub fn end_atomic_operation(
        &self,
        mut operation: AtomicOperation,
        rollback: bool,
    ) -> Result<(), StorageError> {
        debug_assert!(Arc::ptr_eq(&self.shared, &operation.shared));
        if rollback {
            operation.rollback();
            Ok(())
        } else {
            operation.commit()
        }
    }

    /// Run `f` inside a new operation, committing on `Ok` and rolling back on
    /// `Err`.
    pub fn calculate_inside<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut operation = self.start_atomic_operation();
        match f(&mut operation) {
            Ok(value) => {
                self.end_atomic_operation(operation, false)?;
                Ok(value)
            }
            Err(e) => {
                self.end_atomic_operation(operation, true)?;
                Err(e)
            }
        }
    }

    /// Like [`Self::calculate_inside`] for closures without a result.
    pub fn execute_inside<E, F>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<(), E>,
        E: From<StorageError>,
    {
        self.calculate_inside(f)
    }

    /// Take `component`'s exclusive lock until `operation` ends.
    ///
    /// Taking a lock the operation already holds is a no-op.
    pub fn acquire_exclusive_lock_till_operation_complete(
        &self,
        operation: &mut AtomicOperation,
        component: &str,
    ) {
        debug_assert!(Arc::ptr_eq(&self.shared, &operation.shared));
        operation.lock_component(component);
    }

    /// Take `component`'s shared lock.
    ///
    /// Must not be called by a thread whose open operation holds the same
    /// component exclusively.
    #[must_use]
    pub fn acquire_read_lock(&self, component: &str) -> ComponentReadGuard {
        ComponentReadGuard {
            _guard: self.shared.component_lock(component).read_arc(),
        }
    }

    /// Release a shared lock taken with [`Self::acquire_read_lock`].
    #[allow(clippy::unused_self)] // Paired with acquire_read_lock
    pub fn release_read_lock(&self, guard: ComponentReadGuard) {
        drop(guard);
    }

    /// Flush every committed page and truncate the log.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let mut wal = self.shared.wal.lock();
        self.shared.checkpoint(&mut wal)
    }

    /// The cache this manager commits into.
    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.shared.cache
    }
}

/// One in-progress atomic operation.
pub struct AtomicOperation {
    id: u64,
    shared: Arc<Shared>,
    /// Private page images.
    pages: HashMap<(FileId, PageIndex), Arc<Mutex<Page>>>,
    /// Pages in the order they were first written.
    order: Vec<(FileId, PageIndex)>,
    /// File lengths including pages added by this operation.
    filled_up_to: HashMap<FileId, u64>,
    locks: Vec<(String, ArcRwLockWriteGuard<RawRwLock, ()>)>,
    completed: bool,
}

impl AtomicOperation {
    /// Operation id, unique within the process.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Whether the operation has written any page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Whether this operation holds `component`'s exclusive lock.
    #[must_use]
    pub fn holds_lock(&self, component: &str) -> bool {
        self.locks.iter().any(|(name, _)| name == component)
    }

    fn lock_component(&mut self, component: &str) {
        if self.holds_lock(component) {
            return;
        }
        let guard = self.shared.component_lock(component).write_arc();
        self.locks.push((component.to_string(), guard));
    }

    fn cache(&self) -> &PageCache {
        &self.shared.cache
    }

    /// Number of pages in a file as seen by this operation.
    pub fn filled_up_to(&self, file: FileId) -> Result<u64, StorageError> {
        let committed = self.cache().filled_up_to(file)?;
        Ok(self
            .filled_up_to
            .get(&file)
            .map_or(committed, |own| committed.max(*own)))
    }

    /// Append a new zeroed page to a file.
    pub fn add_page(
        &mut self,
        file: FileId,
    ) -> Result<(PageIndex, PageWriteGuard), StorageError> {
        let index = self.filled_up_to(file)?;
        self.filled_up_to.insert(file, index + 1);
        let page = Arc::new(Mutex::new(Page::new(self.cache().page_size())));
        let guard = page.lock_arc();
        self.pages.insert((file, index), page);
        self.order.push((file, index));
        Ok((index, PageWriteGuard { guard }))
    }

    /// Write access to a page. The first call copies the committed image.
    pub fn load_for_write(
        &mut self,
        file: FileId,
        index: PageIndex,
    ) -> Result<PageWriteGuard, StorageError> {
        if let Some(page) = self.pages.get(&(file, index)) {
            return Ok(PageWriteGuard {
                guard: page.lock_arc(),
            });
        }
        let copy = Page::clone(&*self.cache().load_for_read(file, index)?);
        let page = Arc::new(Mutex::new(copy));
        let guard = page.lock_arc();
        self.pages.insert((file, index), page);
        self.order.push((file, index));
        Ok(PageWriteGuard { guard })
    }

    /// Read access to a page as this operation sees it.
    ///
    /// Must not be called while a write guard on the same page is alive.
    pub fn load_for_read(
        &self,
        file: FileId,
        index: PageIndex,
    ) -> Result<PageReadGuard, StorageError> {
        match self.pages.get(&(file, index)) {
            Some(page) => Ok(PageReadGuard::Private(page.lock_arc())),
            None => self.cache().load_for_read(file, index),
        }
    }

    /// Create a new file. Takes effect immediately, even if the operation is
    /// rolled back.
    pub fn add_file(&self, name: &str) -> Result<FileId, StorageError> {
        self.cache().add_file(name)
    }

    /// Open an existing file.
    pub fn open_file(&self, name: &str) -> Result<FileId, StorageError> {
        self.cache().open_file(name)
    }

    /// Drop every page of a file. Takes effect immediately; the log is
    /// checkpointed first so that recovery never replays into the new file.
    pub fn truncate_file(&mut self, file: FileId) -> Result<(), StorageError> {
        self.forget_file(file);
        let mut wal = self.shared.wal.lock();
        self.shared.checkpoint(&mut wal)?;
        self.cache().truncate_file(file)
    }

    /// Delete a file. Takes effect immediately, like [`Self::truncate_file`].
    pub fn delete_file(&mut self, file: FileId) -> Result<(), StorageError> {
        self.forget_file(file);
        let mut wal = self.shared.wal.lock();
        self.shared.checkpoint(&mut wal)?;
        self.cache().delete_file(file)
    }

    fn forget_file(&mut self, file: FileId) {
        self.pages.retain(|(id, _), _| *id != file);
        self.order.retain(|(id, _)| *id != file);
        self.filled_up_to.remove(&file);
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.completed {
            return Err(StorageError::OperationCompleted(self.id));
        }
        self.completed = true;
        if self.order.is_empty() {
            self.release();
            return Ok(());
        }

        let mut wal = self.shared.wal.lock();
        let lsn = wal.next_lsn();

        let mut record = WalRecord {
            lsn,
            operation_id: self.id,
            pages: Vec::with_capacity(self.order.len()),
        };
        let mut installs = Vec::with_capacity(self.order.len());
        for key in &self.order {
            let Some(private) = self.pages.get(key) else {
                continue;
            };
            let (file, index) = *key;
            let mut page = private.lock();
            page.set_lsn(lsn);
            let changes = if index < self.shared.cache.filled_up_to(file)? {
                let committed = self.shared.cache.load_for_read(file, index)?;
                WalChanges::diff(committed.as_bytes(), page.as_bytes())
            } else {
                WalChanges::diff(&vec![0u8; page.size()], page.as_bytes())
            };
            record.pages.push(PageChanges {
                file: self.shared.cache.file_name(file)?,
                page_index: index,
                changes: changes.clone(),
            });
            installs.push((file, index, changes));
        }

        wal.append(&record)?;
        for (file, index, changes) in &installs {
            self.shared.cache.install(*file, *index, changes)?;
        }
        drop(wal);

        tracing::trace!(
            operation = self.id,
            %lsn,
            pages = installs.len(),
            "committed atomic operation"
        );
        self.release();
        Ok(())
    }

    fn rollback(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if !self.order.is_empty() {
            tracing::debug!(
                operation = self.id,
                pages = self.order.len(),
                "rolled back atomic operation"
            );
        }
        self.release();
    }

    fn release(&mut self) {
        self.pages.clear();
        self.order.clear();
        self.filled_up_to.clear();
        self.locks.clear();
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        self.rollback();
    }
}
