//! The SBTree index.
//!
//! # Design
//!
//! - Pages live in one file, `<name>.sbt`. The root is always page 0 and
//!   carries the tree's entry count.
//! - Trees that accept the null key keep its value in the single page of
//!   `<name>.nbt`, added on first write.
//! - Every mutation runs inside an atomic operation that holds the tree's
//!   exclusive component lock until the operation ends. Readers take the
//!   shared lock and see committed pages only.
//! - A full leaf is split and the insert retried. Splits cascade up through
//!   full parents. A root split moves the root's entries into two new pages
//!   so the root stays at page 0.
//! - Pages are never merged or freed after deletions.
//!
//! # Invariants
//!
//! - Leaves form one doubly linked list in key order.
//! - An entry, position included, takes at most a quarter of a page's entry
//!   area, so a split always makes room.
//! - The root's entry count equals the number of stored keys, null key
//!   included.

use std::ops::Deref;

use parking_lot::RwLock;

use crate::key::{KeyType, PartialSearchMode, TreeKey};
use crate::serialization::BinarySerializer;
use crate::storage::btree::bucket::{Bucket, BucketValue, POSITIONS_ARRAY_OFFSET};
use crate::storage::btree::cursor::{BackwardCursor, Bounds, EntryCursor, ForwardCursor, KeyCursor};
use crate::storage::btree::null_bucket::{self, NullBucket};
use crate::storage::{
    AtomicOperation, AtomicOperationsManager, FileId, Page, PageCache, PageIndex, PageReadGuard,
    Storage, StorageError,
};

/// Extension of the file holding the tree pages.
pub const TREE_FILE_EXTENSION: &str = ".sbt";
/// Extension of the file holding the null-key value.
pub const NULL_BUCKET_FILE_EXTENSION: &str = ".nbt";

pub(super) const ROOT_INDEX: PageIndex = 0;

const POSITION_SIZE: usize = 4;
/// Child pointers plus position of an internal entry.
const INTERNAL_ENTRY_OVERHEAD: usize = 16 + POSITION_SIZE;

/// Per-tree options fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOptions {
    /// Number of fields in a composite key; 1 for plain keys.
    pub key_size: usize,
    /// Declared field types, used to coerce keys before they are stored or
    /// searched for.
    pub key_types: Vec<KeyType>,
    /// Whether the tree accepts the null key.
    pub null_keys_supported: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            key_size: 1,
            key_types: Vec::new(),
            null_keys_supported: false,
        }
    }
}

impl TreeOptions {
    /// Accept the null key.
    #[must_use]
    pub fn with_null_keys(mut self) -> Self {
        self.null_keys_supported = true;
        self
    }

    /// Declare composite key field types. The key size follows the number of
    /// types.
    #[must_use]
    pub fn with_key_types(mut self, key_types: Vec<KeyType>) -> Self {
        self.key_size = key_types.len().max(1);
        self.key_types = key_types;
        self
    }
}

/// What an updater decided to do with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction<V> {
    /// Leave the tree unchanged.
    Nothing,
    /// Store this value.
    Change(V),
    /// Remove the key.
    Remove,
}

/// Verdict of a put validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Go ahead with the put.
    Accept,
    /// Skip the put, leaving the tree unchanged.
    Ignore,
}

/// Put validator: sees the key, the current value and the new value.
pub type Validator<'a, K, V> = &'a dyn Fn(Option<&K>, Option<&V>, &V) -> Validation;

/// Lifecycle state of a tree handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    /// Neither created nor loaded (or deleted).
    Uncreated,
    /// Ready for use.
    Open,
    /// Closed; can be loaded again.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Files {
    pub tree: FileId,
    pub null: Option<FileId>,
}

enum State {
    Uncreated,
    Open(Files),
    Closed,
}

/// Structure summary produced by [`SBTree::check_consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Entry count stored in the root.
    pub size: u64,
    /// Levels from the root to the leaves.
    pub depth: usize,
    /// Pages reachable from the root.
    pub pages: usize,
    /// Leaf pages.
    pub leaf_pages: usize,
}

/// Errors that can occur during tree operations.
#[derive(Debug)]
pub enum BTreeErrorKind {
    /// Serialized key exceeds the tree's key limit.
    KeyTooLarge { size: usize, max: usize },
    /// Serialized entry exceeds a quarter of a page.
    EntryTooLarge { size: usize, max: usize },
    /// Descent went deeper than the maximum path length.
    Corrupted,
    /// Page contents contradict the tree structure.
    Inconsistent(String),
    /// The null key was used on a tree that does not accept it.
    NullKeysNotSupported,
    /// Delete of a tree that still has entries.
    NotEmpty { size: u64 },
    /// The tree is not open.
    NotOpen,
    /// Create of a tree that already exists.
    AlreadyExists,
    /// A stored value is a page link, which this engine never writes.
    LinkedValue,
    /// A key to be stored contains a search sentinel.
    SentinelKey,
    /// Storage error.
    Storage(StorageError),
}

impl std::fmt::Display for BTreeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyTooLarge { size, max } => write!(
                f,
                "Key size is more than allowed, operation was canceled. Current key size {size}, allowed {max}"
            ),
            Self::EntryTooLarge { size, max } => write!(
                f,
                "Entry size is more than allowed, operation was canceled. Current entry size {size}, allowed {max}"
            ),
            Self::Corrupted => write!(
                f,
                "We reached max level of depth of SBTree but still found nothing, seems like tree is in corrupted state. You should rebuild index related to given query."
            ),
            Self::Inconsistent(message) => write!(f, "inconsistent tree: {message}"),
            Self::NullKeysNotSupported => write!(f, "Null keys are not supported."),
            Self::NotEmpty { size } => write!(
                f,
                "Not empty index can not be deleted. Index has {size} records"
            ),
            Self::NotOpen => write!(f, "tree is not open"),
            Self::AlreadyExists => write!(f, "tree already exists"),
            Self::LinkedValue => write!(f, "linked values are not supported"),
            Self::SentinelKey => write!(f, "search sentinels can not be stored in a key"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for BTreeErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for BTreeErrorKind {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// A tree error, tagged with the tree's name.
#[derive(Debug)]
pub struct BTreeError {
    pub tree: String,
    pub kind: BTreeErrorKind,
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sbtree {}: {}", self.tree, self.kind)
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BTreeErrorKind::Storage(e) => Some(e),
            _ => None,
        }
    }
}

fn file_error(e: StorageError) -> BTreeErrorKind {
    match e {
        StorageError::FileAlreadyExists(_) => BTreeErrorKind::AlreadyExists,
        other => BTreeErrorKind::Storage(other),
    }
}

/// Unwrap an inline value.
pub(super) fn inline_value<V>(value: BucketValue<V>) -> Result<V, BTreeErrorKind> {
    match value {
        BucketValue::Inline(value) => Ok(value),
        BucketValue::Link(_) => Err(BTreeErrorKind::LinkedValue),
    }
}

const fn lower_bound_mode(inclusive: bool) -> PartialSearchMode {
    if inclusive {
        PartialSearchMode::LowestBoundary
    } else {
        PartialSearchMode::HighestBoundary
    }
}

const fn upper_bound_mode(inclusive: bool) -> PartialSearchMode {
    if inclusive {
        PartialSearchMode::HighestBoundary
    } else {
        PartialSearchMode::LowestBoundary
    }
}

/// Where a tree reads pages from: the committed images, or an atomic
/// operation's view of them.
pub(super) trait PageSource {
    fn load_page(&self, file: FileId, index: PageIndex) -> Result<PageReadGuard, StorageError>;
    fn page_count(&self, file: FileId) -> Result<u64, StorageError>;
}

impl PageSource for PageCache {
    fn load_page(&self, file: FileId, index: PageIndex) -> Result<PageReadGuard, StorageError> {
        self.load_for_read(file, index)
    }

    fn page_count(&self, file: FileId) -> Result<u64, StorageError> {
        self.filled_up_to(file)
    }
}

impl PageSource for AtomicOperation {
    fn load_page(&self, file: FileId, index: PageIndex) -> Result<PageReadGuard, StorageError> {
        self.load_for_read(file, index)
    }

    fn page_count(&self, file: FileId) -> Result<u64, StorageError> {
        self.filled_up_to(file)
    }
}

/// Result of descending to the leaf that holds (or would hold) a key.
pub(super) struct BucketSearch {
    /// Pages from the root down to the leaf.
    pub path: Vec<PageIndex>,
    /// `Ok` with the key's index, or `Err` with its insertion point.
    pub index: Result<usize, usize>,
}

impl BucketSearch {
    pub fn leaf(&self) -> PageIndex {
        self.path.last().copied().unwrap_or(ROOT_INDEX)
    }
}

struct Split<K> {
    page_index: PageIndex,
    is_leaf: bool,
    split_index: usize,
    separator: K,
    raw_separator: Vec<u8>,
    left_entries: Vec<Vec<u8>>,
    right_entries: Vec<Vec<u8>>,
    right_sibling: Option<PageIndex>,
    tree_size: u64,
}

impl<K> Split<K> {
    /// Index of the first entry that moved to the right page.
    const fn right_start(&self) -> usize {
        if self.is_leaf {
            self.split_index
        } else {
            self.split_index + 1
        }
    }
}

/// A page-oriented B+-tree mapping keys to values.
pub struct SBTree<KS, VS> {
    name: String,
    operations: AtomicOperationsManager,
    keys: KS,
    values: VS,
    options: TreeOptions,
    page_size: usize,
    max_key_size: usize,
    max_entry_size: usize,
    max_path_length: usize,
    prefetch_size: usize,
    state: RwLock<State>,
}

impl<KS, VS> SBTree<KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    /// A handle to the tree `name` in `storage`. Call [`Self::create`] or
    /// [`Self::load`] before use.
    pub fn new(storage: &Storage, name: &str, keys: KS, values: VS, options: TreeOptions) -> Self {
        let config = storage.config();
        let max_entry_size = config.page_size.saturating_sub(POSITIONS_ARRAY_OFFSET) / 4;
        let max_key_size = config
            .max_key_size
            .min(max_entry_size.saturating_sub(INTERNAL_ENTRY_OVERHEAD));
        Self {
            name: name.to_string(),
            operations: storage.atomic_operations().clone(),
            keys,
            values,
            options,
            page_size: config.page_size,
            max_key_size,
            max_entry_size,
            max_path_length: config.max_path_length,
            prefetch_size: config.prefetch_size,
            state: RwLock::new(State::Uncreated),
        }
    }

    /// The tree's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tree's options.
    #[must_use]
    pub const fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Largest serialized key this tree accepts.
    #[must_use]
    pub const fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TreeState {
        match *self.state.read() {
            State::Uncreated => TreeState::Uncreated,
            State::Open(_) => TreeState::Open,
            State::Closed => TreeState::Closed,
        }
    }

    /// Whether the tree is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == TreeState::Open
    }

    pub(super) fn error(&self, kind: BTreeErrorKind) -> BTreeError {
        BTreeError {
            tree: self.name.clone(),
            kind,
        }
    }

    pub(super) const fn operations(&self) -> &AtomicOperationsManager {
        &self.operations
    }

    pub(super) const fn prefetch_size(&self) -> usize {
        self.prefetch_size
    }

    pub(super) fn files(&self) -> Result<Files, BTreeErrorKind> {
        match *self.state.read() {
            State::Open(files) => Ok(files),
            State::Uncreated | State::Closed => Err(BTreeErrorKind::NotOpen),
        }
    }

    pub(super) const fn bucket<P: Deref<Target = Page>>(&self, page: P) -> Bucket<'_, P, KS, VS> {
        Bucket::new(page, &self.keys, &self.values)
    }

    fn tree_file_name(&self) -> String {
        format!("{}{TREE_FILE_EXTENSION}", self.name)
    }

    fn null_file_name(&self) -> String {
        format!("{}{NULL_BUCKET_FILE_EXTENSION}", self.name)
    }

    fn preprocess(&self, key: KS::Value) -> KS::Value {
        self.keys.preprocess(key.coerce(&self.options.key_types))
    }

    fn range_key(&self, key: &KS::Value, mode: PartialSearchMode) -> KS::Value {
        let key = self.preprocess(key.clone());
        if self.options.key_size > 1 {
            key.enhance(self.options.key_size, mode)
        } else {
            key
        }
    }

    fn run<T>(
        &self,
        f: impl FnOnce(&mut AtomicOperation) -> Result<T, BTreeErrorKind>,
    ) -> Result<T, BTreeError> {
        self.operations
            .calculate_inside(f)
            .map_err(|kind| self.error(kind))
    }

    fn read_committed<T>(
        &self,
        f: impl FnOnce(&PageCache, Files) -> Result<T, BTreeErrorKind>,
    ) -> Result<T, BTreeError> {
        let _lock = self.operations.acquire_read_lock(&self.name);
        let files = self.files().map_err(|kind| self.error(kind))?;
        f(self.operations.cache(), files).map_err(|kind| self.error(kind))
    }

    /// Take the tree's exclusive lock until `op` ends.
    pub fn acquire_atomic_exclusive_lock(&self, op: &mut AtomicOperation) {
        self.operations
            .acquire_exclusive_lock_till_operation_complete(op, &self.name);
    }

    // Lifecycle

    /// Create the tree's files and an empty root.
    pub fn create(&self) -> Result<(), BTreeError> {
        self.run(|op| self.create_inner(op))
    }

    /// [`Self::create`] inside a caller-owned operation.
    pub fn create_in(&self, op: &mut AtomicOperation) -> Result<(), BTreeError> {
        self.create_inner(op).map_err(|kind| self.error(kind))
    }

    fn create_inner(&self, op: &mut AtomicOperation) -> Result<(), BTreeErrorKind> {
        self.acquire_atomic_exclusive_lock(op);
        let mut state = self.state.write();
        if matches!(*state, State::Open(_)) {
            return Err(BTreeErrorKind::AlreadyExists);
        }

        let tree = op.add_file(&self.tree_file_name()).map_err(file_error)?;
        let null = if self.options.null_keys_supported {
            Some(op.add_file(&self.null_file_name()).map_err(file_error)?)
        } else {
            None
        };

        let (root, mut page) = op.add_page(tree)?;
        if root != ROOT_INDEX {
            return Err(BTreeErrorKind::Inconsistent(format!(
                "new tree file starts at page {root}"
            )));
        }
        self.bucket(&mut *page).init(true);

        *state = State::Open(Files { tree, null });
        tracing::info!(
            tree = %self.name,
            null_keys = self.options.null_keys_supported,
            "created tree"
        );
        Ok(())
    }

    /// Open an existing tree. Loading an open tree is a no-op.
    pub fn load(&self) -> Result<(), BTreeError> {
        self.load_inner().map_err(|kind| self.error(kind))
    }

    fn load_inner(&self) -> Result<(), BTreeErrorKind> {
        let _lock = self.operations.acquire_read_lock(&self.name);
        let mut state = self.state.write();
        if matches!(*state, State::Open(_)) {
            return Ok(());
        }

        let cache = self.operations.cache();
        let tree = cache.open_file(&self.tree_file_name())?;
        if cache.filled_up_to(tree)? == 0 {
            return Err(BTreeErrorKind::Inconsistent(
                "root page is missing".to_string(),
            ));
        }
        let size = {
            let root = self.bucket(cache.load_for_read(tree, ROOT_INDEX)?);
            let expected = self.keys.id().as_u8();
            if root.key_serializer_id() != expected {
                return Err(BTreeErrorKind::Inconsistent(format!(
                    "stored key serializer {} does not match {expected}",
                    root.key_serializer_id()
                )));
            }
            root.tree_size()
        };
        let null = if self.options.null_keys_supported {
            Some(cache.open_file(&self.null_file_name())?)
        } else {
            None
        };

        *state = State::Open(Files { tree, null });
        tracing::info!(tree = %self.name, size, "loaded tree");
        Ok(())
    }

    /// Flush and close the tree's files.
    pub fn close(&self) -> Result<(), BTreeError> {
        self.run(|op| {
            self.acquire_atomic_exclusive_lock(op);
            let mut state = self.state.write();
            let State::Open(files) = *state else {
                return Err(BTreeErrorKind::NotOpen);
            };
            let cache = self.operations.cache();
            cache.close_file(files.tree, true)?;
            if let Some(null) = files.null {
                cache.close_file(null, true)?;
            }
            *state = State::Closed;
            tracing::info!(tree = %self.name, "closed tree");
            Ok(())
        })
    }

    /// Delete the tree's files. Fails unless the tree is empty.
    pub fn delete(&self) -> Result<(), BTreeError> {
        self.run(|op| self.delete_inner(op))
    }

    /// [`Self::delete`] inside a caller-owned operation.
    pub fn delete_in(&self, op: &mut AtomicOperation) -> Result<(), BTreeError> {
        self.delete_inner(op).map_err(|kind| self.error(kind))
    }

    fn delete_inner(&self, op: &mut AtomicOperation) -> Result<(), BTreeErrorKind> {
        self.acquire_atomic_exclusive_lock(op);
        let mut state = self.state.write();
        let State::Open(files) = *state else {
            return Err(BTreeErrorKind::NotOpen);
        };
        let size = self
            .bucket(op.load_for_read(files.tree, ROOT_INDEX)?)
            .tree_size();
        if size > 0 {
            return Err(BTreeErrorKind::NotEmpty { size });
        }

        op.delete_file(files.tree)?;
        if let Some(null) = files.null {
            op.delete_file(null)?;
        }
        *state = State::Uncreated;
        tracing::info!(tree = %self.name, "deleted tree");
        Ok(())
    }

    /// Drop every entry, leaving an empty root.
    ///
    /// Truncation takes effect at once; rolling back the surrounding
    /// operation does not bring the entries back.
    pub fn clear(&self) -> Result<(), BTreeError> {
        self.run(|op| self.clear_inner(op))
    }

    /// [`Self::clear`] inside a caller-owned operation.
    pub fn clear_in(&self, op: &mut AtomicOperation) -> Result<(), BTreeError> {
        self.clear_inner(op).map_err(|kind| self.error(kind))
    }

    fn clear_inner(&self, op: &mut AtomicOperation) -> Result<(), BTreeErrorKind> {
        self.acquire_atomic_exclusive_lock(op);
        let files = self.files()?;

        op.truncate_file(files.tree)?;
        let (_, mut page) = op.add_page(files.tree)?;
        self.bucket(&mut *page).init(true);
        drop(page);
        if let Some(null) = files.null {
            op.truncate_file(null)?;
        }
        tracing::info!(tree = %self.name, "cleared tree");
        Ok(())
    }

    /// Write the tree's committed pages to the store.
    pub fn flush(&self) -> Result<(), BTreeError> {
        self.read_committed(|cache, files| {
            cache.flush_file(files.tree)?;
            if let Some(null) = files.null {
                cache.flush_file(null)?;
            }
            Ok(())
        })
    }

    // Reads

    /// Number of stored keys, null key included.
    pub fn size(&self) -> Result<u64, BTreeError> {
        self.read_committed(|cache, files| {
            Ok(self
                .bucket(cache.load_for_read(files.tree, ROOT_INDEX)?)
                .tree_size())
        })
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &KS::Value) -> Result<Option<VS::Value>, BTreeError> {
        self.read_committed(|cache, files| self.get_from(cache, files, Some(key)))
    }

    /// Value stored under the null key.
    pub fn get_null(&self) -> Result<Option<VS::Value>, BTreeError> {
        self.read_committed(|cache, files| self.get_from(cache, files, None))
    }

    /// Value stored under `key` (`None` for the null key) as `op` sees it,
    /// including its own uncommitted writes.
    pub fn get_in(
        &self,
        op: &AtomicOperation,
        key: Option<&KS::Value>,
    ) -> Result<Option<VS::Value>, BTreeError> {
        let _lock = (!op.holds_lock(&self.name))
            .then(|| self.operations.acquire_read_lock(&self.name));
        let files = self.files().map_err(|kind| self.error(kind))?;
        self.get_from(op, files, key)
            .map_err(|kind| self.error(kind))
    }

    fn get_from<S: PageSource + ?Sized>(
        &self,
        source: &S,
        files: Files,
        key: Option<&KS::Value>,
    ) -> Result<Option<VS::Value>, BTreeErrorKind> {
        let Some(key) = key else {
            let null = files.null.ok_or(BTreeErrorKind::NullKeysNotSupported)?;
            if source.page_count(null)? == 0 {
                return Ok(None);
            }
            return NullBucket::new(source.load_page(null, 0)?)
                .value(&self.values)
                .map(inline_value)
                .transpose();
        };

        let key = self.preprocess(key.clone());
        let search = self.find_bucket(source, files.tree, &key)?;
        let Ok(index) = search.index else {
            return Ok(None);
        };
        inline_value(self.bucket(source.load_page(files.tree, search.leaf())?).value(index))
            .map(Some)
    }

    /// Smallest key, if any.
    pub fn first_key(&self) -> Result<Option<KS::Value>, BTreeError> {
        self.read_committed(|cache, files| {
            let Some((page, index)) = self.first_item(cache, files.tree)? else {
                return Ok(None);
            };
            Ok(Some(self.bucket(cache.load_for_read(files.tree, page)?).key(index)))
        })
    }

    /// Largest key, if any.
    pub fn last_key(&self) -> Result<Option<KS::Value>, BTreeError> {
        self.read_committed(|cache, files| {
            let Some((page, index)) = self.last_item(cache, files.tree)? else {
                return Ok(None);
            };
            Ok(Some(self.bucket(cache.load_for_read(files.tree, page)?).key(index)))
        })
    }

    // Writes

    /// Store `value` under `key`, replacing any previous value.
    pub fn put(&self, key: KS::Value, value: VS::Value) -> Result<(), BTreeError> {
        self.run(|op| {
            self.update_inner(op, Some(key), |_| UpdateAction::Change(value), None)
                .map(drop)
        })
    }

    /// Store `value` under the null key.
    pub fn put_null(&self, value: VS::Value) -> Result<(), BTreeError> {
        self.run(|op| {
            self.update_inner(op, None, |_| UpdateAction::Change(value), None)
                .map(drop)
        })
    }

    /// [`Self::put`] inside a caller-owned operation; `None` is the null key.
    pub fn put_in(
        &self,
        op: &mut AtomicOperation,
        key: Option<KS::Value>,
        value: VS::Value,
    ) -> Result<(), BTreeError> {
        self.update_inner(op, key, |_| UpdateAction::Change(value), None)
            .map(drop)
            .map_err(|kind| self.error(kind))
    }

    /// Put that `validator` may veto. Returns whether the value was stored.
    pub fn validated_put(
        &self,
        key: Option<KS::Value>,
        value: VS::Value,
        validator: Validator<'_, KS::Value, VS::Value>,
    ) -> Result<bool, BTreeError> {
        self.run(|op| {
            self.update_inner(op, key, |_| UpdateAction::Change(value), Some(validator))
        })
    }

    /// [`Self::validated_put`] inside a caller-owned operation.
    pub fn validated_put_in(
        &self,
        op: &mut AtomicOperation,
        key: Option<KS::Value>,
        value: VS::Value,
        validator: Validator<'_, KS::Value, VS::Value>,
    ) -> Result<bool, BTreeError> {
        self.update_inner(op, key, |_| UpdateAction::Change(value), Some(validator))
            .map_err(|kind| self.error(kind))
    }

    /// Let `updater` decide, from the current value, what happens to `key`.
    /// Returns whether the tree changed.
    pub fn update(
        &self,
        key: Option<KS::Value>,
        updater: impl FnOnce(Option<&VS::Value>) -> UpdateAction<VS::Value>,
        validator: Option<Validator<'_, KS::Value, VS::Value>>,
    ) -> Result<bool, BTreeError> {
        self.run(|op| self.update_inner(op, key, updater, validator))
    }

    /// [`Self::update`] inside a caller-owned operation.
    pub fn update_in(
        &self,
        op: &mut AtomicOperation,
        key: Option<KS::Value>,
        updater: impl FnOnce(Option<&VS::Value>) -> UpdateAction<VS::Value>,
        validator: Option<Validator<'_, KS::Value, VS::Value>>,
    ) -> Result<bool, BTreeError> {
        self.update_inner(op, key, updater, validator)
            .map_err(|kind| self.error(kind))
    }

    fn update_inner(
        &self,
        op: &mut AtomicOperation,
        key: Option<KS::Value>,
        updater: impl FnOnce(Option<&VS::Value>) -> UpdateAction<VS::Value>,
        validator: Option<Validator<'_, KS::Value, VS::Value>>,
    ) -> Result<bool, BTreeErrorKind> {
        self.acquire_atomic_exclusive_lock(op);
        let files = self.files()?;
        match key {
            Some(key) => self.update_key(op, files.tree, key, updater, validator),
            None => self.update_null(op, files, updater, validator),
        }
    }

    fn update_key(
        &self,
        op: &mut AtomicOperation,
        tree: FileId,
        key: KS::Value,
        updater: impl FnOnce(Option<&VS::Value>) -> UpdateAction<VS::Value>,
        validator: Option<Validator<'_, KS::Value, VS::Value>>,
    ) -> Result<bool, BTreeErrorKind> {
        let key = self.preprocess(key);
        if key.has_sentinel() {
            return Err(BTreeErrorKind::SentinelKey);
        }
        let key_size = self.keys.object_size(&key);
        if key_size > self.max_key_size {
            return Err(BTreeErrorKind::KeyTooLarge {
                size: key_size,
                max: self.max_key_size,
            });
        }

        let BucketSearch { mut path, index } = self.find_bucket(&*op, tree, &key)?;
        let leaf = path.last().copied().unwrap_or(ROOT_INDEX);
        let old = match index {
            Ok(i) => Some(inline_value(
                self.bucket(op.load_for_read(tree, leaf)?).value(i),
            )?),
            Err(_) => None,
        };

        let value = match updater(old.as_ref()) {
            UpdateAction::Nothing => return Ok(false),
            UpdateAction::Remove => {
                return match index {
                    Ok(i) => self.remove_at(op, tree, leaf, i).map(|_| true),
                    Err(_) => Ok(false),
                };
            }
            UpdateAction::Change(value) => value,
        };
        if validator.is_some_and(|validate| {
            validate(Some(&key), old.as_ref(), &value) == Validation::Ignore
        }) {
            return Ok(false);
        }

        let entry_size = key_size + 1 + self.values.object_size(&value) + POSITION_SIZE;
        if entry_size > self.max_entry_size {
            return Err(BTreeErrorKind::EntryTooLarge {
                size: entry_size,
                max: self.max_entry_size,
            });
        }
        let raw_key = self.keys.serialize_to_vec(&key);
        let raw_value = self.values.serialize_to_vec(&value);

        let mut insertion = match index {
            Ok(i) => {
                let mut bucket = self.bucket(op.load_for_write(tree, leaf)?);
                if bucket.raw_value(i).len() == raw_value.len() {
                    bucket.update_value(i, &raw_value);
                    return Ok(true);
                }
                bucket.remove_leaf_entry(i);
                i
            }
            Err(i) => i,
        };

        let mut splits = 0;
        loop {
            let leaf = path.last().copied().unwrap_or(ROOT_INDEX);
            if self
                .bucket(op.load_for_write(tree, leaf)?)
                .add_leaf_entry(insertion, &raw_key, &raw_value)
            {
                break;
            }
            splits += 1;
            if splits > self.max_path_length {
                return Err(BTreeErrorKind::Corrupted);
            }
            (path, insertion) = self.split_bucket(op, tree, &path, insertion, &key)?;
        }

        if index.is_err() {
            self.update_size(op, tree, 1)?;
        }
        Ok(true)
    }

    fn update_null(
        &self,
        op: &mut AtomicOperation,
        files: Files,
        updater: impl FnOnce(Option<&VS::Value>) -> UpdateAction<VS::Value>,
        validator: Option<Validator<'_, KS::Value, VS::Value>>,
    ) -> Result<bool, BTreeErrorKind> {
        let null = files.null.ok_or(BTreeErrorKind::NullKeysNotSupported)?;
        let old = self.get_from(&*op, files, None)?;

        let value = match updater(old.as_ref()) {
            UpdateAction::Nothing => return Ok(false),
            UpdateAction::Remove => {
                return self.remove_null_value(op, files).map(|old| old.is_some());
            }
            UpdateAction::Change(value) => value,
        };
        if validator.is_some_and(|validate| validate(None, old.as_ref(), &value) == Validation::Ignore)
        {
            return Ok(false);
        }

        let size = self.values.object_size(&value);
        let max = self.page_size - null_bucket::VALUE_OFFSET;
        if size > max {
            return Err(BTreeErrorKind::EntryTooLarge { size, max });
        }
        let raw_value = self.values.serialize_to_vec(&value);

        let mut page = if op.filled_up_to(null)? == 0 {
            let (_, mut page) = op.add_page(null)?;
            NullBucket::new(&mut *page).init();
            page
        } else {
            op.load_for_write(null, 0)?
        };
        NullBucket::new(&mut *page).set_value(&raw_value);
        drop(page);

        if old.is_none() {
            self.update_size(op, files.tree, 1)?;
        }
        Ok(true)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &KS::Value) -> Result<Option<VS::Value>, BTreeError> {
        self.run(|op| self.remove_inner(op, Some(key)))
    }

    /// Remove the null key's value.
    pub fn remove_null(&self) -> Result<Option<VS::Value>, BTreeError> {
        self.run(|op| self.remove_inner(op, None))
    }

    /// [`Self::remove`] inside a caller-owned operation; `None` is the null
    /// key.
    pub fn remove_in(
        &self,
        op: &mut AtomicOperation,
        key: Option<&KS::Value>,
    ) -> Result<Option<VS::Value>, BTreeError> {
        self.remove_inner(op, key).map_err(|kind| self.error(kind))
    }

    fn remove_inner(
        &self,
        op: &mut AtomicOperation,
        key: Option<&KS::Value>,
    ) -> Result<Option<VS::Value>, BTreeErrorKind> {
        self.acquire_atomic_exclusive_lock(op);
        let files = self.files()?;
        let Some(key) = key else {
            return self.remove_null_value(op, files);
        };

        let key = self.preprocess(key.clone());
        let search = self.find_bucket(&*op, files.tree, &key)?;
        match search.index {
            Ok(index) => self
                .remove_at(op, files.tree, search.leaf(), index)
                .map(Some),
            Err(_) => Ok(None),
        }
    }

    fn remove_at(
        &self,
        op: &mut AtomicOperation,
        tree: FileId,
        leaf: PageIndex,
        index: usize,
    ) -> Result<VS::Value, BTreeErrorKind> {
        let value = {
            let mut bucket = self.bucket(op.load_for_write(tree, leaf)?);
            let value = inline_value(bucket.value(index))?;
            bucket.remove_leaf_entry(index);
            value
        };
        self.update_size(op, tree, -1)?;
        Ok(value)
    }

    fn remove_null_value(
        &self,
        op: &mut AtomicOperation,
        files: Files,
    ) -> Result<Option<VS::Value>, BTreeErrorKind> {
        let null = files.null.ok_or(BTreeErrorKind::NullKeysNotSupported)?;
        let Some(old) = self.get_from(&*op, files, None)? else {
            return Ok(None);
        };
        NullBucket::new(op.load_for_write(null, 0)?).remove_value();
        self.update_size(op, files.tree, -1)?;
        Ok(Some(old))
    }

    fn update_size(
        &self,
        op: &mut AtomicOperation,
        tree: FileId,
        delta: i64,
    ) -> Result<(), BTreeErrorKind> {
        let mut root = self.bucket(op.load_for_write(tree, ROOT_INDEX)?);
        let size = root.tree_size().saturating_add_signed(delta);
        root.set_tree_size(size);
        Ok(())
    }

    // Navigation

    /// Descend from the root to the leaf where `key` belongs.
    pub(super) fn find_bucket<S: PageSource + ?Sized>(
        &self,
        source: &S,
        tree: FileId,
        key: &KS::Value,
    ) -> Result<BucketSearch, BTreeErrorKind> {
        let mut path = Vec::new();
        let mut page_index = ROOT_INDEX;
        loop {
            if path.len() > self.max_path_length {
                return Err(BTreeErrorKind::Corrupted);
            }
            path.push(page_index);

            let bucket = self.bucket(source.load_page(tree, page_index)?);
            let found = bucket.find(key);
            if bucket.is_leaf() {
                return Ok(BucketSearch { path, index: found });
            }

            let size = bucket.size();
            if size == 0 {
                return Err(BTreeErrorKind::Inconsistent(format!(
                    "internal page {page_index} has no entries"
                )));
            }
            let index = match found {
                Ok(i) => i,
                Err(i) => i.min(size - 1),
            };
            page_index = if *key >= bucket.key(index) {
                bucket.right_child(index)
            } else {
                bucket.left_child(index)
            };
        }
    }

    /// Leaf page and index of the smallest key.
    pub(super) fn first_item<S: PageSource + ?Sized>(
        &self,
        source: &S,
        tree: FileId,
    ) -> Result<Option<(PageIndex, usize)>, BTreeErrorKind> {
        // (page, next child to visit)
        let mut stack = vec![(ROOT_INDEX, 0usize)];
        while let Some((page_index, child)) = stack.pop() {
            if stack.len() >= self.max_path_length {
                return Err(BTreeErrorKind::Corrupted);
            }
            let bucket = self.bucket(source.load_page(tree, page_index)?);
            if bucket.is_leaf() {
                if !bucket.is_empty() {
                    return Ok(Some((page_index, 0)));
                }
                continue;
            }
            if !bucket.is_empty() && child <= bucket.size() {
                stack.push((page_index, child + 1));
                stack.push((bucket.child(child), 0));
            }
        }
        Ok(None)
    }

    /// Leaf page and index of the largest key.
    pub(super) fn last_item<S: PageSource + ?Sized>(
        &self,
        source: &S,
        tree: FileId,
    ) -> Result<Option<(PageIndex, usize)>, BTreeErrorKind> {
        // (page, children already visited from the right)
        let mut stack = vec![(ROOT_INDEX, 0usize)];
        while let Some((page_index, visited)) = stack.pop() {
            if stack.len() >= self.max_path_length {
                return Err(BTreeErrorKind::Corrupted);
            }
            let bucket = self.bucket(source.load_page(tree, page_index)?);
            let size = bucket.size();
            if bucket.is_leaf() {
                if size > 0 {
                    return Ok(Some((page_index, size - 1)));
                }
                continue;
            }
            if size > 0 && visited <= size {
                stack.push((page_index, visited + 1));
                stack.push((bucket.child(size - visited), 0));
            }
        }
        Ok(None)
    }

    // Splits

    /// Split the page at the end of `path`, which has no room for `key` at
    /// `key_index`. Returns the path to the page that should now take the
    /// key, and the key's index in it.
    fn split_bucket(
        &self,
        op: &mut AtomicOperation,
        tree: FileId,
        path: &[PageIndex],
        key_index: usize,
        key: &KS::Value,
    ) -> Result<(Vec<PageIndex>, usize), BTreeErrorKind> {
        let Some((&page_index, parents)) = path.split_last() else {
            return Err(BTreeErrorKind::Inconsistent(
                "split of an empty path".to_string(),
            ));
        };

        let split = {
            let bucket = self.bucket(op.load_for_read(tree, page_index)?);
            let size = bucket.size();
            let is_leaf = bucket.is_leaf();
            let split_index = size / 2;
            let right_start = if is_leaf { split_index } else { split_index + 1 };
            Split {
                page_index,
                is_leaf,
                split_index,
                separator: bucket.key(split_index),
                raw_separator: bucket.raw_key(split_index),
                left_entries: (0..split_index).map(|i| bucket.raw_entry(i)).collect(),
                right_entries: (right_start..size).map(|i| bucket.raw_entry(i)).collect(),
                right_sibling: bucket.right_sibling(),
                tree_size: bucket.tree_size(),
            }
        };
        tracing::debug!(
            tree = %self.name,
            page = page_index,
            leaf = split.is_leaf,
            split_index = split.split_index,
            "splitting page"
        );

        let (mut result, left, right) = if page_index == ROOT_INDEX {
            let (left, right) = self.split_root(op, tree, &split)?;
            (vec![ROOT_INDEX], left, right)
        } else {
            let right = self.split_non_root(op, tree, parents, &split)?;
            (right.0, page_index, right.1)
        };

        if *key < split.separator {
            result.push(left);
            Ok((result, key_index))
        } else {
            let index = key_index.checked_sub(split.right_start()).ok_or_else(|| {
                BTreeErrorKind::Inconsistent(format!(
                    "key index {key_index} is left of split point {}",
                    split.split_index
                ))
            })?;
            result.push(right);
            Ok((result, index))
        }
    }

    /// Move the upper half of a non-root page into a new right page and
    /// register it with the parent. Returns the parent's path and the new
    /// page.
    fn split_non_root(
        &self,
        op: &mut AtomicOperation,
        tree: FileId,
        parents: &[PageIndex],
        split: &Split<KS::Value>,
    ) -> Result<(Vec<PageIndex>, PageIndex), BTreeErrorKind> {
        let (right_index, mut page) = op.add_page(tree)?;
        {
            let mut right = self.bucket(&mut *page);
            right.init(split.is_leaf);
            if split.is_leaf {
                right.set_left_sibling(Some(split.page_index));
                right.set_right_sibling(split.right_sibling);
            }
            right.add_all(&split.right_entries);
        }
        drop(page);

        {
            let mut left = self.bucket(op.load_for_write(tree, split.page_index)?);
            left.shrink(split.split_index);
            if split.is_leaf {
                left.set_right_sibling(Some(right_index));
            }
        }
        if let (true, Some(next)) = (split.is_leaf, split.right_sibling) {
            self.bucket(op.load_for_write(tree, next)?)
                .set_left_sibling(Some(right_index));
        }

        let mut parent_path = parents.to_vec();
        loop {
            let parent_index = *parent_path.last().ok_or_else(|| {
                BTreeErrorKind::Inconsistent("non-root page without a parent".to_string())
            })?;
            let (inserted, insertion) = {
                let mut parent = self.bucket(op.load_for_write(tree, parent_index)?);
                let (Ok(insertion) | Err(insertion)) = parent.find(&split.separator);
                let inserted = parent.add_non_leaf_entry(
                    insertion,
                    &split.raw_separator,
                    split.page_index,
                    right_index,
                    true,
                );
                (inserted, insertion)
            };
            if inserted {
                return Ok((parent_path, right_index));
            }
            (parent_path, _) =
                self.split_bucket(op, tree, &parent_path, insertion, &split.separator)?;
        }
    }

    /// Move the root's entries into two new pages and turn the root into an
    /// internal page over them. Returns the new left and right pages.
    fn split_root(
        &self,
        op: &mut AtomicOperation,
        tree: FileId,
        split: &Split<KS::Value>,
    ) -> Result<(PageIndex, PageIndex), BTreeErrorKind> {
        let (left_index, mut left_page) = op.add_page(tree)?;
        let (right_index, mut right_page) = op.add_page(tree)?;
        {
            let mut left = self.bucket(&mut *left_page);
            left.init(split.is_leaf);
            left.add_all(&split.left_entries);
            let mut right = self.bucket(&mut *right_page);
            right.init(split.is_leaf);
            right.add_all(&split.right_entries);
            if split.is_leaf {
                left.set_right_sibling(Some(right_index));
                right.set_left_sibling(Some(left_index));
            }
        }
        drop(left_page);
        drop(right_page);

        let mut root = self.bucket(op.load_for_write(tree, ROOT_INDEX)?);
        root.init(false);
        root.set_tree_size(split.tree_size);
        if !root.add_non_leaf_entry(0, &split.raw_separator, left_index, right_index, true) {
            return Err(BTreeErrorKind::Inconsistent(
                "separator does not fit an empty root".to_string(),
            ));
        }
        Ok((left_index, right_index))
    }

    // Cursors

    /// Entries with keys below `key` (or equal, with `inclusive`).
    pub fn iterate_entries_minor(
        &self,
        key: &KS::Value,
        inclusive: bool,
        ascending: bool,
    ) -> Result<EntryCursor<'_, KS, VS>, BTreeError> {
        let bounds = Bounds {
            from: None,
            from_inclusive: true,
            to: Some(self.range_key(key, upper_bound_mode(inclusive))),
            to_inclusive: inclusive,
        };
        self.entry_cursor(bounds, ascending)
    }

    /// Entries with keys above `key` (or equal, with `inclusive`).
    pub fn iterate_entries_major(
        &self,
        key: &KS::Value,
        inclusive: bool,
        ascending: bool,
    ) -> Result<EntryCursor<'_, KS, VS>, BTreeError> {
        let bounds = Bounds {
            from: Some(self.range_key(key, lower_bound_mode(inclusive))),
            from_inclusive: inclusive,
            to: None,
            to_inclusive: true,
        };
        self.entry_cursor(bounds, ascending)
    }

    /// Entries with keys between `from` and `to`.
    pub fn iterate_entries_between(
        &self,
        from: &KS::Value,
        from_inclusive: bool,
        to: &KS::Value,
        to_inclusive: bool,
        ascending: bool,
    ) -> Result<EntryCursor<'_, KS, VS>, BTreeError> {
        let bounds = Bounds {
            from: Some(self.range_key(from, lower_bound_mode(from_inclusive))),
            from_inclusive,
            to: Some(self.range_key(to, upper_bound_mode(to_inclusive))),
            to_inclusive,
        };
        self.entry_cursor(bounds, ascending)
    }

    /// Every key in ascending order.
    pub fn key_cursor(&self) -> Result<KeyCursor<'_, KS, VS>, BTreeError> {
        self.files().map_err(|kind| self.error(kind))?;
        Ok(KeyCursor::new(ForwardCursor::new(self, Bounds::unbounded())))
    }

    fn entry_cursor(
        &self,
        bounds: Bounds<KS::Value>,
        ascending: bool,
    ) -> Result<EntryCursor<'_, KS, VS>, BTreeError> {
        self.files().map_err(|kind| self.error(kind))?;
        Ok(if ascending {
            EntryCursor::Forward(ForwardCursor::new(self, bounds))
        } else {
            EntryCursor::Backward(BackwardCursor::new(self, bounds))
        })
    }

    // Diagnostics

    /// Walk every page and verify the tree's structure.
    pub fn check_consistency(&self) -> Result<TreeStats, BTreeError> {
        self.read_committed(|cache, files| self.check_pages(cache, files))
    }

    fn check_pages(&self, cache: &PageCache, files: Files) -> Result<TreeStats, BTreeErrorKind> {
        let inconsistent = |message: String| Err(BTreeErrorKind::Inconsistent(message));
        let mut level = vec![ROOT_INDEX];
        let mut depth = 1;
        let mut pages = 0;
        loop {
            if depth > self.max_path_length {
                return Err(BTreeErrorKind::Corrupted);
            }
            pages += level.len();

            let mut children = Vec::new();
            let mut leaves = 0;
            let mut entries: u64 = 0;
            let mut previous: Option<KS::Value> = None;
            for (position, &page_index) in level.iter().enumerate() {
                let bucket = self.bucket(cache.load_for_read(files.tree, page_index)?);
                let size = bucket.size();
                for i in 0..size {
                    let key = bucket.key(i);
                    if previous.as_ref().is_some_and(|previous| *previous >= key) {
                        return inconsistent(format!(
                            "keys out of order at page {page_index}, entry {i}"
                        ));
                    }
                    previous = Some(key);
                }
                // Internal keys are only ordered within their page.
                if !bucket.is_leaf() {
                    previous = None;
                }

                if bucket.is_leaf() {
                    leaves += 1;
                    entries += size as u64;
                    let expected_left = position.checked_sub(1).map(|p| level[p]);
                    let expected_right = level.get(position + 1).copied();
                    if bucket.left_sibling() != expected_left
                        || bucket.right_sibling() != expected_right
                    {
                        return inconsistent(format!("broken sibling links at page {page_index}"));
                    }
                } else if size == 0 {
                    return inconsistent(format!("internal page {page_index} has no entries"));
                } else {
                    children.extend((0..=size).map(|c| bucket.child(c)));
                }
            }

            if leaves == 0 {
                level = children;
                depth += 1;
                continue;
            }
            if leaves != level.len() {
                return inconsistent(format!("leaves and internal pages mixed at depth {depth}"));
            }

            entries += match files.null {
                Some(null) if cache.filled_up_to(null)? > 0 => {
                    u64::from(NullBucket::new(cache.load_for_read(null, 0)?).has_value())
                }
                _ => 0,
            };
            let size = self
                .bucket(cache.load_for_read(files.tree, ROOT_INDEX)?)
                .tree_size();
            if size != entries {
                return inconsistent(format!("root counts {size} entries, leaves hold {entries}"));
            }
            return Ok(TreeStats {
                size,
                depth,
                pages,
                leaf_pages: leaves,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::key::{CompositeKey, KeyItem};
    use crate::serialization::{
        CompositeKeySerializer, IntegerSerializer, LongSerializer, StringSerializer,
        Utf8Serializer,
    };
    use crate::storage::MIN_PAGE_SIZE;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    type IntTree = SBTree<IntegerSerializer, LongSerializer>;

    fn small_config() -> IndexConfig {
        IndexConfig::default().with_page_size(MIN_PAGE_SIZE)
    }

    fn int_tree(storage: &Storage, options: TreeOptions) -> IntTree {
        let tree = SBTree::new(storage, "idx", IntegerSerializer, LongSerializer, options);
        tree.create().expect("create tree");
        tree
    }

    fn keys_of<I>(cursor: I) -> Vec<i32>
    where
        I: Iterator<Item = Result<(i32, i64), BTreeError>>,
    {
        cursor.map(|entry| entry.expect("cursor entry").0).collect()
    }

    /// Leaves reached through sibling links, starting at the leftmost one.
    fn leaf_chain(tree: &IntTree) -> Vec<PageIndex> {
        let files = tree.files().expect("open");
        let cache = tree.operations.cache();
        let mut page_index = ROOT_INDEX;
        loop {
            let bucket = tree.bucket(cache.load_for_read(files.tree, page_index).expect("load"));
            if bucket.is_leaf() {
                break;
            }
            page_index = bucket.child(0);
        }

        let mut chain = Vec::new();
        let mut current = Some(page_index);
        while let Some(index) = current {
            chain.push(index);
            current = tree
                .bucket(cache.load_for_read(files.tree, index).expect("load"))
                .right_sibling();
        }
        chain
    }

    #[test]
    fn test_put_get_range_and_remove() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());

        for key in 0..50 {
            tree.put(key, i64::from(key) * 10).expect("put");
        }
        assert_eq!(tree.get(&25).expect("get"), Some(250));
        assert_eq!(tree.size().expect("size"), 50);
        assert!(tree.check_consistency().expect("consistent").depth >= 2);

        let keys = keys_of(
            tree.iterate_entries_between(&10, true, &20, false, true)
                .expect("cursor"),
        );
        assert_eq!(keys, (10..20).collect::<Vec<_>>());

        for key in 0..25 {
            assert_eq!(tree.remove(&key).expect("remove"), Some(i64::from(key) * 10));
        }
        assert_eq!(tree.get(&10).expect("get"), None);
        assert_eq!(tree.size().expect("size"), 25);
        assert_eq!(tree.remove(&10).expect("remove missing"), None);
        tree.check_consistency().expect("consistent after removals");
    }

    #[test]
    fn test_empty_tree() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());

        assert_eq!(tree.size().expect("size"), 0);
        assert_eq!(tree.get(&1).expect("get"), None);
        assert_eq!(tree.first_key().expect("first"), None);
        assert_eq!(tree.last_key().expect("last"), None);
        assert!(keys_of(tree.iterate_entries_major(&0, true, true).expect("cursor")).is_empty());
        let stats = tree.check_consistency().expect("consistent");
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.pages, 1);
    }

    #[test]
    fn test_many_keys_build_three_levels_with_sibling_chain() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());

        for key in 0..3000 {
            tree.put(key, i64::from(key)).expect("put");
        }

        let stats = tree.check_consistency().expect("consistent");
        assert_eq!(stats.size, 3000);
        assert!(stats.depth >= 3, "depth {}", stats.depth);
        assert_eq!(leaf_chain(&tree).len(), stats.leaf_pages);

        let keys = keys_of(tree.iterate_entries_major(&0, true, true).expect("cursor"));
        assert_eq!(keys, (0..3000).collect::<Vec<_>>());
        assert_eq!(tree.first_key().expect("first"), Some(0));
        assert_eq!(tree.last_key().expect("last"), Some(2999));
    }

    #[test]
    fn test_removals_keep_sibling_chain_connected() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());

        for key in 0..3000 {
            tree.put(key, i64::from(key)).expect("put");
        }
        let leaves_before = leaf_chain(&tree).len();
        for key in 0..2980 {
            assert_eq!(tree.remove(&key).expect("remove"), Some(i64::from(key)));
        }

        let stats = tree.check_consistency().expect("consistent");
        assert_eq!(stats.size, 20);
        assert_eq!(leaf_chain(&tree).len(), leaves_before);
        assert_eq!(stats.leaf_pages, leaves_before);

        let ascending = keys_of(tree.iterate_entries_major(&i32::MIN, true, true).expect("cursor"));
        assert_eq!(ascending, (2980..3000).collect::<Vec<_>>());
        let descending =
            keys_of(tree.iterate_entries_minor(&i32::MAX, true, false).expect("cursor"));
        assert_eq!(descending, (2980..3000).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_descending_inserts() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());

        for key in (0..1000).rev() {
            tree.put(key, -i64::from(key)).expect("put");
        }
        tree.check_consistency().expect("consistent");
        for key in 0..1000 {
            assert_eq!(tree.get(&key).expect("get"), Some(-i64::from(key)));
        }
    }

    #[test]
    fn test_random_operations_match_model() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(7);

        let mut keys: Vec<i32> = (0..2000).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            let value = rng.random_range(0..1_000_000);
            tree.put(key, value).expect("put");
            model.insert(key, value);
        }
        for _ in 0..1500 {
            let key = rng.random_range(0..2500);
            if rng.random_bool(0.5) {
                assert_eq!(tree.remove(&key).expect("remove"), model.remove(&key));
            } else {
                let value = rng.random_range(0..1_000_000);
                tree.put(key, value).expect("put");
                model.insert(key, value);
            }
        }

        let stats = tree.check_consistency().expect("consistent");
        assert_eq!(stats.size, model.len() as u64);
        let entries: Vec<(i32, i64)> = tree
            .iterate_entries_major(&i32::MIN, true, true)
            .expect("cursor")
            .map(|entry| entry.expect("entry"))
            .collect();
        assert_eq!(entries, model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_variable_length_values() {
        let storage = Storage::in_memory(&small_config());
        let tree = SBTree::new(
            &storage,
            "strings",
            IntegerSerializer,
            StringSerializer,
            TreeOptions::default(),
        );
        tree.create().expect("create");

        for (key, len) in (0..200).zip((1..=5).cycle()) {
            tree.put(key, "x".repeat(len)).expect("put");
        }
        for key in (0..200).step_by(3) {
            tree.put(key, "y".repeat(10)).expect("grow value");
        }
        for key in (1..200).step_by(3) {
            tree.put(key, String::new()).expect("shrink value");
        }

        tree.check_consistency().expect("consistent");
        assert_eq!(tree.size().expect("size"), 200);
        assert_eq!(tree.get(&0).expect("get"), Some("y".repeat(10)));
        assert_eq!(tree.get(&1).expect("get"), Some(String::new()));
        assert_eq!(tree.get(&2).expect("get"), Some("xxx".to_string()));
    }

    #[test]
    fn test_null_key() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default().with_null_keys());

        assert_eq!(tree.get_null().expect("get"), None);
        tree.put_null(5).expect("put null");
        tree.put(1, 10).expect("put");
        assert_eq!(tree.get_null().expect("get"), Some(5));
        assert_eq!(tree.size().expect("size"), 2);

        tree.put_null(6).expect("overwrite null");
        assert_eq!(tree.size().expect("size"), 2);
        tree.check_consistency().expect("consistent");

        assert_eq!(tree.remove_null().expect("remove"), Some(6));
        assert_eq!(tree.remove_null().expect("remove again"), None);
        assert_eq!(tree.size().expect("size"), 1);
    }

    #[test]
    fn test_null_key_not_supported() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());

        let error = tree.put_null(1).expect_err("null put");
        assert!(matches!(error.kind, BTreeErrorKind::NullKeysNotSupported));
        assert_eq!(error.to_string(), "sbtree idx: Null keys are not supported.");
        assert!(tree.get_null().is_err());
        assert!(tree.remove_null().is_err());
    }

    #[test]
    fn test_composite_partial_ranges() {
        let storage = Storage::in_memory(&small_config());
        let tree = SBTree::new(
            &storage,
            "composite",
            CompositeKeySerializer,
            LongSerializer,
            TreeOptions::default().with_key_types(vec![KeyType::Integer, KeyType::String]),
        );
        tree.create().expect("create");

        for i in 0..10 {
            for j in 0..5 {
                let key = CompositeKey::new(vec![]).with(i).with(format!("k{j}"));
                tree.put(key, i64::from(i * 10 + j)).expect("put");
            }
        }

        let prefix = |i: i32| CompositeKey::new(vec![KeyItem::Integer(i)]);
        let values: Vec<i64> = tree
            .iterate_entries_between(&prefix(3), true, &prefix(5), false, true)
            .expect("cursor")
            .map(|entry| entry.expect("entry").1)
            .collect();
        assert_eq!(values, (30..35).chain(40..45).collect::<Vec<_>>());

        let values: Vec<i64> = tree
            .iterate_entries_between(&prefix(3), false, &prefix(5), true, true)
            .expect("cursor")
            .map(|entry| entry.expect("entry").1)
            .collect();
        assert_eq!(values, (40..45).chain(50..55).collect::<Vec<_>>());

        let first = tree
            .iterate_entries_minor(&prefix(5), true, false)
            .expect("cursor")
            .next()
            .expect("one entry")
            .expect("entry");
        assert_eq!(first.1, 54);

        // Long items are coerced to the declared Integer type.
        let key = CompositeKey::new(vec![]).with(2_i64).with("k1");
        assert_eq!(tree.get(&key).expect("get"), Some(21));
    }

    #[test]
    fn test_update_actions_and_validator() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());
        tree.put(1, 10).expect("put");

        let changed = tree
            .update(Some(1), |old| UpdateAction::Change(old.copied().unwrap_or(0) + 1), None)
            .expect("increment");
        assert!(changed);
        assert_eq!(tree.get(&1).expect("get"), Some(11));

        assert!(!tree.update(Some(1), |_| UpdateAction::Nothing, None).expect("nothing"));
        assert!(!tree.update(Some(2), |_| UpdateAction::Remove, None).expect("remove missing"));
        assert!(tree.update(Some(1), |_| UpdateAction::Remove, None).expect("remove"));
        assert_eq!(tree.size().expect("size"), 0);

        let only_increase: Validator<'_, i32, i64> = &|_, old, new| match old {
            Some(old) if new <= old => Validation::Ignore,
            _ => Validation::Accept,
        };
        assert!(tree.validated_put(Some(3), 30, only_increase).expect("first put"));
        assert!(!tree.validated_put(Some(3), 20, only_increase).expect("vetoed"));
        assert!(tree.validated_put(Some(3), 40, only_increase).expect("accepted"));
        assert_eq!(tree.get(&3).expect("get"), Some(40));
    }

    #[test]
    fn test_rollback_discards_changes() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());
        tree.put(1, 1).expect("put");

        let operations = storage.atomic_operations();
        let mut op = operations.start_atomic_operation();
        for key in 2..300 {
            tree.put_in(&mut op, Some(key), 2).expect("put in operation");
        }
        tree.remove_in(&mut op, Some(&1)).expect("remove in operation");
        assert_eq!(tree.get_in(&op, Some(&150)).expect("own write"), Some(2));
        assert_eq!(tree.get_in(&op, Some(&1)).expect("own removal"), None);
        operations
            .end_atomic_operation(op, true)
            .expect("rollback");

        assert_eq!(tree.get(&150).expect("get"), None);
        assert_eq!(tree.get(&1).expect("get"), Some(1));
        let stats = tree.check_consistency().expect("consistent");
        assert_eq!(stats.size, 1);
        assert_eq!(stats.depth, 1);
    }

    #[test]
    fn test_failed_put_rolls_back() {
        let storage = Storage::in_memory(&small_config());
        let tree = SBTree::new(
            &storage,
            "strings",
            StringSerializer,
            LongSerializer,
            TreeOptions::default(),
        );
        tree.create().expect("create");

        let key = "k".repeat(60);
        let size = StringSerializer.object_size(&key);
        let error = tree.put(key, 1).expect_err("key too large");
        assert_eq!(
            error.kind.to_string(),
            format!(
                "Key size is more than allowed, operation was canceled. Current key size {size}, allowed {}",
                tree.max_key_size()
            )
        );
        assert_eq!(tree.size().expect("size"), 0);
    }

    #[test]
    fn test_key_too_large() {
        let storage = Storage::in_memory(&small_config());
        let tree = SBTree::new(
            &storage,
            "names",
            Utf8Serializer,
            LongSerializer,
            TreeOptions::default(),
        );
        tree.create().expect("create");

        // Longer than a UTF-8 string can encode at all.
        let key = "a".repeat(70_000);
        let error = tree.put(key.clone(), 1).expect_err("key too large");
        assert!(matches!(
            error.kind,
            BTreeErrorKind::KeyTooLarge { size: 70_002, max } if max == tree.max_key_size()
        ));
        assert_eq!(tree.get(&key).expect("get"), None);

        let key = "a".repeat(tree.max_key_size());
        let error = tree.put(key, 1).expect_err("key too large");
        assert!(matches!(error.kind, BTreeErrorKind::KeyTooLarge { .. }));
        assert_eq!(tree.size().expect("size"), 0);
    }

    #[test]
    fn test_value_too_large_for_utf8() {
        let storage = Storage::in_memory(&small_config());
        let tree = SBTree::new(
            &storage,
            "notes",
            IntegerSerializer,
            Utf8Serializer,
            TreeOptions::default().with_null_keys(),
        );
        tree.create().expect("create");

        let value = "v".repeat(70_000);
        let error = tree.put(1, value.clone()).expect_err("entry too large");
        assert!(matches!(
            error.kind,
            BTreeErrorKind::EntryTooLarge { size: 70_011, .. }
        ));
        let error = tree.put_null(value).expect_err("null value too large");
        assert!(matches!(error.kind, BTreeErrorKind::EntryTooLarge { size: 70_002, .. }));
        assert_eq!(tree.size().expect("size"), 0);
    }

    #[test]
    fn test_sentinel_keys_are_rejected() {
        let storage = Storage::in_memory(&small_config());
        let tree = SBTree::new(
            &storage,
            "composite",
            CompositeKeySerializer,
            LongSerializer,
            TreeOptions::default().with_key_types(vec![KeyType::Integer, KeyType::Integer]),
        );
        tree.create().expect("create");

        let upper = CompositeKey::new(vec![KeyItem::Integer(1), KeyItem::AlwaysGreater]);
        let lower = CompositeKey::new(vec![KeyItem::AlwaysLess]);

        let error = tree.put(upper.clone(), 1).expect_err("sentinel key");
        assert!(matches!(error.kind, BTreeErrorKind::SentinelKey));
        let error = tree
            .update(Some(lower), |_| UpdateAction::Change(2), None)
            .expect_err("sentinel key");
        assert!(matches!(error.kind, BTreeErrorKind::SentinelKey));
        let accept: Validator<'_, CompositeKey, i64> = &|_, _, _| Validation::Accept;
        let error = tree
            .validated_put(Some(upper.clone()), 3, accept)
            .expect_err("sentinel key");
        assert!(matches!(error.kind, BTreeErrorKind::SentinelKey));

        assert_eq!(tree.size().expect("size"), 0);
        assert_eq!(tree.get(&upper).expect("get"), None);
        tree.put(CompositeKey::new(vec![]).with(1).with(2), 12)
            .expect("plain key");
        assert_eq!(tree.size().expect("size"), 1);
    }

    #[test]
    fn test_descent_past_max_path_length_is_corruption() {
        let config = IndexConfig {
            max_path_length: 1,
            ..small_config()
        };
        let storage = Storage::in_memory(&config);
        let tree = int_tree(&storage, TreeOptions::default());

        let mut failure = None;
        for key in 0..3000 {
            if let Err(e) = tree.put(key, i64::from(key)) {
                failure = Some((key, e));
                break;
            }
        }
        let (key, error) = failure.expect("tree outgrew the path limit");
        assert!(matches!(error.kind, BTreeErrorKind::Corrupted));
        assert_eq!(
            error.kind.to_string(),
            "We reached max level of depth of SBTree but still found nothing, seems like tree is in corrupted state. You should rebuild index related to given query."
        );

        let error = tree.get(&0).expect_err("descent fails");
        assert!(matches!(error.kind, BTreeErrorKind::Corrupted));
        assert_eq!(tree.size().expect("size"), u64::try_from(key).expect("non-negative"));
    }

    #[test]
    fn test_entry_too_large() {
        let storage = Storage::in_memory(&small_config());
        let tree = SBTree::new(
            &storage,
            "strings",
            IntegerSerializer,
            StringSerializer,
            TreeOptions::default(),
        );
        tree.create().expect("create");

        let error = tree.put(1, "v".repeat(200)).expect_err("entry too large");
        assert!(matches!(error.kind, BTreeErrorKind::EntryTooLarge { .. }));
        assert_eq!(tree.get(&1).expect("get"), None);
    }

    #[test]
    fn test_delete_requires_empty_tree() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default().with_null_keys());
        tree.put(1, 1).expect("put");

        let error = tree.delete().expect_err("not empty");
        assert_eq!(
            error.kind.to_string(),
            "Not empty index can not be deleted. Index has 1 records"
        );

        tree.remove(&1).expect("remove");
        tree.delete().expect("delete");
        assert_eq!(tree.state(), TreeState::Uncreated);
        assert!(!storage.cache().file_exists("idx.sbt"));
        assert!(!storage.cache().file_exists("idx.nbt"));

        tree.create().expect("create again");
        assert_eq!(tree.size().expect("size"), 0);
    }

    #[test]
    fn test_clear() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default().with_null_keys());
        for key in 0..500 {
            tree.put(key, 1).expect("put");
        }
        tree.put_null(1).expect("put null");

        tree.clear().expect("clear");
        assert_eq!(tree.size().expect("size"), 0);
        assert_eq!(tree.get(&10).expect("get"), None);
        assert_eq!(tree.get_null().expect("get null"), None);
        assert_eq!(tree.check_consistency().expect("consistent").pages, 1);

        tree.put(3, 3).expect("put after clear");
        assert_eq!(tree.get(&3).expect("get"), Some(3));
    }

    #[test]
    fn test_lifecycle_errors() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());
        assert!(tree.is_open());
        assert!(matches!(
            tree.create().expect_err("open tree").kind,
            BTreeErrorKind::AlreadyExists
        ));

        tree.put(1, 1).expect("put");
        tree.close().expect("close");
        assert_eq!(tree.state(), TreeState::Closed);
        assert!(matches!(tree.get(&1).expect_err("closed").kind, BTreeErrorKind::NotOpen));
        assert!(matches!(tree.put(2, 2).expect_err("closed").kind, BTreeErrorKind::NotOpen));
        assert!(matches!(tree.close().expect_err("closed").kind, BTreeErrorKind::NotOpen));
        assert!(matches!(
            tree.create().expect_err("files exist").kind,
            BTreeErrorKind::AlreadyExists
        ));

        tree.load().expect("load");
        tree.load().expect("load is idempotent");
        assert_eq!(tree.get(&1).expect("get"), Some(1));

        let never_created = SBTree::new(
            &storage,
            "missing",
            IntegerSerializer,
            LongSerializer,
            TreeOptions::default(),
        );
        assert!(matches!(
            never_created.load().expect_err("no files").kind,
            BTreeErrorKind::Storage(StorageError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_load_rejects_other_key_serializer() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());
        tree.close().expect("close");

        let wrong = SBTree::new(
            &storage,
            "idx",
            StringSerializer,
            LongSerializer,
            TreeOptions::default(),
        );
        assert!(matches!(
            wrong.load().expect_err("wrong serializer").kind,
            BTreeErrorKind::Inconsistent(_)
        ));
    }

    #[test]
    fn test_reopen_from_disk_with_recovery() {
        let dir = tempdir().expect("create temp dir");
        {
            let storage = Storage::open(dir.path(), &small_config()).expect("open");
            let tree = int_tree(&storage, TreeOptions::default().with_null_keys());
            for key in 0..400 {
                tree.put(key, i64::from(key) + 1).expect("put");
            }
            tree.put_null(-1).expect("put null");
            storage.flush().expect("flush");
            for key in 400..600 {
                tree.put(key, i64::from(key) + 1).expect("put");
            }
            // Dropped without flushing: the last puts live only in the log.
        }

        let storage = Storage::open(dir.path(), &small_config()).expect("reopen");
        let tree = SBTree::new(
            &storage,
            "idx",
            IntegerSerializer,
            LongSerializer,
            TreeOptions::default().with_null_keys(),
        );
        tree.load().expect("load");
        let stats = tree.check_consistency().expect("consistent");
        assert_eq!(stats.size, 601);
        assert_eq!(tree.get(&599).expect("get"), Some(600));
        assert_eq!(tree.get_null().expect("get null"), Some(-1));
    }

    #[test]
    fn test_concurrent_writers() {
        let storage = Storage::in_memory(&small_config());
        let tree = int_tree(&storage, TreeOptions::default());

        std::thread::scope(|scope| {
            for thread in 0..4 {
                let tree = &tree;
                scope.spawn(move || {
                    for i in 0..250 {
                        let key = i * 4 + thread;
                        tree.put(key, i64::from(key)).expect("put");
                        assert_eq!(tree.get(&key).expect("get"), Some(i64::from(key)));
                    }
                });
            }
        });

        let stats = tree.check_consistency().expect("consistent");
        assert_eq!(stats.size, 1000);
    }
}
