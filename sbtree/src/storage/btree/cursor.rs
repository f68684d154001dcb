//! Range cursors over the leaf chain.
//!
//! A cursor reads entries in batches of at most the configured prefetch size.
//! Each batch is read under the tree's shared lock; no page stays pinned
//! between batches. The cursor remembers the leaf, entry index and page LSN
//! where the batch stopped. If that page is unchanged when the next batch
//! starts, the scan picks up there. Otherwise it searches from the root for
//! the last key it returned.
//!
//! Cursors see committed entries only and give no snapshot across batches:
//! keys inserted ahead of the cursor may show up, keys removed ahead of it
//! do not.

use std::collections::VecDeque;

use crate::key::TreeKey;
use crate::serialization::BinarySerializer;
use crate::storage::btree::tree::{BTreeError, BTreeErrorKind, SBTree, inline_value};
use crate::storage::{FileId, Lsn, PageCache, PageIndex};

/// Key range of a cursor. A missing bound is open.
pub(super) struct Bounds<K> {
    pub from: Option<K>,
    pub from_inclusive: bool,
    pub to: Option<K>,
    pub to_inclusive: bool,
}

impl<K: Ord> Bounds<K> {
    pub const fn unbounded() -> Self {
        Self {
            from: None,
            from_inclusive: true,
            to: None,
            to_inclusive: true,
        }
    }

    fn above_lower(&self, key: &K) -> bool {
        match &self.from {
            None => true,
            Some(from) if self.from_inclusive => key >= from,
            Some(from) => key > from,
        }
    }

    fn below_upper(&self, key: &K) -> bool {
        match &self.to {
            None => true,
            Some(to) if self.to_inclusive => key <= to,
            Some(to) => key < to,
        }
    }
}

/// Where the previous batch stopped.
#[derive(Debug, Clone, Copy)]
struct Resume {
    page: PageIndex,
    index: usize,
    lsn: Lsn,
}

/// Load the resume page if it still exists and has not changed since.
fn still_valid(cache: &PageCache, file: FileId, resume: Resume) -> Result<bool, BTreeErrorKind> {
    if resume.page >= cache.filled_up_to(file)? {
        return Ok(false);
    }
    Ok(cache.load_for_read(file, resume.page)?.lsn() == resume.lsn)
}

/// Ascending cursor.
pub struct ForwardCursor<'t, KS, VS>
where
    KS: BinarySerializer,
    VS: BinarySerializer,
{
    tree: &'t SBTree<KS, VS>,
    bounds: Bounds<KS::Value>,
    batch: VecDeque<(KS::Value, VS::Value)>,
    resume: Option<Resume>,
    done: bool,
}

impl<'t, KS, VS> ForwardCursor<'t, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    pub(super) const fn new(tree: &'t SBTree<KS, VS>, bounds: Bounds<KS::Value>) -> Self {
        Self {
            tree,
            bounds,
            batch: VecDeque::new(),
            resume: None,
            done: false,
        }
    }

    /// Next entry, or `None` once the range is exhausted.
    pub fn try_advance(&mut self) -> Result<Option<(KS::Value, VS::Value)>, BTreeError> {
        if self.batch.is_empty() && !self.done {
            if let Err(kind) = self.fill() {
                self.done = true;
                return Err(self.tree.error(kind));
            }
        }
        let Some((key, value)) = self.batch.pop_front() else {
            return Ok(None);
        };
        self.bounds.from = Some(key.clone());
        self.bounds.from_inclusive = false;
        Ok(Some((key, value)))
    }

    fn start(
        &self,
        cache: &PageCache,
        file: FileId,
    ) -> Result<Option<(PageIndex, usize)>, BTreeErrorKind> {
        if let Some(resume) = self.resume {
            if still_valid(cache, file, resume)? {
                return Ok(Some((resume.page, resume.index)));
            }
        }
        match &self.bounds.from {
            None => self.tree.first_item(cache, file),
            Some(from) => {
                let search = self.tree.find_bucket(cache, file, from)?;
                let index = match search.index {
                    Ok(i) if self.bounds.from_inclusive => i,
                    Ok(i) => i + 1,
                    Err(i) => i,
                };
                Ok(Some((search.leaf(), index)))
            }
        }
    }

    fn fill(&mut self) -> Result<(), BTreeErrorKind> {
        let tree = self.tree;
        let _lock = tree.operations().acquire_read_lock(tree.name());
        let file = tree.files()?.tree;
        let cache: &PageCache = tree.operations().cache();

        let start = self.start(cache, file)?;
        self.resume = None;
        let Some((mut page_index, mut index)) = start else {
            self.done = true;
            return Ok(());
        };

        let limit = tree.prefetch_size().max(1);
        loop {
            let bucket = tree.bucket(cache.load_for_read(file, page_index)?);
            while index < bucket.size() {
                if self.batch.len() >= limit {
                    self.resume = Some(Resume {
                        page: page_index,
                        index,
                        lsn: bucket.page().lsn(),
                    });
                    return Ok(());
                }
                let key = bucket.key(index);
                if !self.bounds.below_upper(&key) {
                    self.done = true;
                    return Ok(());
                }
                let value = inline_value(bucket.value(index))?;
                self.batch.push_back((key, value));
                index += 1;
            }

            let Some(next) = bucket.right_sibling() else {
                self.done = true;
                return Ok(());
            };
            page_index = next;
            index = 0;
        }
    }
}

impl<KS, VS> Iterator for ForwardCursor<'_, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    type Item = Result<(KS::Value, VS::Value), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_advance().transpose()
    }
}

/// Descending cursor.
pub struct BackwardCursor<'t, KS, VS>
where
    KS: BinarySerializer,
    VS: BinarySerializer,
{
    tree: &'t SBTree<KS, VS>,
    bounds: Bounds<KS::Value>,
    batch: VecDeque<(KS::Value, VS::Value)>,
    /// `index` is one past the next entry to read.
    resume: Option<Resume>,
    done: bool,
}

impl<'t, KS, VS> BackwardCursor<'t, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    pub(super) const fn new(tree: &'t SBTree<KS, VS>, bounds: Bounds<KS::Value>) -> Self {
        Self {
            tree,
            bounds,
            batch: VecDeque::new(),
            resume: None,
            done: false,
        }
    }

    /// Next entry, or `None` once the range is exhausted.
    pub fn try_advance(&mut self) -> Result<Option<(KS::Value, VS::Value)>, BTreeError> {
        if self.batch.is_empty() && !self.done {
            if let Err(kind) = self.fill() {
                self.done = true;
                return Err(self.tree.error(kind));
            }
        }
        let Some((key, value)) = self.batch.pop_front() else {
            return Ok(None);
        };
        self.bounds.to = Some(key.clone());
        self.bounds.to_inclusive = false;
        Ok(Some((key, value)))
    }

    /// Leaf and exclusive end index of the scan.
    fn start(
        &self,
        cache: &PageCache,
        file: FileId,
    ) -> Result<Option<(PageIndex, usize)>, BTreeErrorKind> {
        if let Some(resume) = self.resume {
            if still_valid(cache, file, resume)? {
                return Ok(Some((resume.page, resume.index)));
            }
        }
        match &self.bounds.to {
            None => Ok(self
                .tree
                .last_item(cache, file)?
                .map(|(page, index)| (page, index + 1))),
            Some(to) => {
                let search = self.tree.find_bucket(cache, file, to)?;
                let end = match search.index {
                    Ok(i) if self.bounds.to_inclusive => i + 1,
                    Ok(i) | Err(i) => i,
                };
                Ok(Some((search.leaf(), end)))
            }
        }
    }

    fn fill(&mut self) -> Result<(), BTreeErrorKind> {
        let tree = self.tree;
        let _lock = tree.operations().acquire_read_lock(tree.name());
        let file = tree.files()?.tree;
        let cache: &PageCache = tree.operations().cache();

        let start = self.start(cache, file)?;
        self.resume = None;
        let Some((mut page_index, mut end)) = start else {
            self.done = true;
            return Ok(());
        };

        let limit = tree.prefetch_size().max(1);
        loop {
            let bucket = tree.bucket(cache.load_for_read(file, page_index)?);
            end = end.min(bucket.size());
            while end > 0 {
                if self.batch.len() >= limit {
                    self.resume = Some(Resume {
                        page: page_index,
                        index: end,
                        lsn: bucket.page().lsn(),
                    });
                    return Ok(());
                }
                let key = bucket.key(end - 1);
                if !self.bounds.above_lower(&key) {
                    self.done = true;
                    return Ok(());
                }
                let value = inline_value(bucket.value(end - 1))?;
                self.batch.push_back((key, value));
                end -= 1;
            }

            let Some(previous) = bucket.left_sibling() else {
                self.done = true;
                return Ok(());
            };
            page_index = previous;
            end = usize::MAX;
        }
    }
}

impl<KS, VS> Iterator for BackwardCursor<'_, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    type Item = Result<(KS::Value, VS::Value), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_advance().transpose()
    }
}

/// A cursor over a key range in either direction.
pub enum EntryCursor<'t, KS, VS>
where
    KS: BinarySerializer,
    VS: BinarySerializer,
{
    Forward(ForwardCursor<'t, KS, VS>),
    Backward(BackwardCursor<'t, KS, VS>),
}

impl<KS, VS> EntryCursor<'_, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    /// Next entry, or `None` once the range is exhausted.
    pub fn try_advance(&mut self) -> Result<Option<(KS::Value, VS::Value)>, BTreeError> {
        match self {
            Self::Forward(cursor) => cursor.try_advance(),
            Self::Backward(cursor) => cursor.try_advance(),
        }
    }

    /// Whether entries come in ascending key order.
    #[must_use]
    pub const fn is_ascending(&self) -> bool {
        matches!(self, Self::Forward(_))
    }

    /// Number of remaining entries; unknown without a full scan, so always
    /// `u64::MAX`.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub const fn estimated_size(&self) -> u64 {
        u64::MAX
    }
}

impl<KS, VS> Iterator for EntryCursor<'_, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    type Item = Result<(KS::Value, VS::Value), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_advance().transpose()
    }
}

/// Every key of a tree in ascending order.
pub struct KeyCursor<'t, KS, VS>
where
    KS: BinarySerializer,
    VS: BinarySerializer,
{
    entries: ForwardCursor<'t, KS, VS>,
}

impl<'t, KS, VS> KeyCursor<'t, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    pub(super) const fn new(entries: ForwardCursor<'t, KS, VS>) -> Self {
        Self { entries }
    }

    /// Next key, or `None` after the last one.
    pub fn try_advance(&mut self) -> Result<Option<KS::Value>, BTreeError> {
        Ok(self.entries.try_advance()?.map(|(key, _)| key))
    }
}

impl<KS, VS> Iterator for KeyCursor<'_, KS, VS>
where
    KS: BinarySerializer,
    KS::Value: TreeKey,
    VS: BinarySerializer,
{
    type Item = Result<KS::Value, BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_advance().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::serialization::{IntegerSerializer, LongSerializer};
    use crate::storage::btree::tree::TreeOptions;
    use crate::storage::{MIN_PAGE_SIZE, Storage};

    type IntTree = SBTree<IntegerSerializer, LongSerializer>;

    const PREFETCH: usize = 7;

    fn storage() -> Storage {
        let config = IndexConfig {
            prefetch_size: PREFETCH,
            ..IndexConfig::default().with_page_size(MIN_PAGE_SIZE)
        };
        Storage::in_memory(&config)
    }

    fn tree_with(storage: &Storage, keys: impl IntoIterator<Item = i32>) -> IntTree {
        let tree = SBTree::new(
            storage,
            "cursor",
            IntegerSerializer,
            LongSerializer,
            TreeOptions::default(),
        );
        tree.create().expect("create");
        for key in keys {
            tree.put(key, i64::from(key)).expect("put");
        }
        tree
    }

    fn keys_of<I>(cursor: I) -> Vec<i32>
    where
        I: Iterator<Item = Result<(i32, i64), BTreeError>>,
    {
        cursor.map(|entry| entry.expect("cursor entry").0).collect()
    }

    #[test]
    fn test_batches_cover_whole_range() {
        let storage = storage();
        let tree = tree_with(&storage, 0..1000);

        let ascending = keys_of(tree.iterate_entries_major(&0, true, true).expect("cursor"));
        assert_eq!(ascending, (0..1000).collect::<Vec<_>>());

        let descending = keys_of(tree.iterate_entries_minor(&999, true, false).expect("cursor"));
        assert_eq!(descending, (0..1000).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_bounds_and_inclusivity() {
        let storage = storage();
        let tree = tree_with(&storage, (0..200).map(|k| k * 2));

        let minor = keys_of(tree.iterate_entries_minor(&10, false, true).expect("cursor"));
        assert_eq!(minor, vec![0, 2, 4, 6, 8]);

        let minor = keys_of(tree.iterate_entries_minor(&10, true, false).expect("cursor"));
        assert_eq!(minor, vec![10, 8, 6, 4, 2, 0]);

        let major = keys_of(tree.iterate_entries_major(&390, false, false).expect("cursor"));
        assert_eq!(major, vec![398, 396, 394, 392]);

        let major = keys_of(tree.iterate_entries_major(&391, true, true).expect("cursor"));
        assert_eq!(major, vec![392, 394, 396, 398]);

        let between = keys_of(
            tree.iterate_entries_between(&100, false, &120, true, false)
                .expect("cursor"),
        );
        assert_eq!(between, vec![120, 118, 116, 114, 112, 110, 108, 106, 104, 102]);

        let empty = keys_of(
            tree.iterate_entries_between(&101, true, &101, true, true)
                .expect("cursor"),
        );
        assert!(empty.is_empty());
    }

    #[test]
    fn test_resume_point_kept_while_page_unchanged() {
        let storage = storage();
        let tree = tree_with(&storage, 0..100);

        let mut cursor = ForwardCursor::new(&tree, Bounds::unbounded());
        assert_eq!(cursor.try_advance().expect("advance").map(|e| e.0), Some(0));
        let resume = cursor.resume.expect("batch stopped early");
        assert_eq!(cursor.batch.len(), PREFETCH - 1);

        for _ in 1..PREFETCH {
            cursor.try_advance().expect("advance");
        }
        assert_eq!(cursor.try_advance().expect("advance").map(|e| e.0), Some(7));
        assert_ne!(cursor.resume.map(|r| (r.page, r.index)), Some((resume.page, resume.index)));
    }

    #[test]
    fn test_inserts_between_batches() {
        let storage = storage();
        let tree = tree_with(&storage, (0..500).map(|k| k * 2));

        let mut cursor = tree.iterate_entries_major(&0, true, true).expect("cursor");
        let mut seen = Vec::new();
        for _ in 0..PREFETCH {
            seen.push(cursor.try_advance().expect("advance").expect("entry").0);
        }
        for key in (0..500).map(|k| k * 2 + 1) {
            tree.put(key, i64::from(key)).expect("put odd key");
        }
        seen.extend(keys_of(cursor));

        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "keys repeat or go backwards");
        let last_before = 2 * (i32::try_from(PREFETCH).expect("small") - 1);
        let expected: Vec<i32> = (0..PREFETCH)
            .map(|k| i32::try_from(k).expect("small") * 2)
            .chain(last_before + 1..1000)
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_removals_between_batches() {
        let storage = storage();
        let tree = tree_with(&storage, 0..300);

        let mut cursor = tree.iterate_entries_minor(&299, true, false).expect("cursor");
        let mut seen = Vec::new();
        for _ in 0..PREFETCH {
            seen.push(cursor.try_advance().expect("advance").expect("entry").0);
        }
        for key in (0..280).filter(|k| k % 3 == 0) {
            tree.remove(&key).expect("remove");
        }
        seen.extend(keys_of(cursor));

        assert_eq!(&seen[..PREFETCH], &[299, 298, 297, 296, 295, 294, 293]);
        assert!(seen.windows(2).all(|pair| pair[0] > pair[1]));
        assert!(seen[PREFETCH..].iter().all(|key| key % 3 != 0 || *key >= 280));
        assert_eq!(seen.len(), PREFETCH + (0..293).filter(|k| k % 3 != 0 || *k >= 280).count());
    }

    #[test]
    fn test_cursor_flags_and_key_cursor() {
        let storage = storage();
        let tree = tree_with(&storage, 0..50);

        let ascending = tree.iterate_entries_major(&0, true, true).expect("cursor");
        assert!(ascending.is_ascending());
        assert_eq!(ascending.estimated_size(), u64::MAX);
        let descending = tree.iterate_entries_major(&0, true, false).expect("cursor");
        assert!(!descending.is_ascending());

        let keys: Vec<i32> = tree
            .key_cursor()
            .expect("key cursor")
            .map(|key| key.expect("key"))
            .collect();
        assert_eq!(keys, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_closed_tree_cursor_errors() {
        let storage = storage();
        let tree = tree_with(&storage, 0..20);
        let mut cursor = tree.key_cursor().expect("key cursor");
        tree.close().expect("close");

        let error = cursor.try_advance().expect_err("closed tree");
        assert!(matches!(error.kind, BTreeErrorKind::NotOpen));
        assert!(cursor.try_advance().expect("exhausted").is_none());
        assert!(tree.key_cursor().is_err());
    }
}
