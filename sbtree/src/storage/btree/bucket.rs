//! Bucket codec: the binary layout of one tree page.
//!
//! # Format
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 28 | Page header (magic, checksum, LSN) |
//! | 28 | 4 | Free pointer: start of the entry area |
//! | 32 | 4 | Entry count |
//! | 36 | 1 | Leaf flag |
//! | 37 | 8 | Left sibling (leaves only, -1 = none) |
//! | 45 | 8 | Right sibling (leaves only, -1 = none) |
//! | 53 | 8 | Tree size (root page only) |
//! | 61 | 1 | Key serializer tag |
//! | 62 | 1 | Value serializer tag |
//! | 63 | 8 | Free values list head (legacy, always -1) |
//! | 71 | 4 * n | Entry positions, in key order |
//! | ... | ... | Free space |
//! | free pointer | ... | Entries, growing back from the page end |
//!
//! Leaf entry: key, a discriminator byte (0 = inline value, 1 = link), then
//! the serialized value or an 8-byte page link.
//!
//! Internal entry: left child (8 bytes), right child (8 bytes), key.
//!
//! # Invariants
//!
//! - Positions are sorted by key.
//! - Free space is one gap between the positions array and the free pointer.
//! - In an internal page whose neighbours are kept in sync, the right child of
//!   entry `i` is the left child of entry `i + 1`.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)] // page offsets fit in i32, page indices in i64

use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};

use crate::serialization::BinarySerializer;
use crate::storage::{NEXT_FREE_POSITION, Page, PageIndex};

pub const FREE_POINTER_OFFSET: usize = NEXT_FREE_POSITION;
pub const SIZE_OFFSET: usize = FREE_POINTER_OFFSET + 4;
pub const IS_LEAF_OFFSET: usize = SIZE_OFFSET + 4;
pub const LEFT_SIBLING_OFFSET: usize = IS_LEAF_OFFSET + 1;
pub const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + 8;
pub const TREE_SIZE_OFFSET: usize = RIGHT_SIBLING_OFFSET + 8;
pub const KEY_SERIALIZER_OFFSET: usize = TREE_SIZE_OFFSET + 8;
pub const VALUE_SERIALIZER_OFFSET: usize = KEY_SERIALIZER_OFFSET + 1;
pub const FREE_VALUES_LIST_OFFSET: usize = VALUE_SERIALIZER_OFFSET + 1;
pub const POSITIONS_ARRAY_OFFSET: usize = FREE_VALUES_LIST_OFFSET + 8;

const POSITION_SIZE: usize = 4;
const CHILD_POINTER_SIZE: usize = 8;
const LINK_SIZE: usize = 8;

const INLINE_VALUE: u8 = 0;
const LINK_VALUE: u8 = 1;

/// Value slot of a leaf entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketValue<V> {
    /// Value stored in the entry itself.
    Inline(V),
    /// Page link to a value stored elsewhere.
    Link(u64),
}

/// A decoded bucket entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry<K, V> {
    Leaf {
        key: K,
        value: BucketValue<V>,
    },
    Internal {
        left_child: PageIndex,
        right_child: PageIndex,
        key: K,
    },
}

impl<K, V> BucketEntry<K, V> {
    /// The entry's key.
    #[must_use]
    pub const fn key(&self) -> &K {
        match self {
            Self::Leaf { key, .. } | Self::Internal { key, .. } => key,
        }
    }
}

/// A page viewed as a tree bucket.
///
/// `P` is anything that derefs to a [`Page`]: a plain reference, a cache read
/// guard, or an atomic operation's write guard. Mutating methods need `P` to
/// deref mutably. Dropping the bucket drops `P`, releasing a guard.
pub struct Bucket<'s, P, KS, VS> {
    page: P,
    keys: &'s KS,
    values: &'s VS,
}

fn sibling_from_raw(raw: i64) -> Option<PageIndex> {
    PageIndex::try_from(raw).ok()
}

fn sibling_to_raw(sibling: Option<PageIndex>) -> i64 {
    sibling.map_or(-1, |index| index as i64)
}

const fn position_offset(index: usize) -> usize {
    POSITIONS_ARRAY_OFFSET + index * POSITION_SIZE
}

const fn key_offset(position: usize, leaf: bool) -> usize {
    if leaf {
        position
    } else {
        position + 2 * CHILD_POINTER_SIZE
    }
}

impl<'s, P, KS, VS> Bucket<'s, P, KS, VS>
where
    P: Deref<Target = Page>,
    KS: BinarySerializer,
    KS::Value: Ord,
    VS: BinarySerializer,
{
    /// View `page` as a bucket.
    pub const fn new(page: P, keys: &'s KS, values: &'s VS) -> Self {
        Self { page, keys, values }
    }

    /// The underlying page.
    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Number of entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.page.read_i32(SIZE_OFFSET) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.page.read_u8(IS_LEAF_OFFSET) > 0
    }

    fn free_pointer(&self) -> usize {
        self.page.read_i32(FREE_POINTER_OFFSET) as usize
    }

    /// Bytes left between the positions array and the entry area.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.free_pointer()
            .saturating_sub(position_offset(self.size()))
    }

    fn position(&self, index: usize) -> usize {
        self.page.read_i32(position_offset(index)) as usize
    }

    fn key_size_at(&self, offset: usize) -> usize {
        self.keys.object_size_in_buffer(self.page.as_bytes(), offset)
    }

    fn entry_size(&self, position: usize) -> usize {
        if !self.is_leaf() {
            return 2 * CHILD_POINTER_SIZE + self.key_size_at(position + 2 * CHILD_POINTER_SIZE);
        }
        let key_size = self.key_size_at(position);
        let flag_offset = position + key_size;
        let value_size = if self.page.read_u8(flag_offset) == LINK_VALUE {
            LINK_SIZE
        } else {
            self.values
                .object_size_in_buffer(self.page.as_bytes(), flag_offset + 1)
        };
        key_size + 1 + value_size
    }

    /// Binary search for `key`.
    ///
    /// `Ok(index)` on an exact match, `Err(insertion_point)` otherwise.
    pub fn find(&self, key: &KS::Value) -> Result<usize, usize> {
        let mut low = 0;
        let mut high = self.size();
        while low < high {
            let mid = (low + high) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    /// Decode the key at `index`.
    pub fn key(&self, index: usize) -> KS::Value {
        let offset = key_offset(self.position(index), self.is_leaf());
        self.keys.deserialize(self.page.as_bytes(), offset)
    }

    /// Whether the leaf entry at `index` stores a link instead of a value.
    pub fn is_link(&self, index: usize) -> bool {
        let position = self.position(index);
        self.page.read_u8(position + self.key_size_at(position)) == LINK_VALUE
    }

    /// Decode the value of the leaf entry at `index`.
    pub fn value(&self, index: usize) -> BucketValue<VS::Value> {
        debug_assert!(self.is_leaf());
        let position = self.position(index);
        let flag_offset = position + self.key_size_at(position);
        if self.page.read_u8(flag_offset) == LINK_VALUE {
            BucketValue::Link(self.page.read_u64(flag_offset + 1))
        } else {
            BucketValue::Inline(self.values.deserialize(self.page.as_bytes(), flag_offset + 1))
        }
    }

    /// Left child of the internal entry at `index`.
    pub fn left_child(&self, index: usize) -> PageIndex {
        self.page.read_i64(self.position(index)) as PageIndex
    }

    /// Right child of the internal entry at `index`.
    pub fn right_child(&self, index: usize) -> PageIndex {
        self.page.read_i64(self.position(index) + CHILD_POINTER_SIZE) as PageIndex
    }

    /// The `index`-th of the `size + 1` children of an internal page.
    pub fn child(&self, index: usize) -> PageIndex {
        if index < self.size() {
            self.left_child(index)
        } else {
            self.right_child(index - 1)
        }
    }

    /// Decode the whole entry at `index`.
    pub fn entry(&self, index: usize) -> BucketEntry<KS::Value, VS::Value> {
        if self.is_leaf() {
            BucketEntry::Leaf {
                key: self.key(index),
                value: self.value(index),
            }
        } else {
            BucketEntry::Internal {
                left_child: self.left_child(index),
                right_child: self.right_child(index),
                key: self.key(index),
            }
        }
    }

    /// The encoded bytes of the entry at `index`.
    pub fn raw_entry(&self, index: usize) -> Vec<u8> {
        let position = self.position(index);
        self.page
            .read_bytes(position, self.entry_size(position))
            .to_vec()
    }

    /// The encoded key of the entry at `index`.
    pub fn raw_key(&self, index: usize) -> Vec<u8> {
        let offset = key_offset(self.position(index), self.is_leaf());
        self.page
            .read_bytes(offset, self.key_size_at(offset))
            .to_vec()
    }

    /// The encoded value (or link) of the leaf entry at `index`.
    pub fn raw_value(&self, index: usize) -> Vec<u8> {
        let position = self.position(index);
        let key_size = self.key_size_at(position);
        let start = position + key_size + 1;
        let end = position + self.entry_size(position);
        self.page.read_bytes(start, end - start).to_vec()
    }

    /// Live entry count of the whole tree. Only meaningful on the root.
    #[must_use]
    pub fn tree_size(&self) -> u64 {
        self.page.read_u64(TREE_SIZE_OFFSET)
    }

    #[must_use]
    pub fn left_sibling(&self) -> Option<PageIndex> {
        sibling_from_raw(self.page.read_i64(LEFT_SIBLING_OFFSET))
    }

    #[must_use]
    pub fn right_sibling(&self) -> Option<PageIndex> {
        sibling_from_raw(self.page.read_i64(RIGHT_SIBLING_OFFSET))
    }

    /// Type tag of the key serializer recorded in the header.
    #[must_use]
    pub fn key_serializer_id(&self) -> u8 {
        self.page.read_u8(KEY_SERIALIZER_OFFSET)
    }

    /// Type tag of the value serializer recorded in the header.
    #[must_use]
    pub fn value_serializer_id(&self) -> u8 {
        self.page.read_u8(VALUE_SERIALIZER_OFFSET)
    }
}

impl<P, KS, VS> Bucket<'_, P, KS, VS>
where
    P: DerefMut<Target = Page>,
    KS: BinarySerializer,
    KS::Value: Ord,
    VS: BinarySerializer,
{
    /// Reset the page to an empty bucket.
    pub fn init(&mut self, is_leaf: bool) {
        let page_size = self.page.size();
        self.set_free_pointer(page_size);
        self.set_size(0);
        self.page.write_u8(IS_LEAF_OFFSET, u8::from(is_leaf));
        self.page.write_i64(LEFT_SIBLING_OFFSET, -1);
        self.page.write_i64(RIGHT_SIBLING_OFFSET, -1);
        self.page.write_i64(TREE_SIZE_OFFSET, 0);
        self.page
            .write_u8(KEY_SERIALIZER_OFFSET, self.keys.id().as_u8());
        self.page
            .write_u8(VALUE_SERIALIZER_OFFSET, self.values.id().as_u8());
        self.page.write_i64(FREE_VALUES_LIST_OFFSET, -1);
    }

    fn set_free_pointer(&mut self, value: usize) {
        self.page.write_i32(FREE_POINTER_OFFSET, value as i32);
    }

    fn set_size(&mut self, value: usize) {
        self.page.write_i32(SIZE_OFFSET, value as i32);
    }

    fn set_position(&mut self, index: usize, value: usize) {
        self.page.write_i32(position_offset(index), value as i32);
    }

    pub fn set_tree_size(&mut self, size: u64) {
        self.page.write_u64(TREE_SIZE_OFFSET, size);
    }

    pub fn set_left_sibling(&mut self, sibling: Option<PageIndex>) {
        self.page
            .write_i64(LEFT_SIBLING_OFFSET, sibling_to_raw(sibling));
    }

    pub fn set_right_sibling(&mut self, sibling: Option<PageIndex>) {
        self.page
            .write_i64(RIGHT_SIBLING_OFFSET, sibling_to_raw(sibling));
    }

    fn set_left_child(&mut self, index: usize, child: PageIndex) {
        let position = self.position(index);
        self.page.write_i64(position, child as i64);
    }

    fn set_right_child(&mut self, index: usize, child: PageIndex) {
        let position = self.position(index);
        self.page
            .write_i64(position + CHILD_POINTER_SIZE, child as i64);
    }

    /// Make room for an `entry_size` byte entry at `index` and return where
    /// it starts, or `None` if the page is full.
    fn reserve(&mut self, index: usize, entry_size: usize) -> Option<usize> {
        let size = self.size();
        let free_pointer = self.free_pointer();
        if free_pointer < entry_size || free_pointer - entry_size < position_offset(size + 1) {
            return None;
        }
        if index < size {
            self.page.move_data(
                position_offset(index),
                position_offset(index + 1),
                (size - index) * POSITION_SIZE,
            );
        }
        let position = free_pointer - entry_size;
        self.set_free_pointer(position);
        self.set_position(index, position);
        self.set_size(size + 1);
        Some(position)
    }

    /// Insert a leaf entry at `index`. Returns `false`, leaving the page
    /// untouched, if the entry does not fit.
    pub fn add_leaf_entry(&mut self, index: usize, raw_key: &[u8], raw_value: &[u8]) -> bool {
        let Some(position) = self.reserve(index, raw_key.len() + 1 + raw_value.len()) else {
            return false;
        };
        self.page.write_bytes(position, raw_key);
        self.page.write_u8(position + raw_key.len(), INLINE_VALUE);
        self.page
            .write_bytes(position + raw_key.len() + 1, raw_value);
        true
    }

    /// Insert an internal entry at `index`. Returns `false`, leaving the page
    /// untouched, if the entry does not fit.
    ///
    /// With `update_neighbors`, the next entry's left child becomes
    /// `right_child` and the previous entry's right child becomes
    /// `left_child`.
    pub fn add_non_leaf_entry(
        &mut self,
        index: usize,
        raw_key: &[u8],
        left_child: PageIndex,
        right_child: PageIndex,
        update_neighbors: bool,
    ) -> bool {
        let entry_size = 2 * CHILD_POINTER_SIZE + raw_key.len();
        let Some(position) = self.reserve(index, entry_size) else {
            return false;
        };
        self.page.write_i64(position, left_child as i64);
        self.page
            .write_i64(position + CHILD_POINTER_SIZE, right_child as i64);
        self.page
            .write_bytes(position + 2 * CHILD_POINTER_SIZE, raw_key);

        let size = self.size();
        if update_neighbors && size > 1 {
            if index < size - 1 {
                self.set_left_child(index + 1, right_child);
            }
            if index > 0 {
                self.set_right_child(index - 1, left_child);
            }
        }
        true
    }

    /// Remove the entry at `index` and close the gap it leaves.
    fn remove_entry(&mut self, index: usize) {
        let position = self.position(index);
        let entry_size = self.entry_size(position);
        let size = self.size();

        if index + 1 < size {
            self.page.move_data(
                position_offset(index + 1),
                position_offset(index),
                (size - index - 1) * POSITION_SIZE,
            );
        }
        let size = size - 1;
        self.set_size(size);

        let free_pointer = self.free_pointer();
        if size > 0 && position > free_pointer {
            self.page
                .move_data(free_pointer, free_pointer + entry_size, position - free_pointer);
        }
        self.set_free_pointer(free_pointer + entry_size);

        for i in 0..size {
            let current = self.position(i);
            if current < position {
                self.set_position(i, current + entry_size);
            }
        }
    }

    /// Remove the leaf entry at `index`.
    pub fn remove_leaf_entry(&mut self, index: usize) {
        debug_assert!(self.is_leaf());
        self.remove_entry(index);
    }

    /// Remove the internal entry at `index`. With `prev_child`, the
    /// neighbours that pointed at the removed entry's children point at
    /// `prev_child` instead.
    pub fn remove_non_leaf_entry(&mut self, index: usize, prev_child: Option<PageIndex>) {
        debug_assert!(!self.is_leaf());
        self.remove_entry(index);
        if let Some(child) = prev_child {
            let size = self.size();
            if index > 0 {
                self.set_right_child(index - 1, child);
            }
            if index < size {
                self.set_left_child(index, child);
            }
        }
    }

    /// Overwrite the value of the leaf entry at `index` with a value of the
    /// same encoded length.
    pub fn update_value(&mut self, index: usize, raw_value: &[u8]) {
        let position = self.position(index);
        let flag_offset = position + self.key_size_at(position);
        debug_assert_eq!(
            self.entry_size(position),
            flag_offset - position + 1 + raw_value.len()
        );
        self.page.write_u8(flag_offset, INLINE_VALUE);
        self.page.write_bytes(flag_offset + 1, raw_value);
    }

    /// Keep only the first `new_size` entries, compacting the entry area.
    pub fn shrink(&mut self, new_size: usize) {
        let entries: Vec<Vec<u8>> = (0..new_size).map(|i| self.raw_entry(i)).collect();
        let page_size = self.page.size();
        self.set_free_pointer(page_size);
        self.set_size(0);
        self.add_all(&entries);
    }

    /// Append raw entries taken from another bucket of the same kind.
    ///
    /// The caller guarantees they fit.
    pub fn add_all(&mut self, entries: &[Vec<u8>]) {
        for entry in entries {
            let index = self.size();
            let reserved = self.reserve(index, entry.len());
            debug_assert!(reserved.is_some(), "entries must fit an empty bucket");
            if let Some(position) = reserved {
                self.page.write_bytes(position, entry);
            }
        }
    }
}
