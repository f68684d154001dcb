//! SBTree: a page-oriented B+-tree over the storage layer.
//!
//! # Structure
//!
//! - [`bucket`]: the byte layout of one tree page
//! - `null_bucket`: the single page that holds the null key's value
//! - [`SBTree`]: lifecycle, point operations and splits
//! - [`EntryCursor`] / [`KeyCursor`]: batched range scans over the leaf chain
//!
//! # Usage
//!
//! ```ignore
//! use sbtree::serialization::{IntegerSerializer, LongSerializer};
//! use sbtree::storage::Storage;
//! use sbtree::storage::btree::{SBTree, TreeOptions};
//!
//! let storage = Storage::in_memory(&config);
//! let tree = SBTree::new(&storage, "ages", IntegerSerializer, LongSerializer, TreeOptions::default());
//! tree.create()?;
//! tree.put(7, 70)?;
//! assert_eq!(tree.get(&7)?, Some(70));
//! for entry in tree.iterate_entries_between(&0, true, &10, false, true)? {
//!     let (key, value) = entry?;
//! }
//! ```

pub mod bucket;
mod cursor;
mod null_bucket;
mod tree;

pub use bucket::{Bucket, BucketEntry, BucketValue};
pub use cursor::{BackwardCursor, EntryCursor, ForwardCursor, KeyCursor};
pub use tree::{
    BTreeError, BTreeErrorKind, NULL_BUCKET_FILE_EXTENSION, SBTree, TREE_FILE_EXTENSION,
    TreeOptions, TreeState, TreeStats, UpdateAction, Validation, Validator,
};
