//! The single page that holds the value of the null key.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 28 | 1 | Has value |
//! | 29 | 1 | Value is a link |
//! | 30 | ... | Serialized value, or an 8-byte link |

use std::ops::{Deref, DerefMut};

use crate::serialization::BinarySerializer;
use crate::storage::btree::bucket::BucketValue;
use crate::storage::{NEXT_FREE_POSITION, Page};

const HAS_VALUE_OFFSET: usize = NEXT_FREE_POSITION;
const IS_LINK_OFFSET: usize = HAS_VALUE_OFFSET + 1;
pub(super) const VALUE_OFFSET: usize = IS_LINK_OFFSET + 1;

/// A page viewed as the null-key bucket.
pub struct NullBucket<P> {
    page: P,
}

impl<P: Deref<Target = Page>> NullBucket<P> {
    pub const fn new(page: P) -> Self {
        Self { page }
    }

    /// Whether a value is stored.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.page.read_u8(HAS_VALUE_OFFSET) > 0
    }

    /// The stored value, if any.
    pub fn value<VS: BinarySerializer>(&self, values: &VS) -> Option<BucketValue<VS::Value>> {
        if !self.has_value() {
            return None;
        }
        if self.page.read_u8(IS_LINK_OFFSET) > 0 {
            return Some(BucketValue::Link(self.page.read_u64(VALUE_OFFSET)));
        }
        Some(BucketValue::Inline(
            values.deserialize(self.page.as_bytes(), VALUE_OFFSET),
        ))
    }
}

impl<P: DerefMut<Target = Page>> NullBucket<P> {
    /// Reset to "no value".
    pub fn init(&mut self) {
        self.page.write_u8(HAS_VALUE_OFFSET, 0);
        self.page.write_u8(IS_LINK_OFFSET, 0);
    }

    /// Store a serialized value.
    pub fn set_value(&mut self, raw_value: &[u8]) {
        self.page.write_u8(HAS_VALUE_OFFSET, 1);
        self.page.write_u8(IS_LINK_OFFSET, 0);
        self.page.write_bytes(VALUE_OFFSET, raw_value);
    }

    /// Clear the stored value.
    pub fn remove_value(&mut self) {
        self.page.write_u8(HAS_VALUE_OFFSET, 0);
    }
}
