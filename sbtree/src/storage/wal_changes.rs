//! Byte-range change sets for one page.
//!
//! A [`WalChanges`] is the difference between two images of the same page,
//! stored as a sorted set of non-overlapping patches. It is what the
//! write-ahead log records for each touched page, and what commit and
//! recovery apply to the cached image.
//!
//! # Format
//!
//! ```text
//! | patch count: u32 | (offset: u32, length: u32, bytes)* |
//! ```

// Patch offsets and lengths are bounded by the page size
#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use crate::storage::page::Page;

/// Gaps shorter than this between two changed runs are folded into one patch.
const MERGE_GAP: usize = 8;

/// Pending byte-range patches for a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalChanges {
    /// Patch start offset -> patch bytes. Patches never overlap or touch.
    patches: BTreeMap<usize, Vec<u8>>,
}

impl WalChanges {
    /// An empty change set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            patches: BTreeMap::new(),
        }
    }

    /// Compute the patches that turn `base` into `modified`.
    ///
    /// Both slices must have the same length.
    #[must_use]
    pub fn diff(base: &[u8], modified: &[u8]) -> Self {
        debug_assert_eq!(base.len(), modified.len());
        let mut changes = Self::new();
        let mut i = 0;
        while i < base.len() {
            if base[i] == modified[i] {
                i += 1;
                continue;
            }
            let start = i;
            let mut end = i + 1;
            let mut scan = end;
            while scan < base.len() && scan - end < MERGE_GAP {
                if base[scan] == modified[scan] {
                    scan += 1;
                } else {
                    scan += 1;
                    end = scan;
                }
            }
            changes.set_bytes(start, &modified[start..end]);
            i = end;
        }
        changes
    }

    /// Whether there are no patches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Number of patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Record `bytes` at `offset`, replacing anything previously recorded there.
    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let end = offset + bytes.len();

        // Collect patches that overlap or touch [offset, end).
        let touching: Vec<usize> = self
            .patches
            .range(..=end)
            .filter(|(start, data)| **start + data.len() >= offset)
            .map(|(start, _)| *start)
            .collect();

        let mut new_start = offset;
        let mut new_end = end;
        for start in &touching {
            if let Some(data) = self.patches.get(start) {
                new_start = new_start.min(*start);
                new_end = new_end.max(*start + data.len());
            }
        }

        let mut merged = vec![0u8; new_end - new_start];
        for start in touching {
            if let Some(data) = self.patches.remove(&start) {
                merged[start - new_start..start - new_start + data.len()].copy_from_slice(&data);
            }
        }
        merged[offset - new_start..end - new_start].copy_from_slice(bytes);
        self.patches.insert(new_start, merged);
    }

    /// Apply every patch to a page.
    pub fn apply_to(&self, page: &mut Page) {
        for (start, data) in &self.patches {
            page.write_bytes(*start, data);
        }
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        4 + self.patches.values().map(|data| 8 + data.len()).sum::<usize>()
    }

    /// Serialize the change set.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        bytes.extend_from_slice(&(self.patches.len() as u32).to_le_bytes());
        for (start, data) in &self.patches {
            bytes.extend_from_slice(&(*start as u32).to_le_bytes());
            bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
            bytes.extend_from_slice(data);
        }
        bytes
    }

    /// Deserialize a change set, returning it with the number of bytes consumed.
    ///
    /// Returns `None` if `bytes` is truncated.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<(Self, usize)> {
        let read_u32 = |at: usize| -> Option<usize> {
            let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
            usize::try_from(u32::from_le_bytes(raw)).ok()
        };

        let count = read_u32(0)?;
        let mut position = 4;
        let mut changes = Self::new();
        for _ in 0..count {
            let start = read_u32(position)?;
            let len = read_u32(position + 4)?;
            position += 8;
            let data = bytes.get(position..position + len)?;
            changes.patches.insert(start, data.to_vec());
            position += len;
        }
        Some((changes, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_diff_of_identical_pages_is_empty() {
        let page = vec![5u8; 64];
        assert!(WalChanges::diff(&page, &page).is_empty());
    }

    #[test]
    fn test_diff_merges_close_runs() {
        let base = vec![0u8; 64];
        let mut modified = base.clone();
        modified[10] = 1;
        modified[12] = 1;
        modified[40] = 1;

        let changes = WalChanges::diff(&base, &modified);
        assert_eq!(changes.len(), 2);

        let mut page = Page::from_bytes(&base);
        changes.apply_to(&mut page);
        assert_eq!(page.as_bytes(), modified.as_slice());
    }

    #[test]
    fn test_set_bytes_merges_overlaps() {
        let mut changes = WalChanges::new();
        changes.set_bytes(10, &[1, 1, 1, 1]);
        changes.set_bytes(12, &[2, 2, 2, 2]);
        changes.set_bytes(16, &[3]);
        assert_eq!(changes.len(), 1);

        let mut page = Page::from_bytes(&[0u8; 32]);
        changes.apply_to(&mut page);
        assert_eq!(&page.as_bytes()[9..18], &[0, 1, 1, 2, 2, 2, 2, 3, 0]);
    }

    #[test]
    fn test_bytes_roundtrip_and_truncation() {
        let mut changes = WalChanges::new();
        changes.set_bytes(3, b"abc");
        changes.set_bytes(100, b"xyz");
        let bytes = changes.to_bytes();
        assert_eq!(bytes.len(), changes.serialized_size());

        let (decoded, consumed) = WalChanges::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, changes);
        assert_eq!(consumed, bytes.len());

        assert!(WalChanges::from_bytes(&bytes[..bytes.len() - 1]).is_none());
    }

    proptest! {
        #[test]
        fn prop_diff_then_apply_reproduces_page(
            base in proptest::collection::vec(any::<u8>(), 128),
            edits in proptest::collection::vec((0usize..128, any::<u8>()), 0..32),
        ) {
            let mut modified = base.clone();
            for (offset, value) in edits {
                modified[offset] = value;
            }
            let changes = WalChanges::diff(&base, &modified);
            let mut page = Page::from_bytes(&base);
            changes.apply_to(&mut page);
            prop_assert_eq!(page.as_bytes(), modified.as_slice());
        }
    }
}
