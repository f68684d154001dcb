// Life of a write:
// 1. Caller starts (or joins) an atomic operation
// 2. Tree takes its exclusive component lock for the rest of the operation
// 3. Key is coerced, preprocessed and serialized; the tree descends to a leaf
// 4. Pages are copied into the operation and changed there, splitting as needed
// 5. Commit logs the byte-range changes, stamps a new LSN and installs the pages
//
// System components:
//  - Serializers and key ordering
//  - Page store, page cache, write-ahead log, atomic operations
//  - SBTree and its cursors

pub mod config;
pub mod key;
pub mod serialization;
pub mod storage;
