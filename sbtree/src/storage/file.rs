//! Directory-backed page store.
//!
//! Each page file is an OS file inside the store directory. Page `n` lives at
//! byte offset `n * page_size`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::PageIndex;

/// A page store with one file per page file.
pub struct DiskStore {
    directory: PathBuf,
    page_size: usize,
    /// Open handles, keyed by file name.
    handles: Mutex<HashMap<String, File>>,
}

impl DiskStore {
    /// Open a store rooted at `directory`, creating the directory if needed.
    pub fn open(directory: &Path, page_size: usize) -> Result<Self, StorageError> {
        std::fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            page_size,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// The directory holding the page files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    /// Run `f` with an open handle for `name`, opening it on first use.
    fn with_handle<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut File) -> std::io::Result<R>,
    ) -> Result<R, StorageError> {
        let mut handles = self.handles.lock();
        if !handles.contains_key(name) {
            let path = self.path(name);
            if !path.exists() {
                return Err(StorageError::FileNotFound(name.to_string()));
            }
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            handles.insert(name.to_string(), file);
        }
        let file = handles
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(f(file)?)
    }

    fn page_offset(&self, index: PageIndex) -> u64 {
        index * self.page_size as u64
    }
}

impl PageStore for DiskStore {
    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn create(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name);
        if path.exists() {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.sync_all()?;
        self.handles.lock().insert(name.to_string(), file);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.handles.lock().remove(name);
        let path = self.path(name);
        if !path.exists() {
            return Err(StorageError::FileNotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn truncate(&self, name: &str) -> Result<(), StorageError> {
        self.with_handle(name, |file| {
            file.set_len(0)?;
            file.sync_all()
        })
    }

    fn page_count(&self, name: &str) -> Result<u64, StorageError> {
        let len = self.with_handle(name, |file| file.metadata().map(|m| m.len()))?;
        Ok(len / self.page_size as u64)
    }

    fn read_page(
        &self,
        name: &str,
        index: PageIndex,
        buffer: &mut [u8],
    ) -> Result<(), StorageError> {
        let offset = self.page_offset(index);
        self.with_handle(name, |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buffer)
        })
    }

    fn write_page(&self, name: &str, index: PageIndex, buffer: &[u8]) -> Result<(), StorageError> {
        let offset = self.page_offset(index);
        self.with_handle(name, |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buffer)
        })
    }

    fn sync(&self, name: &str) -> Result<(), StorageError> {
        self.with_handle(name, |file| file.sync_all())
    }

    fn close(&self, name: &str) -> Result<(), StorageError> {
        if let Some(file) = self.handles.lock().remove(name) {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    #[test]
    fn test_create_and_exists() {
        let dir = tempdir().expect("create temp dir");
        let store = DiskStore::open(dir.path(), PAGE).expect("open store");

        assert!(!store.exists("a.sbt"));
        store.create("a.sbt").expect("create");
        assert!(store.exists("a.sbt"));
        assert_eq!(store.page_count("a.sbt").expect("count"), 0);

        let result = store.create("a.sbt");
        assert!(matches!(result, Err(StorageError::FileAlreadyExists(_))));
    }

    #[test]
    fn test_write_and_read_pages() {
        let dir = tempdir().expect("create temp dir");
        let store = DiskStore::open(dir.path(), PAGE).expect("open store");
        store.create("a.sbt").expect("create");

        let mut page = vec![0u8; PAGE];
        page[..5].copy_from_slice(b"hello");
        store.write_page("a.sbt", 2, &page).expect("write");
        assert_eq!(store.page_count("a.sbt").expect("count"), 3);

        let mut read = vec![0u8; PAGE];
        store.read_page("a.sbt", 2, &mut read).expect("read");
        assert_eq!(&read[..5], b"hello");

        // The gap before page 2 reads back as zeros.
        store.read_page("a.sbt", 0, &mut read).expect("read");
        assert!(read.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().expect("create temp dir");
        {
            let store = DiskStore::open(dir.path(), PAGE).expect("open store");
            store.create("a.sbt").expect("create");
            store.write_page("a.sbt", 0, &[7u8; PAGE]).expect("write");
            store.close("a.sbt").expect("close");
        }

        let store = DiskStore::open(dir.path(), PAGE).expect("reopen store");
        let mut read = vec![0u8; PAGE];
        store.read_page("a.sbt", 0, &mut read).expect("read");
        assert!(read.iter().all(|b| *b == 7));
    }

    #[test]
    fn test_truncate_and_delete() {
        let dir = tempdir().expect("create temp dir");
        let store = DiskStore::open(dir.path(), PAGE).expect("open store");
        store.create("a.sbt").expect("create");
        store.write_page("a.sbt", 4, &[1u8; PAGE]).expect("write");

        store.truncate("a.sbt").expect("truncate");
        assert_eq!(store.page_count("a.sbt").expect("count"), 0);

        store.delete("a.sbt").expect("delete");
        assert!(!store.exists("a.sbt"));
        assert!(matches!(
            store.page_count("a.sbt"),
            Err(StorageError::FileNotFound(_))
        ));
    }
}
