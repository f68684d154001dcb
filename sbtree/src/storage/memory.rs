//! In-memory page store for tests.
//!
//! Pages live in a map of per-file page vectors. Faults can be injected at the
//! read, write and sync level with configurable rates driven by a seeded RNG,
//! so a failing run can be replayed exactly.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::PageIndex;

/// Configuration for fault injection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
}

impl FaultConfig {
    /// No faults at all.
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Every write fails.
    #[must_use]
    pub const fn failing_writes() -> Self {
        Self {
            read_error_rate: 0.0,
            write_error_rate: 1.0,
            sync_error_rate: 0.0,
        }
    }
}

/// Statistics about store operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected faults of any kind.
    pub injected_faults: u64,
}

struct Inner {
    files: HashMap<String, Vec<Box<[u8]>>>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl Inner {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let hit = self.rng.random::<f64>() < rate;
        if hit {
            self.stats.injected_faults += 1;
        }
        hit
    }

    fn pages_mut(&mut self, name: &str) -> Result<&mut Vec<Box<[u8]>>, StorageError> {
        self.files
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }
}

/// A page store that keeps everything in memory.
pub struct MemoryStore {
    page_size: usize,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store without faults.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self::with_faults(page_size, FaultConfig::no_faults(), 0)
    }

    /// Create an empty store that injects faults using a seeded RNG.
    #[must_use]
    pub fn with_faults(page_size: usize, fault_config: FaultConfig, seed: u64) -> Self {
        Self {
            page_size,
            inner: Mutex::new(Inner {
                files: HashMap::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            }),
        }
    }

    /// Replace the fault configuration.
    pub fn set_fault_config(&self, fault_config: FaultConfig) {
        self.inner.lock().fault_config = fault_config;
    }

    /// Operation counters so far.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        self.inner.lock().stats
    }
}

impl PageStore for MemoryStore {
    fn exists(&self, name: &str) -> bool {
        self.inner.lock().files.contains_key(name)
    }

    fn create(&self, name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.files.contains_key(name) {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }
        inner.files.insert(name.to_string(), Vec::new());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }

    fn truncate(&self, name: &str) -> Result<(), StorageError> {
        self.inner.lock().pages_mut(name)?.clear();
        Ok(())
    }

    fn page_count(&self, name: &str) -> Result<u64, StorageError> {
        Ok(self.inner.lock().pages_mut(name)?.len() as u64)
    }

    fn read_page(
        &self,
        name: &str,
        index: PageIndex,
        buffer: &mut [u8],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.stats.reads += 1;
        let rate = inner.fault_config.read_error_rate;
        if inner.should_inject_fault(rate) {
            return Err(StorageError::InjectedFault(format!(
                "read of page {index} of {name}"
            )));
        }
        let pages = inner.pages_mut(name)?;
        let filled_up_to = pages.len() as u64;
        let page = usize::try_from(index)
            .ok()
            .and_then(|i| pages.get(i))
            .ok_or_else(|| StorageError::PageOutOfBounds {
                file: name.to_string(),
                page_index: index,
                filled_up_to,
            })?;
        buffer.copy_from_slice(page);
        Ok(())
    }

    fn write_page(&self, name: &str, index: PageIndex, buffer: &[u8]) -> Result<(), StorageError> {
        let page_size = self.page_size;
        let mut inner = self.inner.lock();
        inner.stats.writes += 1;
        let rate = inner.fault_config.write_error_rate;
        if inner.should_inject_fault(rate) {
            return Err(StorageError::InjectedFault(format!(
                "write of page {index} of {name}"
            )));
        }
        let pages = inner.pages_mut(name)?;
        let slot = usize::try_from(index).map_err(|_| StorageError::PageOutOfBounds {
            file: name.to_string(),
            page_index: index,
            filled_up_to: pages.len() as u64,
        })?;
        while pages.len() <= slot {
            pages.push(vec![0u8; page_size].into_boxed_slice());
        }
        pages[slot].copy_from_slice(buffer);
        Ok(())
    }

    fn sync(&self, name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.stats.syncs += 1;
        let rate = inner.fault_config.sync_error_rate;
        if inner.should_inject_fault(rate) {
            return Err(StorageError::InjectedFault(format!("sync of {name}")));
        }
        if inner.files.contains_key(name) {
            Ok(())
        } else {
            Err(StorageError::FileNotFound(name.to_string()))
        }
    }

    fn close(&self, _name: &str) -> Result<(), StorageError> {
        Ok(())
    }
}
