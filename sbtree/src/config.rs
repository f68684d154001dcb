//! Index engine configuration.
//!
//! Every tunable has a default and can be overridden through an environment
//! variable.

use crate::storage::{DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};

/// Tunables shared by every tree of a storage instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Largest serialized key accepted by a tree.
    pub max_key_size: usize,
    /// Deepest root-to-leaf path before a tree is considered corrupted.
    pub max_path_length: usize,
    /// Entries fetched per cursor batch.
    pub prefetch_size: usize,
    /// Fsync the write-ahead log on every commit.
    pub wal_sync_on_commit: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            max_key_size: Self::DEFAULT_MAX_KEY_SIZE,
            max_path_length: Self::DEFAULT_MAX_PATH_LENGTH,
            prefetch_size: Self::DEFAULT_PREFETCH_SIZE,
            wal_sync_on_commit: false,
        }
    }
}

impl IndexConfig {
    /// Default page size.
    pub const DEFAULT_PAGE_SIZE: usize = DEFAULT_PAGE_SIZE;
    /// Default maximum key size (10KB).
    pub const DEFAULT_MAX_KEY_SIZE: usize = 10 * 1024;
    /// Default maximum tree depth.
    pub const DEFAULT_MAX_PATH_LENGTH: usize = 64;
    /// Default cursor batch size.
    pub const DEFAULT_PREFETCH_SIZE: usize = 10_000;

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SBTREE_PAGE_SIZE`: page size in bytes (default: `8192`, at least
    ///   `512`, a multiple of 8)
    /// - `SBTREE_MAX_KEY_SIZE`: largest key in bytes (default: `10240`)
    /// - `SBTREE_MAX_PATH_LENGTH`: deepest tree path (default: `64`)
    /// - `SBTREE_PREFETCH_SIZE`: cursor batch size (default: `10000`)
    /// - `SBTREE_WAL_SYNC_ON_COMMIT`: `true` or `false` (default: `false`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let page_size = load_usize(&lookup, "SBTREE_PAGE_SIZE", Self::DEFAULT_PAGE_SIZE)?;
        if page_size < MIN_PAGE_SIZE || page_size % 8 != 0 {
            return Err(ConfigError::InvalidValue {
                name: "SBTREE_PAGE_SIZE".to_string(),
                message: format!(
                    "{page_size} must be a multiple of 8 and at least {MIN_PAGE_SIZE}"
                ),
            });
        }

        let config = Self {
            page_size,
            max_key_size: load_usize(&lookup, "SBTREE_MAX_KEY_SIZE", Self::DEFAULT_MAX_KEY_SIZE)?,
            max_path_length: load_usize(
                &lookup,
                "SBTREE_MAX_PATH_LENGTH",
                Self::DEFAULT_MAX_PATH_LENGTH,
            )?,
            prefetch_size: load_usize(&lookup, "SBTREE_PREFETCH_SIZE", Self::DEFAULT_PREFETCH_SIZE)?,
            wal_sync_on_commit: load_bool(&lookup, "SBTREE_WAL_SYNC_ON_COMMIT")?,
        };

        for (name, value) in [
            ("SBTREE_MAX_KEY_SIZE", config.max_key_size),
            ("SBTREE_MAX_PATH_LENGTH", config.max_path_length),
            ("SBTREE_PREFETCH_SIZE", config.prefetch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(config)
    }

    /// Configuration with a different page size; handy for tests that need
    /// splits early.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

fn load_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid number"),
        }),
        None => Ok(default),
    }
}

fn load_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<bool, ConfigError> {
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(false),
        Some("true" | "1") => Ok(true),
        Some("false" | "0") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<IndexConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        IndexConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).expect("defaults");
        assert_eq!(config, IndexConfig::default());
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.max_key_size, 10240);
        assert_eq!(config.max_path_length, 64);
        assert_eq!(config.prefetch_size, 10_000);
        assert!(!config.wal_sync_on_commit);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SBTREE_PAGE_SIZE", "1024"),
            ("SBTREE_PREFETCH_SIZE", "16"),
            ("SBTREE_WAL_SYNC_ON_COMMIT", "true"),
        ])
        .expect("overrides");
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.prefetch_size, 16);
        assert!(config.wal_sync_on_commit);
    }

    #[test]
    fn test_invalid_page_size() {
        let error = load(&[("SBTREE_PAGE_SIZE", "100")]).expect_err("too small");
        assert!(matches!(error, ConfigError::InvalidValue { ref name, .. } if name == "SBTREE_PAGE_SIZE"));

        let error = load(&[("SBTREE_PAGE_SIZE", "abc")]).expect_err("not a number");
        assert_eq!(
            error.to_string(),
            "invalid value for SBTREE_PAGE_SIZE: 'abc' is not a valid number"
        );
    }

    #[test]
    fn test_invalid_bool_and_zero() {
        assert!(load(&[("SBTREE_WAL_SYNC_ON_COMMIT", "maybe")]).is_err());
        assert!(load(&[("SBTREE_PREFETCH_SIZE", "0")]).is_err());
    }
}
