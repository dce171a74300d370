//! Database configuration

use crate::error::Result;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

/// Database configuration, stored at `<dir>/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database directory; `None` keeps everything in memory.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    /// Revisions kept behind each winner by compaction.
    pub max_rev_tree_depth: u32,
    /// How long a writer waits for the write lock.
    pub write_timeout_ms: u64,
    /// Number of document handles kept in the LRU cache.
    pub document_cache_capacity: usize,
    /// Bodies at or above this many bytes are stored compressed.
    pub compress_threshold: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_rev_tree_depth: u32::MAX,
            write_timeout_ms: 30_000,
            document_cache_capacity: 100,
            compress_threshold: 64 * 1024,
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Default configuration for a database directory.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Load config from a database directory, falling back to defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let data = fs::read_to_string(&config_path).map_err(StorageError::from)?;
            serde_json::from_str::<DatabaseConfig>(&data).map_err(|e| {
                StorageError::Serialization(format!("Failed to parse {:?}: {}", config_path, e))
            })?
        } else {
            Self::default()
        };
        config.path = Some(dir.to_path_buf());
        Ok(config)
    }

    /// Save config into a database directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(StorageError::from)?;
        let config_path = dir.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self).map_err(StorageError::from)?;
        fs::write(&tmp_path, &data).map_err(StorageError::from)?;
        fs::rename(&tmp_path, &config_path).map_err(StorageError::from)?;
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Database name for a directory path: the last component without extension.
pub fn database_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert!(config.path.is_none());
        assert_eq!(config.max_rev_tree_depth, u32::MAX);
        assert_eq!(config.write_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig::load(dir.path()).unwrap();
        assert_eq!(config.path.as_deref(), Some(dir.path()));
        assert_eq!(config.document_cache_capacity, 100);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            max_rev_tree_depth: 20,
            write_timeout_ms: 500,
            ..DatabaseConfig::at(dir.path())
        };
        config.save(dir.path()).unwrap();
        let loaded = DatabaseConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"max_rev_tree_depth": 7}"#).unwrap();
        let config = DatabaseConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_rev_tree_depth, 7);
        assert_eq!(config.write_timeout_ms, 30_000);
    }

    #[test]
    fn test_database_name_from_path() {
        assert_eq!(database_name_from_path(Path::new("foo/bar/baz.cblite")), "baz");
        assert_eq!(database_name_from_path(Path::new("plain")), "plain");
    }
}
