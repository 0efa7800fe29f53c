//! Configuration types for Cardvault
//!
//! Every section has working defaults so an absent or partial TOML file
//! still yields a usable configuration.

use crate::error::{Error, Result};
use crate::types::Namespace;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for Cardvault
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Persistent engine configuration
    pub storage: StorageConfig,
    /// Bulk dataset ingestion and query configuration
    pub dataset: DatasetConfig,
    /// TTL cache configuration
    pub cache: CacheConfig,
    /// Cleanup and quota guard configuration
    pub cleanup: CleanupConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the store unusable
    pub fn validate(&self) -> Result<()> {
        if self.storage.quota_bytes == 0 {
            return Err(Error::Configuration("storage.quota_bytes must be > 0".into()));
        }
        if self.storage.bytes_per_unit == 0 {
            return Err(Error::Configuration("storage.bytes_per_unit must be > 0".into()));
        }
        if self.dataset.chunk_size == 0 {
            return Err(Error::Configuration("dataset.chunk_size must be > 0".into()));
        }
        if self.dataset.write_concurrency == 0 {
            return Err(Error::Configuration(
                "dataset.write_concurrency must be > 0".into(),
            ));
        }
        if self.cleanup.reclaim_batch == 0 {
            return Err(Error::Configuration("cleanup.reclaim_batch must be > 0".into()));
        }
        Ok(())
    }
}

/// Persistent engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database file
    pub data_dir: PathBuf,
    /// Database file name inside `data_dir`
    pub db_file: String,
    /// Storage budget across all areas
    pub quota_bytes: u64,
    /// Estimated bytes of backing storage per serialized byte (usage reports)
    pub bytes_per_unit: u64,
}

impl StorageConfig {
    /// Full path of the database file
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cardvault-data"),
            db_file: "cardvault.redb".to_string(),
            quota_bytes: 64 * 1024 * 1024, // 64 MB
            bytes_per_unit: 1,
        }
    }
}

/// Bulk dataset configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Records per chunk
    pub chunk_size: usize,
    /// Concurrent chunk writes per window during ingest
    pub write_concurrency: usize,
    /// Pause between write windows (milliseconds)
    pub write_pause_ms: u64,
    /// Age after which the dataset is reported stale (days)
    pub freshness_days: u64,
    /// zstd compression level for chunk payloads
    pub compression_level: i32,
}

impl DatasetConfig {
    #[must_use]
    pub const fn write_pause(&self) -> Duration {
        Duration::from_millis(self.write_pause_ms)
    }

    #[must_use]
    pub const fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_days * 24 * 60 * 60)
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            write_concurrency: 10,
            write_pause_ms: 25,
            freshness_days: 7,
            compression_level: 3,
        }
    }
}

/// TTL cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL for price histories (seconds)
    pub price_history_ttl_secs: u64,
    /// Default TTL for identifier mappings (seconds)
    pub identifier_mapping_ttl_secs: u64,
    /// Default TTL for summary metadata (seconds)
    pub metadata_ttl_secs: u64,
}

impl CacheConfig {
    /// Default TTL for a namespace
    #[must_use]
    pub const fn ttl(&self, namespace: Namespace) -> Duration {
        let secs = match namespace {
            Namespace::PriceHistory => self.price_history_ttl_secs,
            Namespace::IdentifierMapping => self.identifier_mapping_ttl_secs,
            Namespace::Metadata => self.metadata_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            price_history_ttl_secs: 24 * 60 * 60,          // 24 hours
            identifier_mapping_ttl_secs: 7 * 24 * 60 * 60, // 7 days
            metadata_ttl_secs: 60 * 60,                    // 1 hour
        }
    }
}

/// Cleanup and quota guard configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Size of the quota probe write
    pub probe_bytes: usize,
    /// Cache entries deleted between quota probes during tiered reclaim
    pub reclaim_batch: usize,
    /// Number of keys listed in usage reports
    pub largest_keys: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            probe_bytes: 1024,
            reclaim_batch: 50,
            largest_keys: 10,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dataset.chunk_size, 500);
        assert_eq!(config.dataset.write_concurrency, 10);
        assert_eq!(
            config.cache.ttl(Namespace::PriceHistory),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            config.cache.ttl(Namespace::IdentifierMapping),
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(config.cache.ttl(Namespace::Metadata), Duration::from_secs(3600));
        assert_eq!(config.dataset.freshness_window(), Duration::from_secs(7 * 86400));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [dataset]
            chunk_size = 50

            [storage]
            quota_bytes = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.dataset.chunk_size, 50);
        assert_eq!(config.dataset.write_concurrency, 10);
        assert_eq!(config.storage.quota_bytes, 4096);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Config::from_toml("[dataset]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.db_file, "cardvault.redb");
    }
}
