//! Client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vaultfs_storage::{BlockIoConfig, CacheConfig};

use crate::retry::RetryPolicy;

/// Engine configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root of the local cache (default `./vaultfs-cache`).
    pub cache_dir: PathBuf,
    /// Plaintext bytes per block before a file is split (default 64 MiB).
    pub max_block_size: u64,
    /// Upload worker threads (default 3).
    pub upload_workers: usize,
    /// Download worker threads (default 3).
    pub download_workers: usize,
    /// Replica count of the root directory (default 2).
    pub default_replica_count: u8,
    /// Replicas that must confirm a put (default 2).
    pub wait_for_acks: u8,
    /// Retry policy for transient backend failures.
    pub retry: RetryPolicy,
    /// Block cache settings.
    pub cache: CacheConfig,
    /// Seconds between journal replication attempts (default 5).
    pub journal_sync_interval_secs: u64,
    /// Terminal transactions kept for inspection (default 10).
    pub transaction_window: usize,
    /// Transaction log records between compactions (default 256).
    pub log_compact_every: u64,
    /// Read attempts on a block that stopped growing (default 30).
    pub read_retry_count: u32,
    /// Milliseconds between those attempts (default 1000).
    pub read_retry_sleep_ms: u64,
    /// Seconds a reader waits for a block being downloaded (default 3600).
    pub block_wait_timeout_secs: u64,
    /// Directory used by the local-directory backend (default `./vaultfs-backend`).
    pub backend_dir: PathBuf,
    /// File holding the account secret key (default `./vaultfs.key`).
    pub key_file: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("vaultfs-cache"),
            max_block_size: 64 * 1024 * 1024,
            upload_workers: 3,
            download_workers: 3,
            default_replica_count: 2,
            wait_for_acks: 2,
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            journal_sync_interval_secs: 5,
            transaction_window: 10,
            log_compact_every: 256,
            read_retry_count: 30,
            read_retry_sleep_ms: 1000,
            block_wait_timeout_secs: 3600,
            backend_dir: PathBuf::from("vaultfs-backend"),
            key_file: PathBuf::from("vaultfs.key"),
        }
    }
}

impl ClientConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClientConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_block_size == 0 {
            anyhow::bail!("max_block_size must be positive");
        }
        if self.upload_workers == 0 || self.download_workers == 0 {
            anyhow::bail!("worker counts must be positive");
        }
        if self.default_replica_count == 0 {
            anyhow::bail!("default_replica_count must be positive");
        }
        if self.wait_for_acks == 0 {
            anyhow::bail!("wait_for_acks must be positive");
        }
        if self.cache.min_free_percent > 100 {
            anyhow::bail!("cache.min_free_percent must be at most 100");
        }
        Ok(())
    }

    /// Read retry settings for encoding blocks.
    pub fn block_io(&self) -> BlockIoConfig {
        BlockIoConfig {
            read_retry_count: self.read_retry_count,
            read_retry_sleep: Duration::from_millis(self.read_retry_sleep_ms),
        }
    }

    /// How long a reader waits for one block to arrive.
    pub fn block_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.block_wait_timeout_secs)
    }

    /// Interval of the journal synchronizer.
    pub fn journal_sync_interval(&self) -> Duration {
        Duration::from_secs(self.journal_sync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_block_size, 64 * 1024 * 1024);
        assert_eq!(config.upload_workers, 3);
        assert_eq!(config.default_replica_count, 2);
        assert_eq!(config.transaction_window, 10);
        assert_eq!(config.block_io().read_retry_count, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "cache_dir = \"/tmp/c\"\nmax_block_size = 1000\n[retry]\ninterval_ms = 0\n[cache]\nmin_free_percent = 20"
        )
        .unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/c"));
        assert_eq!(config.max_block_size, 1000);
        assert_eq!(config.retry.interval_ms, 0);
        assert_eq!(config.cache.min_free_percent, 20);
        assert_eq!(config.upload_workers, 3);
    }

    #[test]
    fn test_from_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"upload_workers": 1, "wait_for_acks": 1}}"#).unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.upload_workers, 1);
        assert_eq!(config.wait_for_acks, 1);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"max_block_size": 0}}"#).unwrap();
        assert!(ClientConfig::from_file(file.path()).is_err());

        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(ClientConfig::from_file(file.path()).is_err());
    }
}
