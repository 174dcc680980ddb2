//! Shared fixtures for client integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vaultfs_client::{ClientConfig, MemoryBackend, RetryPolicy, VaultFs};
use vaultfs_storage::{AccountKeys, CacheConfig, FixedFreeSpace};

/// Block size used by the tests.
pub const BLOCK: u64 = 100_000;

/// How long tests wait for transfers.
pub const IDLE: Duration = Duration::from_secs(20);

/// One account: keys, an in-memory backend and a temporary cache root.
pub struct TestVault {
    pub dir: TempDir,
    pub keys: Arc<AccountKeys>,
    pub backend: Arc<MemoryBackend>,
    pub config: ClientConfig,
}

impl TestVault {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().join("cache"));
        Self {
            dir,
            keys: Arc::new(AccountKeys::generate()),
            backend: Arc::new(MemoryBackend::new()),
            config,
        }
    }

    /// Opens the engine on the fixture's cache.
    pub fn open(&self) -> VaultFs {
        self.open_with(self.config.clone())
    }

    pub fn open_with(&self, config: ClientConfig) -> VaultFs {
        VaultFs::open_with_probe(
            config,
            self.keys.clone(),
            self.backend.clone(),
            Arc::new(FixedFreeSpace::new(1 << 40)),
        )
        .unwrap()
    }

    /// Opens the engine and registers a fresh account.
    pub fn registered(&self) -> VaultFs {
        let fs = self.open();
        fs.register().unwrap();
        fs
    }

    /// Cache directory of the fixture.
    pub fn cache_dir(&self) -> PathBuf {
        self.config.cache_dir.clone()
    }
}

/// Settings that keep tests fast: small blocks, no retry delay, short waits.
pub fn test_config(cache_dir: PathBuf) -> ClientConfig {
    ClientConfig {
        cache_dir,
        max_block_size: BLOCK,
        upload_workers: 2,
        download_workers: 2,
        retry: RetryPolicy::immediate(),
        cache: CacheConfig {
            check_interval_secs: 1,
            ..CacheConfig::default()
        },
        journal_sync_interval_secs: 1,
        read_retry_count: 3,
        read_retry_sleep_ms: 5,
        block_wait_timeout_secs: 20,
        ..ClientConfig::default()
    }
}

/// Deterministic, non-repeating-looking content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn write_file(fs: &VaultFs, path: &str, data: &[u8]) {
    let mut file = fs.open_file(path, true).unwrap();
    file.write(data).unwrap();
    file.close().unwrap();
}

pub fn read_file(fs: &VaultFs, path: &str) -> Vec<u8> {
    let mut file = fs.open_file(path, false).unwrap();
    let data = file.read(None).unwrap();
    file.close().unwrap();
    data
}

/// Writes `data` and waits until the upload is committed.
pub fn upload(fs: &VaultFs, path: &str, data: &[u8]) {
    write_file(fs, path, data);
    assert!(fs.wait_idle(IDLE), "upload of {} did not finish", path);
}

/// Polls `cond` until it holds, failing the test after [`IDLE`].
pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + IDLE;
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(5));
    }
}
