//! Shared fixtures for storage integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vaultfs_storage::{AccountKeys, BlockCache, BlockContext, BlockIoConfig, CacheConfig, EncodingBlock, FixedFreeSpace};

/// Read settings that fail fast instead of waiting a second per retry.
pub fn fast_io() -> BlockIoConfig {
    BlockIoConfig {
        read_retry_count: 2,
        read_retry_sleep: Duration::from_millis(5),
    }
}

/// A cache whose free space is whatever the returned probe says.
pub fn cache(dir: &Path, config: CacheConfig, free: u64) -> (Arc<BlockCache>, Arc<FixedFreeSpace>) {
    let probe = Arc::new(FixedFreeSpace::new(free));
    let ctx = BlockContext::new(Arc::new(AccountKeys::generate()), fast_io());
    let cache = BlockCache::open(dir, config, ctx, probe.clone()).unwrap();
    (Arc::new(cache), probe)
}

/// Writes and finalizes an encrypted block holding `len` bytes under `key`.
pub fn stored_block(cache: &BlockCache, key: &str, len: usize) -> u64 {
    let path = cache.dynamic_dir().join(key);
    let block = EncodingBlock::create(&path, cache.context()).unwrap();
    block.write(&vec![7u8; len]).unwrap();
    block.finalize().unwrap();
    cache.touch(key);
    block.actual_size()
}
