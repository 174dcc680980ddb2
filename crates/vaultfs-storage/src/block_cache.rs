//! On-disk cache of encoding blocks.
//!
//! The cache root holds two areas. `dynamic_cache/` keeps block files named
//! by content or staging key; it is eviction-eligible. `static_cache/` holds
//! the journal, the transaction log and the namespace index and is never
//! evicted. An alias entry (`<key>.alias`, holding another key) lets one key
//! resolve to a file stored under a different name.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capacity::FreeSpaceProbe;
use crate::encoding_block::BlockContext;
use crate::error::{StorageError, StorageResult};

/// Directory under the cache root holding evictable blocks.
pub const DYNAMIC_DIR: &str = "dynamic_cache";
/// Directory under the cache root holding engine state.
pub const STATIC_DIR: &str = "static_cache";
const ALIAS_SUFFIX: &str = ".alias";
const PART_SUFFIX: &str = ".part";

/// Configuration for the block cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Free space floor as a percentage of free + busy (default 10).
    pub min_free_percent: u8,
    /// Upper bound on usable space in bytes, on top of the physical limit.
    pub allow_capacity: Option<u64>,
    /// Seconds between background floor checks (default 5).
    pub check_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_free_percent: 10,
            allow_capacity: None,
            check_interval_secs: 5,
        }
    }
}

/// Point-in-time cache usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Bytes of block files in the dynamic area.
    pub dynamic_bytes: u64,
    /// Bytes used by the static area.
    pub static_bytes: u64,
    /// Block files in the dynamic area.
    pub entries: usize,
    /// Alias entries.
    pub aliases: usize,
    /// Usable free bytes.
    pub free_bytes: u64,
    /// Entries evicted since the cache was opened.
    pub evictions: u64,
    /// Bytes evicted since the cache was opened.
    pub evicted_bytes: u64,
}

struct Candidate {
    key: String,
    path: PathBuf,
    size: u64,
    rank: (bool, u128),
}

/// Capacity-bounded directory of encoding blocks.
pub struct BlockCache {
    root: PathBuf,
    dynamic_dir: PathBuf,
    static_dir: PathBuf,
    config: CacheConfig,
    ctx: BlockContext,
    probe: Arc<dyn FreeSpaceProbe>,
    listing: ReentrantMutex<()>,
    access: Mutex<HashMap<String, u64>>,
    access_seq: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish()
    }
}

impl BlockCache {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn open(
        root: &Path,
        config: CacheConfig,
        ctx: BlockContext,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> StorageResult<Self> {
        let dynamic_dir = root.join(DYNAMIC_DIR);
        let static_dir = root.join(STATIC_DIR);
        std::fs::create_dir_all(&dynamic_dir)?;
        std::fs::create_dir_all(&static_dir)?;
        info!(root = ?root, min_free_percent = config.min_free_percent, "opened block cache");
        Ok(Self {
            root: root.to_path_buf(),
            dynamic_dir,
            static_dir,
            config,
            ctx,
            probe,
            listing: ReentrantMutex::new(()),
            access: Mutex::new(HashMap::new()),
            access_seq: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
        })
    }

    /// Block context shared by every block in this cache.
    pub fn context(&self) -> &BlockContext {
        &self.ctx
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The evictable area.
    pub fn dynamic_dir(&self) -> &Path {
        &self.dynamic_dir
    }

    /// Path of a file in the never-evicted area.
    pub fn static_path(&self, name: &str) -> PathBuf {
        self.static_dir.join(name)
    }

    /// Resolves `key` to a block path, following at most one alias.
    ///
    /// Returns where the block would live when nothing is cached under `key`.
    pub fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let _guard = self.listing.lock();
        let direct = self.dynamic_dir.join(key);
        if direct.is_file() {
            self.touch(key);
            return Ok(direct);
        }
        if let Some(target) = self.alias_target(key) {
            let resolved = self.dynamic_dir.join(&target);
            if resolved.is_file() {
                self.touch(&target);
                return Ok(resolved);
            }
        }
        Ok(direct)
    }

    /// Path of the temporary file a download of `key` on behalf of `owner`
    /// writes before it is renamed to `key`. Concurrent downloads of one key
    /// by different owners never share a file.
    pub fn part_path(&self, key: &str, owner: u64) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dynamic_dir.join(format!("{}.{}{}", key, owner, PART_SUFFIX)))
    }

    /// True when `key` resolves to an existing block file.
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Makes `new_key` resolve to the block stored under `existing_key`.
    pub fn make_alias(&self, existing_key: &str, new_key: &str) -> StorageResult<()> {
        validate_key(existing_key)?;
        validate_key(new_key)?;
        if existing_key == new_key {
            return Ok(());
        }
        let _guard = self.listing.lock();
        let alias = self.alias_path(new_key);
        let tmp = self.dynamic_dir.join(format!("{}{}.tmp", new_key, ALIAS_SUFFIX));
        std::fs::write(&tmp, existing_key.as_bytes())?;
        std::fs::rename(&tmp, &alias)?;
        debug!(alias = new_key, target = existing_key, "created cache alias");
        Ok(())
    }

    /// Records an access for LRU ordering.
    pub fn touch(&self, key: &str) {
        let seq = self.access_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.access.lock().insert(key.to_string(), seq);
    }

    /// Removes `key` and its alias. A locked target is deleted once unlocked.
    pub fn remove_entry(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.listing.lock();
        if let Some(target) = self.alias_target(key) {
            self.ctx.registry.remove_on_unlock(&self.dynamic_dir.join(&target));
            self.access.lock().remove(&target);
            let _ = std::fs::remove_file(self.alias_path(key));
        }
        let direct = self.dynamic_dir.join(key);
        if direct.exists() {
            self.ctx.registry.remove_on_unlock(&direct);
        }
        self.access.lock().remove(key);
        Ok(())
    }

    /// Returns true if `n_bytes` fit, evicting old entries first if needed.
    pub fn can_store(&self, n_bytes: u64) -> bool {
        let _guard = self.listing.lock();
        let (free, _) = self.usage();
        if free >= n_bytes {
            return true;
        }
        let freed = self.evict_until_free(n_bytes - free);
        let (free, _) = self.usage();
        let ok = free >= n_bytes;
        if !ok {
            warn!(needed = n_bytes, free, freed, "cache cannot make room");
        }
        ok
    }

    /// Like [`can_store`](Self::can_store) but returns an error.
    pub fn reserve(&self, n_bytes: u64) -> StorageResult<()> {
        if self.can_store(n_bytes) {
            Ok(())
        } else {
            Err(StorageError::OutOfSpace {
                needed: n_bytes,
                available: self.usage().0,
            })
        }
    }

    /// Deletes unlocked, non-alias block files, least recently used first,
    /// until `target` bytes were freed or nothing else is evictable.
    pub fn evict_until_free(&self, target: u64) -> u64 {
        let _guard = self.listing.lock();
        let mut candidates = self.candidates();
        candidates.sort_by(|a, b| a.rank.cmp(&b.rank));

        let mut freed = 0u64;
        for cand in candidates {
            if freed >= target {
                break;
            }
            if self.ctx.registry.is_locked(&cand.path) {
                continue;
            }
            match std::fs::remove_file(&cand.path) {
                Ok(()) => {
                    freed += cand.size;
                    self.access.lock().remove(&cand.key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    self.evicted_bytes.fetch_add(cand.size, Ordering::Relaxed);
                    debug!(key = %cand.key, size = cand.size, "evicted cache entry");
                }
                Err(e) => warn!(key = %cand.key, error = %e, "failed to evict cache entry"),
            }
        }
        if freed > 0 {
            self.reclaim_dangling_aliases();
        }
        freed
    }

    /// Evicts until free space is back above the configured floor.
    ///
    /// Returns the bytes freed.
    pub fn enforce_floor(&self) -> u64 {
        let _guard = self.listing.lock();
        let (free, busy) = self.usage();
        let total = free + busy;
        let floor = total * self.config.min_free_percent as u64 / 100;
        if free >= floor {
            return 0;
        }
        debug!(free, busy, floor, "free space below floor");
        self.evict_until_free(floor - free)
    }

    /// Removes aliases whose target no longer exists.
    pub fn reclaim_dangling_aliases(&self) -> usize {
        let _guard = self.listing.lock();
        let mut removed = 0;
        for alias in self.alias_keys() {
            let dangling = match self.alias_target(&alias) {
                Some(target) => !self.dynamic_dir.join(target).is_file(),
                None => true,
            };
            if dangling && std::fs::remove_file(self.alias_path(&alias)).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "reclaimed dangling aliases");
        }
        removed
    }

    /// Deletes leftovers of interrupted work: files starting with
    /// `staging_prefix` and partial downloads, unless referenced, locked or
    /// the target of an alias.
    pub fn purge_staging(&self, staging_prefix: &str, referenced: &HashSet<String>) -> usize {
        let _guard = self.listing.lock();
        let alias_targets: HashSet<String> = self
            .alias_keys()
            .iter()
            .filter_map(|a| self.alias_target(a))
            .collect();
        let mut purged = 0;
        for cand in self.candidates() {
            let staging = cand.key.starts_with(staging_prefix) || cand.key.ends_with(PART_SUFFIX);
            if !staging
                || referenced.contains(&cand.key)
                || alias_targets.contains(&cand.key)
                || self.ctx.registry.is_locked(&cand.path)
            {
                continue;
            }
            if std::fs::remove_file(&cand.path).is_ok() {
                debug!(key = %cand.key, "purged stale staging block");
                purged += 1;
            }
        }
        purged
    }

    /// Keys of the block files in the dynamic area.
    pub fn entries(&self) -> Vec<String> {
        let _guard = self.listing.lock();
        self.candidates().into_iter().map(|c| c.key).collect()
    }

    /// Current usage figures.
    pub fn stats(&self) -> CacheStats {
        let _guard = self.listing.lock();
        let candidates = self.candidates();
        let (free, _) = self.usage();
        CacheStats {
            dynamic_bytes: candidates.iter().map(|c| c.size).sum(),
            static_bytes: dir_size(&self.static_dir),
            entries: candidates.len(),
            aliases: self.alias_keys().len(),
            free_bytes: free,
            evictions: self.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
        }
    }

    /// Returns `(free, busy)`: usable free bytes and bytes held by the cache.
    fn usage(&self) -> (u64, u64) {
        let busy = dir_size(&self.dynamic_dir) + dir_size(&self.static_dir);
        let physical = match self.probe.free_bytes(&self.root) {
            Ok(free) => free,
            Err(e) => {
                warn!(error = %e, "free space probe failed");
                0
            }
        };
        let free = match self.config.allow_capacity {
            Some(allowed) => allowed.saturating_sub(busy).min(physical),
            None => physical,
        };
        (free, busy)
    }

    fn candidates(&self) -> Vec<Candidate> {
        let access = self.access.lock().clone();
        let Ok(dir) = std::fs::read_dir(&self.dynamic_dir) else {
            return Vec::new();
        };
        dir.filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let key = entry.file_name().to_string_lossy().into_owned();
                if key.ends_with(ALIAS_SUFFIX) || key.ends_with(".tmp") {
                    return None;
                }
                let rank = match access.get(&key) {
                    Some(seq) => (true, *seq as u128),
                    None => {
                        let mtime = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map_or(0, |d| d.as_nanos());
                        (false, mtime)
                    }
                };
                Some(Candidate {
                    path: entry.path(),
                    size: meta.len(),
                    key,
                    rank,
                })
            })
            .collect()
    }

    fn alias_path(&self, key: &str) -> PathBuf {
        self.dynamic_dir.join(format!("{}{}", key, ALIAS_SUFFIX))
    }

    fn alias_target(&self, key: &str) -> Option<String> {
        let target = std::fs::read_to_string(self.alias_path(key)).ok()?;
        let target = target.trim().to_string();
        validate_key(&target).ok()?;
        Some(target)
    }

    fn alias_keys(&self) -> Vec<String> {
        let Ok(dir) = std::fs::read_dir(&self.dynamic_dir) else {
            return Vec::new();
        };
        dir.filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(ALIAS_SUFFIX).map(str::to_string)
            })
            .collect()
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(dir) = std::fs::read_dir(path) else {
        return 0;
    };
    dir.filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .map(|m| if m.is_dir() { 0 } else { m.len() })
        .sum()
}
