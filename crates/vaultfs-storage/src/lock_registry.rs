//! Reference counting for block files.
//!
//! Every open [`EncodingBlock`](crate::encoding_block::EncodingBlock) holds a
//! reference on its path. A path with references is locked: the cache will
//! not evict it and removal is deferred until the last handle goes away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Callback run once a path has no remaining references.
pub type UnlockCallback = Box<dyn FnOnce(&Path) + Send>;

#[derive(Default)]
struct LockEntry {
    refs: usize,
    remove_on_unlock: bool,
    on_unlock: Vec<UnlockCallback>,
}

/// Registry of locked block paths, shared by every block of one cache.
#[derive(Default)]
pub struct BlockRegistry {
    entries: Mutex<HashMap<PathBuf, LockEntry>>,
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("locked", &self.entries.lock().len())
            .finish()
    }
}

impl BlockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reference on `path`.
    pub fn acquire(&self, path: &Path) {
        let mut entries = self.entries.lock();
        entries.entry(path.to_path_buf()).or_default().refs += 1;
    }

    /// Drops a reference on `path`; the last release performs deferred work.
    pub fn release(&self, path: &Path) {
        let finished = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(path) else {
                warn!(path = ?path, "release of an unregistered block path");
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return;
            }
            entries.remove(path)
        };

        if let Some(entry) = finished {
            if entry.remove_on_unlock {
                remove_quietly(path);
            }
            for callback in entry.on_unlock {
                callback(path);
            }
        }
    }

    /// True while any handle references `path`.
    pub fn is_locked(&self, path: &Path) -> bool {
        self.ref_count(path) > 0
    }

    /// Number of live handles on `path`.
    pub fn ref_count(&self, path: &Path) -> usize {
        self.entries.lock().get(path).map_or(0, |e| e.refs)
    }

    /// Deletes `path` now if unlocked, otherwise once the last handle is released.
    ///
    /// Returns true when the file was removed immediately.
    pub fn remove_on_unlock(&self, path: &Path) -> bool {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(path) {
                if entry.refs > 0 {
                    debug!(path = ?path, refs = entry.refs, "deferring removal of locked block");
                    entry.remove_on_unlock = true;
                    return false;
                }
            }
        }
        remove_quietly(path);
        true
    }

    /// Runs `callback` once `path` is unlocked (immediately if it already is).
    pub fn notify_on_unlock(&self, path: &Path, callback: UnlockCallback) {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(path) {
                if entry.refs > 0 {
                    entry.on_unlock.push(callback);
                    return;
                }
            }
        }
        callback(path);
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = ?path, "removed block file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "failed to remove block file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_refcount_lock() {
        let reg = BlockRegistry::new();
        let p = Path::new("/tmp/vaultfs-test-lock");
        assert!(!reg.is_locked(p));
        reg.acquire(p);
        reg.acquire(p);
        assert_eq!(reg.ref_count(p), 2);
        reg.release(p);
        assert!(reg.is_locked(p));
        reg.release(p);
        assert!(!reg.is_locked(p));
    }

    #[test]
    fn test_deferred_removal() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("blk");
        std::fs::write(&p, b"data").unwrap();
        let reg = BlockRegistry::new();
        reg.acquire(&p);
        assert!(!reg.remove_on_unlock(&p));
        assert!(p.exists());
        reg.release(&p);
        assert!(!p.exists());
    }

    #[test]
    fn test_remove_unlocked_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("blk");
        std::fs::write(&p, b"data").unwrap();
        let reg = BlockRegistry::new();
        assert!(reg.remove_on_unlock(&p));
        assert!(!p.exists());
    }

    #[test]
    fn test_notify_on_unlock() {
        let reg = BlockRegistry::new();
        let p = Path::new("/tmp/vaultfs-test-notify");
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        reg.notify_on_unlock(p, Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        reg.acquire(p);
        let h = hits.clone();
        reg.notify_on_unlock(p, Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        reg.release(p);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
