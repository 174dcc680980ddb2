//! The remote store contract and two local implementations.
//!
//! The engine only ever calls [`Backend::put`], [`Backend::get`] and
//! [`Backend::delete`]. Every failure is treated as transient by the worker
//! pools; content returned by `get` is verified by the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not be reached or did not answer in time.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Fewer replicas confirmed than were required.
    #[error("only {acked} of {required} replicas acknowledged")]
    InsufficientAcks {
        /// Replicas required.
        required: u8,
        /// Replicas that confirmed.
        acked: u8,
    },

    /// Local I/O failure inside the backend.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    /// Key to fetch the content with.
    pub remote_key: String,
    /// Hex BLAKE3 of the stored bytes.
    pub source_checksum: String,
}

/// Remote, replicated content store.
pub trait Backend: Send + Sync {
    /// Stores `content`. With `key` unset the store derives the key from the
    /// content. Fails unless `wait_for_acks` replicas confirm.
    fn put(
        &self,
        content: &[u8],
        key: Option<&str>,
        replica_count: u8,
        wait_for_acks: u8,
    ) -> Result<PutReceipt, BackendError>;

    /// Fetches content, `None` if the key is unknown.
    fn get(&self, key: &str, replica_count: u8) -> Result<Option<Vec<u8>>, BackendError>;

    /// Deletes content, returning whether anything was removed.
    fn delete(&self, key: &str, replica_count: u8) -> Result<bool, BackendError>;
}

fn content_key(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

/// In-memory backend with fault injection, for tests and demos.
#[derive(Debug)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    get_counts: Mutex<HashMap<String, u64>>,
    replicas: u8,
    available: AtomicBool,
    failing_puts: AtomicU32,
    failing_gets: AtomicU32,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty store able to hold up to 8 replicas.
    pub fn new() -> Self {
        Self::with_replicas(8)
    }

    /// Creates an empty store with `replicas` reachable replica nodes.
    pub fn with_replicas(replicas: u8) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            get_counts: Mutex::new(HashMap::new()),
            replicas,
            available: AtomicBool::new(true),
            failing_puts: AtomicU32::new(0),
            failing_gets: AtomicU32::new(0),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// Makes every call fail (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fails the next `n` puts.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` gets.
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Successful puts so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Gets attempted so far, successful or not.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Gets attempted for one key.
    pub fn get_count_for(&self, key: &str) -> u64 {
        self.get_counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Stored keys.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// True if `key` is stored.
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    /// Flips one byte of a stored object.
    pub fn corrupt(&self, key: &str) -> bool {
        match self.objects.lock().get_mut(key) {
            Some(data) if !data.is_empty() => {
                let mid = data.len() / 2;
                data[mid] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    fn check_available(&self, counter: &AtomicU32) -> Result<(), BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("store offline".into()));
        }
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn put(
        &self,
        content: &[u8],
        key: Option<&str>,
        replica_count: u8,
        wait_for_acks: u8,
    ) -> Result<PutReceipt, BackendError> {
        self.check_available(&self.failing_puts)?;
        let required = wait_for_acks.min(replica_count);
        let acked = replica_count.min(self.replicas);
        if acked < required {
            return Err(BackendError::InsufficientAcks { required, acked });
        }
        let checksum = content_key(content);
        let remote_key = key.map(str::to_string).unwrap_or_else(|| checksum.clone());
        self.objects.lock().insert(remote_key.clone(), content.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(PutReceipt {
            remote_key,
            source_checksum: checksum,
        })
    }

    fn get(&self, key: &str, _replica_count: u8) -> Result<Option<Vec<u8>>, BackendError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        *self.get_counts.lock().entry(key.to_string()).or_insert(0) += 1;
        self.check_available(&self.failing_gets)?;
        Ok(self.objects.lock().get(key).cloned())
    }

    fn delete(&self, key: &str, _replica_count: u8) -> Result<bool, BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("store offline".into()));
        }
        Ok(self.objects.lock().remove(key).is_some())
    }
}

/// Backend storing each object as a file in a local directory.
///
/// Replicas are not simulated; a put succeeds whenever the file is written.
#[derive(Debug, Clone)]
pub struct LocalDirBackend {
    root: PathBuf,
}

impl LocalDirBackend {
    /// Opens (creating if needed) the store at `root`.
    pub fn open(root: &Path) -> Result<Self, BackendError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BackendError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid object key {:?}", key),
            )));
        }
        Ok(self.root.join(key))
    }
}

impl Backend for LocalDirBackend {
    fn put(
        &self,
        content: &[u8],
        key: Option<&str>,
        _replica_count: u8,
        _wait_for_acks: u8,
    ) -> Result<PutReceipt, BackendError> {
        let checksum = content_key(content);
        let remote_key = key.map(str::to_string).unwrap_or_else(|| checksum.clone());
        let path = self.object_path(&remote_key)?;
        let tmp = self.root.join(format!(".{}.tmp", remote_key));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!(key = %remote_key, size = content.len(), "stored object");
        Ok(PutReceipt {
            remote_key,
            source_checksum: checksum,
        })
    }

    fn get(&self, key: &str, _replica_count: u8) -> Result<Option<Vec<u8>>, BackendError> {
        match std::fs::read(self.object_path(key)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str, _replica_count: u8) -> Result<bool, BackendError> {
        match std::fs::remove_file(self.object_path(key)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(key, error = %e, "failed to delete object");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_content_keys() {
        let backend = MemoryBackend::new();
        let receipt = backend.put(b"payload", None, 2, 2).unwrap();
        assert_eq!(receipt.remote_key, receipt.source_checksum);
        assert_eq!(backend.get(&receipt.remote_key, 2).unwrap(), Some(b"payload".to_vec()));
        assert!(backend.delete(&receipt.remote_key, 2).unwrap());
        assert_eq!(backend.get(&receipt.remote_key, 2).unwrap(), None);
        assert_eq!(backend.get_count_for(&receipt.remote_key), 2);
    }

    #[test]
    fn test_memory_backend_named_key() {
        let backend = MemoryBackend::new();
        let receipt = backend.put(b"blob", Some("journal-ab"), 2, 1).unwrap();
        assert_eq!(receipt.remote_key, "journal-ab");
        assert!(backend.contains("journal-ab"));
    }

    #[test]
    fn test_memory_backend_faults() {
        let backend = MemoryBackend::with_replicas(1);
        assert!(matches!(
            backend.put(b"x", None, 3, 2),
            Err(BackendError::InsufficientAcks { required: 2, acked: 1 })
        ));
        assert!(backend.put(b"x", None, 3, 1).is_ok());

        backend.fail_next_gets(1);
        assert!(backend.get("k", 1).is_err());
        assert!(backend.get("k", 1).unwrap().is_none());

        backend.set_available(false);
        assert!(backend.put(b"y", None, 1, 1).is_err());
    }

    #[test]
    fn test_local_dir_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalDirBackend::open(dir.path()).unwrap();
        let receipt = backend.put(b"data", None, 2, 2).unwrap();
        assert_eq!(backend.get(&receipt.remote_key, 2).unwrap(), Some(b"data".to_vec()));
        assert!(backend.get("missing", 2).unwrap().is_none());
        assert!(backend.delete(&receipt.remote_key, 2).unwrap());
        assert!(!backend.delete(&receipt.remote_key, 2).unwrap());
        assert!(backend.get("../escape", 2).is_err());
    }
}
