//! Free-space probing and the background capacity monitor.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::block_cache::BlockCache;

/// Source of free physical space for the filesystem holding the cache.
pub trait FreeSpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem of `path`.
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Reads free space with `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl FreeSpaceProbe for StatvfsProbe {
    #[cfg(target_family = "unix")]
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: statvfs is a plain C struct of integers; all-zero is a valid value.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: path_cstr is NUL-terminated and stat is a valid out-pointer.
        let result = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }

    #[cfg(not(target_family = "unix"))]
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "free space probing requires statvfs",
        ))
    }
}

/// Probe reporting a settable value, for tests and simulations.
#[derive(Debug, Default)]
pub struct FixedFreeSpace(AtomicU64);

impl FixedFreeSpace {
    /// Creates a probe reporting `bytes`.
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    /// Changes the reported value.
    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl FreeSpaceProbe for FixedFreeSpace {
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// Background thread that keeps the cache above its free-space floor.
pub struct CapacityMonitor {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CapacityMonitor {
    /// Starts checking `cache` every `interval`.
    pub fn start(cache: Arc<BlockCache>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("vaultfs-capacity".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "capacity monitor started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let freed = cache.enforce_floor();
                            if freed > 0 {
                                debug!(freed, "capacity monitor evicted cache entries");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("capacity monitor stopped");
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("capacity monitor thread panicked");
            }
        }
    }
}

impl Drop for CapacityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe() {
        let probe = FixedFreeSpace::new(10);
        assert_eq!(probe.free_bytes(Path::new("/")).unwrap(), 10);
        probe.set(42);
        assert_eq!(probe.free_bytes(Path::new("/")).unwrap(), 42);
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn test_statvfs_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatvfsProbe.free_bytes(dir.path()).is_ok());
    }

    #[test]
    fn test_statvfs_missing_path_errors() {
        assert!(StatvfsProbe
            .free_bytes(Path::new("/definitely/not/here/vaultfs"))
            .is_err());
    }
}
