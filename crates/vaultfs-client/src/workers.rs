//! Upload and download worker pools.
//!
//! Workers drain a shared job queue. A transient failure is retried by
//! putting the job back at the end of the queue after the policy's interval;
//! a failure that cannot succeed on retry goes to [`JobHandler::on_failure`],
//! which fails the transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};
use vaultfs_storage::EncodingBlock;

use crate::error::VaultError;
use crate::events::EventBus;
use crate::retry::RetryPolicy;
use crate::transactions::{JobQueue, TransactionManager};
use crate::txlog::TxId;

/// A unit of work for a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Transfer one block of a transaction.
    Transfer {
        /// Owning transaction.
        tx: TxId,
        /// Offset of the block in the file.
        seek: u64,
        /// Failed attempts so far.
        attempt: u32,
    },
    /// Ends the worker that receives it.
    Quit,
}

/// How a transfer attempt failed.
#[derive(Debug)]
pub enum TransferError {
    /// Worth retrying: backend trouble or corrupt content received.
    Transient(String),
    /// Retrying cannot help.
    Fatal(VaultError),
}

/// Work performed for each job.
pub trait JobHandler: Send + Sync {
    /// Short name used in thread names and events.
    fn name(&self) -> &'static str;

    /// Performs one attempt.
    fn run(&self, tx: TxId, seek: u64) -> Result<(), TransferError>;

    /// Called once a job will not be attempted again.
    fn on_failure(&self, tx: TxId, seek: u64, error: VaultError);
}

/// Sends staged blocks to the backend.
pub struct UploadHandler {
    tm: Arc<TransactionManager>,
}

impl UploadHandler {
    /// Creates a handler bound to `tm`.
    pub fn new(tm: Arc<TransactionManager>) -> Self {
        Self { tm }
    }
}

impl JobHandler for UploadHandler {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn run(&self, tx: TxId, seek: u64) -> Result<(), TransferError> {
        let Some(source) = self.tm.upload_source(tx, seek).map_err(TransferError::Fatal)? else {
            debug!(tx_id = tx, seek, "skipping stale upload job");
            return Ok(());
        };
        let data = source
            .block
            .read_raw_all()
            .map_err(|e| TransferError::Fatal(e.into()))?;
        let acks = self.tm.wait_for_acks().min(source.replica_count);
        let receipt = self
            .tm
            .backend()
            .put(&data, None, source.replica_count, acks)
            .map_err(|e| TransferError::Transient(e.to_string()))?;

        let sent = blake3::hash(&data).to_hex();
        if receipt.source_checksum != sent.as_str() {
            return Err(TransferError::Transient(format!(
                "backend stored {} but {} was sent",
                receipt.source_checksum, sent
            )));
        }
        self.tm
            .block_uploaded(tx, seek, &receipt.remote_key)
            .map_err(TransferError::Fatal)
    }

    fn on_failure(&self, tx: TxId, seek: u64, error: VaultError) {
        self.tm.transfer_failed(tx, seek, error);
    }
}

/// Fetches blocks into the cache and verifies them.
pub struct DownloadHandler {
    tm: Arc<TransactionManager>,
}

impl DownloadHandler {
    /// Creates a handler bound to `tm`.
    pub fn new(tm: Arc<TransactionManager>) -> Self {
        Self { tm }
    }
}

impl JobHandler for DownloadHandler {
    fn name(&self) -> &'static str {
        "download"
    }

    fn run(&self, tx: TxId, seek: u64) -> Result<(), TransferError> {
        let Some(target) = self.tm.download_target(tx, seek).map_err(TransferError::Fatal)? else {
            debug!(tx_id = tx, seek, "skipping stale download job");
            return Ok(());
        };
        if self.tm.cached_matches(&target.key, &target.checksum) {
            debug!(tx_id = tx, seek, key = %target.key, "block already cached");
            self.tm.cache().touch(&target.key);
            return self.tm.block_downloaded(tx, seek).map_err(TransferError::Fatal);
        }
        let data = match self.tm.backend().get(&target.key, target.replica_count) {
            Ok(Some(data)) => data,
            Ok(None) => return Err(TransferError::Transient(format!("{} not found on backend", target.key))),
            Err(e) => return Err(TransferError::Transient(e.to_string())),
        };

        let cache = self.tm.cache();
        let fatal = |e: vaultfs_storage::StorageError| TransferError::Fatal(e.into());
        cache.reserve(data.len() as u64).map_err(fatal)?;
        let part = cache.part_path(&target.key, tx).map_err(fatal)?;
        let block = EncodingBlock::create_raw(&part, cache.context()).map_err(fatal)?;
        if let Err(e) = block.write_raw(&data).and_then(|_| block.finalize()) {
            block.remove();
            return Err(fatal(e));
        }
        match block.checksum() {
            Ok(sum) if sum == target.checksum => {}
            Ok(sum) => {
                block.remove();
                return Err(TransferError::Transient(format!(
                    "{} has checksum {}, expected {}",
                    target.key, sum, target.checksum
                )));
            }
            Err(e) if e.is_corruption() => {
                block.remove();
                return Err(TransferError::Transient(format!("{} is corrupt: {}", target.key, e)));
            }
            Err(e) => {
                block.remove();
                return Err(fatal(e));
            }
        }
        drop(block);

        let dest = cache.dynamic_dir().join(&target.key);
        std::fs::rename(&part, &dest).map_err(|e| TransferError::Fatal(e.into()))?;
        cache.touch(&target.key);
        debug!(tx_id = tx, seek, key = %target.key, bytes = data.len(), "block downloaded");
        self.tm.block_downloaded(tx, seek).map_err(TransferError::Fatal)
    }

    fn on_failure(&self, tx: TxId, seek: u64, error: VaultError) {
        self.tm.transfer_failed(tx, seek, error);
    }
}

/// A fixed set of threads draining one job queue.
pub struct WorkerPool {
    name: &'static str,
    sender: Sender<Job>,
    stopping: Arc<AtomicBool>,
    shutdown_tx: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

struct Worker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
    events: Arc<EventBus>,
    stopping: Arc<AtomicBool>,
    shutdown_rx: Receiver<()>,
}

impl Worker {
    fn run(&self) {
        while let Ok(job) = self.queue.receiver.recv() {
            let Job::Transfer { tx, seek, attempt } = job else {
                break;
            };
            if self.stopping.load(Ordering::SeqCst) {
                debug!(tx_id = tx, seek, "pool stopping, job left for recovery");
                continue;
            }
            match self.handler.run(tx, seek) {
                Ok(()) => {}
                Err(TransferError::Fatal(e)) => {
                    warn!(tx_id = tx, seek, error = %e, "{} failed", self.handler.name());
                    self.handler.on_failure(tx, seek, e);
                }
                Err(TransferError::Transient(reason)) => self.retry(tx, seek, attempt + 1, reason),
            }
        }
    }

    fn retry(&self, tx: TxId, seek: u64, attempts: u32, reason: String) {
        if !self.retry.allows_retry(attempts) {
            self.handler.on_failure(
                tx,
                seek,
                VaultError::Timeout(format!("gave up after {} attempts: {}", attempts, reason)),
            );
            return;
        }
        self.events.warning(
            self.handler.name(),
            format!(
                "transaction {} block {} attempt {} failed, retrying: {}",
                tx, seek, attempts, reason
            ),
        );
        // Sleeps the interval unless the pool is shut down meanwhile.
        if let Err(RecvTimeoutError::Disconnected) = self.shutdown_rx.recv_timeout(self.retry.interval()) {
            return;
        }
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let job = Job::Transfer {
            tx,
            seek,
            attempt: attempts,
        };
        if self.queue.sender.send(job).is_err() {
            warn!(tx_id = tx, seek, "queue closed, retry dropped");
        }
    }
}

impl WorkerPool {
    /// Starts `threads` workers named `vaultfs-<name>-N` on `queue`.
    pub fn start(
        threads: usize,
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        retry: RetryPolicy,
        events: Arc<EventBus>,
    ) -> std::io::Result<Self> {
        let name = handler.name();
        let stopping = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let mut pool = Self {
            name,
            sender: queue.sender.clone(),
            stopping: stopping.clone(),
            shutdown_tx: Some(shutdown_tx),
            handles: Vec::with_capacity(threads),
        };
        for i in 0..threads.max(1) {
            let worker = Worker {
                queue: queue.clone(),
                handler: handler.clone(),
                retry,
                events: events.clone(),
                stopping: stopping.clone(),
                shutdown_rx: shutdown_rx.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("vaultfs-{}-{}", name, i))
                .spawn(move || worker.run())?;
            pool.handles.push(handle);
        }
        info!(pool = name, threads = pool.handles.len(), "worker pool started");
        Ok(pool)
    }

    /// Number of worker threads still attached.
    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Stops every worker and waits for them. Queued jobs are abandoned;
    /// the transaction log brings them back on the next start.
    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.handles.len() {
            let _ = self.sender.send(Job::Quit);
        }
        self.shutdown_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!(pool = self.name, "worker thread panicked");
            }
        }
        debug!(pool = self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    struct Scripted {
        transient_failures: AtomicU32,
        fatal: bool,
        runs: AtomicU32,
        failures: Mutex<Vec<(TxId, u64, String)>>,
    }

    impl Scripted {
        fn new(transient_failures: u32, fatal: bool) -> Arc<Self> {
            Arc::new(Self {
                transient_failures: AtomicU32::new(transient_failures),
                fatal,
                runs: AtomicU32::new(0),
                failures: Mutex::new(Vec::new()),
            })
        }
    }

    impl JobHandler for Scripted {
        fn name(&self) -> &'static str {
            "test"
        }

        fn run(&self, _tx: TxId, _seek: u64) -> Result<(), TransferError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(TransferError::Fatal(VaultError::Resource("disk full".into())));
            }
            let left = self.transient_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.transient_failures.store(left - 1, Ordering::SeqCst);
                return Err(TransferError::Transient("backend down".into()));
            }
            Ok(())
        }

        fn on_failure(&self, tx: TxId, seek: u64, error: VaultError) {
            self.failures.lock().push((tx, seek, error.to_string()));
        }
    }

    fn queue() -> JobQueue {
        let (sender, receiver) = unbounded();
        JobQueue { sender, receiver }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let q = queue();
        let handler = Scripted::new(3, false);
        let events = Arc::new(EventBus::new());
        let warnings = Arc::new(AtomicU32::new(0));
        let counter = warnings.clone();
        events.subscribe(
            crate::events::EventLevel::Warning,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut pool = WorkerPool::start(2, q.clone(), handler.clone(), RetryPolicy::immediate(), events).unwrap();
        q.sender.send(Job::Transfer { tx: 1, seek: 0, attempt: 0 }).unwrap();

        wait_for(|| handler.runs.load(Ordering::SeqCst) == 4);
        pool.stop();
        assert_eq!(warnings.load(Ordering::SeqCst), 3);
        assert!(handler.failures.lock().is_empty());
    }

    #[test]
    fn test_attempt_limit_reports_failure() {
        let q = queue();
        let handler = Scripted::new(u32::MAX, false);
        let retry = RetryPolicy::immediate().with_max_attempts(3);
        let mut pool = WorkerPool::start(1, q.clone(), handler.clone(), retry, Arc::new(EventBus::new())).unwrap();
        q.sender.send(Job::Transfer { tx: 7, seek: 100, attempt: 0 }).unwrap();

        wait_for(|| !handler.failures.lock().is_empty());
        pool.stop();
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        let failures = handler.failures.lock();
        assert_eq!(failures[0].0, 7);
        assert_eq!(failures[0].1, 100);
        assert!(failures[0].2.contains("3 attempts"));
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let q = queue();
        let handler = Scripted::new(0, true);
        let mut pool =
            WorkerPool::start(1, q.clone(), handler.clone(), RetryPolicy::immediate(), Arc::new(EventBus::new()))
                .unwrap();
        q.sender.send(Job::Transfer { tx: 1, seek: 0, attempt: 0 }).unwrap();
        wait_for(|| !handler.failures.lock().is_empty());
        pool.stop();
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_interrupts_retry_sleep() {
        let q = queue();
        let handler = Scripted::new(u32::MAX, false);
        let retry = RetryPolicy::fixed(Duration::from_secs(60));
        let mut pool = WorkerPool::start(2, q.clone(), handler.clone(), retry, Arc::new(EventBus::new())).unwrap();
        q.sender.send(Job::Transfer { tx: 1, seek: 0, attempt: 0 }).unwrap();
        wait_for(|| handler.runs.load(Ordering::SeqCst) == 1);

        let started = Instant::now();
        pool.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(pool.threads(), 0);
        assert!(handler.failures.lock().is_empty());
    }
}
