//! Transaction manager: the crash-recoverable state machine behind every
//! upload and download.
//!
//! Every change is appended to the transaction log before it is applied in
//! memory, and one lock serializes both. Uploads go INIT (blocks staged as
//! `w-<uuid>` cache files) -> LOCAL_SAVED (transfers queued) -> FINISHED
//! (every block acknowledged and the namespace updated). Downloads start
//! LOCAL_SAVED with intact cached blocks already marked done.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vaultfs_meta::{normalize_path, split_parent, Chunk, FileItem, ItemId, NamespaceItem, PathError};
use vaultfs_storage::{expected_ciphertext_len, BlockCache, ContentHash, EncodingBlock};

use crate::backend::Backend;
use crate::config::ClientConfig;
use crate::error::{VaultError, VaultResult};
use crate::events::EventBus;
use crate::namespace::Namespace;
use crate::txlog::{BlockUpdate, LogRecord, TransactionLog, TxId, TxKind, TxStatus};
use crate::workers::Job;

/// Name of the transaction log in the static cache area.
pub const TRANSACTION_LOG_FILE: &str = "transactions.log";
/// Prefix of upload staging blocks in the dynamic cache area.
pub const STAGING_PREFIX: &str = "w-";

#[derive(Debug, Default)]
struct DataBlock {
    size: u64,
    block: Option<Arc<EncodingBlock>>,
    local_name: Option<String>,
    remote_key: Option<String>,
    checksum: Option<ContentHash>,
    done: bool,
}

#[derive(Debug)]
struct Transaction {
    id: TxId,
    kind: TxKind,
    path: String,
    replica_count: u8,
    status: TxStatus,
    start_time: u64,
    blocks: BTreeMap<u64, DataBlock>,
    reserved_id: Option<ItemId>,
    error: Option<String>,
}

impl Transaction {
    fn all_done(&self) -> bool {
        self.blocks.values().all(|b| b.done)
    }

    fn pending(&self) -> Vec<u64> {
        self.blocks
            .iter()
            .filter(|(_, b)| !b.done)
            .map(|(seek, _)| *seek)
            .collect()
    }

    fn info(&self) -> OperationInfo {
        OperationInfo {
            id: self.id,
            kind: self.kind,
            path: self.path.clone(),
            status: self.status,
            size: self.blocks.values().map(|b| b.size).sum(),
            blocks_done: self.blocks.values().filter(|b| b.done).count(),
            blocks_total: self.blocks.len(),
            start_time: self.start_time,
            error: self.error.clone(),
        }
    }
}

/// A transaction as reported to front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// Transaction id.
    pub id: TxId,
    /// Direction.
    pub kind: TxKind,
    /// Namespace path.
    pub path: String,
    /// Current state.
    pub status: TxStatus,
    /// Plaintext bytes covered by the transaction's blocks.
    pub size: u64,
    /// Blocks transferred.
    pub blocks_done: usize,
    /// Blocks in the transaction.
    pub blocks_total: usize,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
    /// Why the transaction failed.
    pub error: Option<String>,
}

/// Both ends of one job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    /// Used by workers to re-enqueue retries.
    pub sender: Sender<Job>,
    /// Drained by workers.
    pub receiver: Receiver<Job>,
}

/// The upload and download queues fed by the manager.
#[derive(Debug, Clone)]
pub struct JobQueues {
    /// Upload jobs.
    pub upload: JobQueue,
    /// Download jobs.
    pub download: JobQueue,
}

/// What an upload worker sends.
#[derive(Debug, Clone)]
pub struct UploadSource {
    /// The finalized staging block.
    pub block: Arc<EncodingBlock>,
    /// Replicas to request.
    pub replica_count: u8,
}

/// What a download worker fetches.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    /// Remote content key, also the cache key.
    pub key: String,
    /// Plaintext hash the content must match.
    pub checksum: ContentHash,
    /// Plaintext size.
    pub size: u64,
    /// Replicas to read from.
    pub replica_count: u8,
}

struct TmState {
    log: TransactionLog,
    txs: BTreeMap<TxId, Transaction>,
    next_id: TxId,
}

impl TmState {
    /// Writes `record` to the log, then applies it in memory.
    fn record(&mut self, record: LogRecord) -> VaultResult<()> {
        self.log.append(&record)?;
        apply(&mut self.txs, &record);
        Ok(())
    }
}

fn apply(txs: &mut BTreeMap<TxId, Transaction>, record: &LogRecord) {
    match record {
        LogRecord::Start {
            tx_id,
            kind,
            replica_count,
            start_time,
            path,
        } => {
            txs.insert(
                *tx_id,
                Transaction {
                    id: *tx_id,
                    kind: *kind,
                    path: path.clone(),
                    replica_count: *replica_count,
                    status: TxStatus::Init,
                    start_time: *start_time,
                    blocks: BTreeMap::new(),
                    reserved_id: None,
                    error: None,
                },
            );
        }
        LogRecord::UpdateState { tx_id, status } => match txs.get_mut(tx_id) {
            Some(tx) => tx.status = *status,
            None => debug!(tx_id, "state change for unknown transaction"),
        },
        LogRecord::UpdateBlock { tx_id, update } => match txs.get_mut(tx_id) {
            Some(tx) => {
                let block = tx.blocks.entry(update.seek).or_default();
                if let Some(size) = update.size {
                    block.size = size;
                }
                if let Some(local) = &update.local {
                    block.local_name = Some(local.clone());
                }
                if let Some(remote) = &update.remote {
                    block.remote_key = Some(remote.clone());
                }
                block.done |= update.done;
            }
            None => debug!(tx_id, "block change for unknown transaction"),
        },
    }
}

/// Minimal record sequence reproducing `txs`.
fn snapshot(txs: &BTreeMap<TxId, Transaction>) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for tx in txs.values() {
        records.push(LogRecord::Start {
            tx_id: tx.id,
            kind: tx.kind,
            replica_count: tx.replica_count,
            start_time: tx.start_time,
            path: tx.path.clone(),
        });
        for (seek, block) in &tx.blocks {
            records.push(LogRecord::UpdateBlock {
                tx_id: tx.id,
                update: BlockUpdate {
                    seek: *seek,
                    size: Some(block.size),
                    local: block.local_name.clone(),
                    remote: block.remote_key.clone(),
                    done: block.done,
                },
            });
        }
        if tx.status != TxStatus::Init {
            records.push(LogRecord::UpdateState {
                tx_id: tx.id,
                status: tx.status,
            });
        }
    }
    records
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// What is left to do outside the lock once a transaction failed.
struct Failure {
    path: String,
    replica_count: u8,
    /// Remote keys of blocks an upload already sent.
    orphans: Vec<String>,
}

struct Commit {
    path: String,
    file: FileItem,
    reserved: Option<ItemId>,
    /// `(staging name, remote key)` per block.
    staged: Vec<(String, String)>,
}

/// Owner of every transaction and of the transfer queues.
pub struct TransactionManager {
    cache: Arc<BlockCache>,
    namespace: Arc<Namespace>,
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    max_block_size: u64,
    wait_for_acks: u8,
    window: usize,
    compact_every: u64,
    state: Mutex<TmState>,
    changed: Condvar,
    upload_queue: Sender<Job>,
    download_queue: Sender<Job>,
    upload_jobs: AtomicU64,
    download_jobs: AtomicU64,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionManager")
            .field("transactions", &state.txs.len())
            .field("next_id", &state.next_id)
            .finish()
    }
}

impl TransactionManager {
    /// Opens the transaction log in `cache` and recovers interrupted work.
    ///
    /// INIT transactions are failed and their staging blocks purged.
    /// LOCAL_SAVED uploads have their undone blocks queued again, or are
    /// committed if every block was already acknowledged. LOCAL_SAVED
    /// downloads are checked against the namespace and queued again.
    pub fn open(
        cache: Arc<BlockCache>,
        namespace: Arc<Namespace>,
        backend: Arc<dyn Backend>,
        events: Arc<EventBus>,
        config: &ClientConfig,
    ) -> VaultResult<(Arc<Self>, JobQueues)> {
        let (log, replay) = TransactionLog::open(&cache.static_path(TRANSACTION_LOG_FILE))?;
        if replay.discarded {
            events.error("transactions", "transaction log was unreadable and has been reset");
        }
        let mut txs = BTreeMap::new();
        for record in &replay.records {
            apply(&mut txs, record);
        }
        let next_id = txs.keys().next_back().map_or(1, |id| id + 1);

        let (upload_tx, upload_rx) = unbounded();
        let (download_tx, download_rx) = unbounded();
        let queues = JobQueues {
            upload: JobQueue {
                sender: upload_tx.clone(),
                receiver: upload_rx,
            },
            download: JobQueue {
                sender: download_tx.clone(),
                receiver: download_rx,
            },
        };

        let tm = Arc::new(Self {
            cache,
            namespace,
            backend,
            events,
            max_block_size: config.max_block_size,
            wait_for_acks: config.wait_for_acks,
            window: config.transaction_window,
            compact_every: config.log_compact_every.max(1),
            state: Mutex::new(TmState { log, txs, next_id }),
            changed: Condvar::new(),
            upload_queue: upload_tx,
            download_queue: download_tx,
            upload_jobs: AtomicU64::new(0),
            download_jobs: AtomicU64::new(0),
        });
        tm.restore()?;
        Ok((tm, queues))
    }

    /// The block cache.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The backend transfers go to.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Replicas that must confirm an upload.
    pub fn wait_for_acks(&self) -> u8 {
        self.wait_for_acks
    }

    fn restore(&self) -> VaultResult<()> {
        let mut commits = Vec::new();
        let mut failed = Vec::new();
        {
            let mut st = self.state.lock();
            let pending: Vec<(TxId, TxKind, TxStatus)> = st
                .txs
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| (t.id, t.kind, t.status))
                .collect();

            for (id, kind, status) in pending {
                let resumed = match (kind, status) {
                    (TxKind::Upload, TxStatus::LocalSaved) => self.reopen_upload(&mut st, id).map(|commit| {
                        if commit {
                            commits.push(id);
                        }
                    }),
                    (TxKind::Download, TxStatus::LocalSaved) => self.rederive_download(&mut st, id),
                    _ => Err(VaultError::InvalidOperation(
                        "interrupted before its data was saved locally".to_string(),
                    )),
                };
                if let Err(e) = resumed {
                    if let Some(failure) = self.fail_locked(&mut st, id, &e.to_string())? {
                        failed.push((id, failure, e.to_string()));
                    }
                }
            }

            let referenced: HashSet<String> = st
                .txs
                .values()
                .filter(|t| !t.status.is_terminal())
                .flat_map(|t| t.blocks.values().filter_map(|b| b.local_name.clone()))
                .collect();
            let purged = self.cache.purge_staging(STAGING_PREFIX, &referenced);
            self.prune(&mut st);
            let records = snapshot(&st.txs);
            st.log.rewrite(&records)?;
            info!(
                transactions = st.txs.len(),
                committing = commits.len(),
                failed = failed.len(),
                purged,
                "restored transactions"
            );
        }

        for (id, failure, reason) in failed {
            self.report_failure(id, &failure, &reason);
        }
        for id in commits {
            self.finish_upload(id);
        }
        Ok(())
    }

    /// Reattaches staged blocks of an interrupted upload. Returns true when
    /// every block was already acknowledged and only the commit is missing.
    fn reopen_upload(&self, st: &mut TmState, id: TxId) -> VaultResult<bool> {
        let tx = st
            .txs
            .get_mut(&id)
            .ok_or_else(|| VaultError::InvalidOperation(format!("unknown transaction {}", id)))?;
        if tx.blocks.is_empty() {
            return Err(VaultError::Corruption("upload has no blocks".to_string()));
        }
        for (seek, b) in tx.blocks.iter_mut() {
            let local = b
                .local_name
                .clone()
                .ok_or_else(|| VaultError::Corruption(format!("block at {} has no staging name", seek)))?;
            let path = self.cache.dynamic_dir().join(&local);
            if !path.is_file() {
                return Err(VaultError::Corruption(format!("staging block {} is missing", local)));
            }
            let block = EncodingBlock::open_existing(&path, self.cache.context())?;
            b.checksum = Some(block.checksum()?);
            b.block = Some(Arc::new(block));
        }
        if tx.all_done() {
            return Ok(true);
        }
        for seek in tx.pending() {
            self.enqueue(TxKind::Upload, id, seek);
        }
        Ok(false)
    }

    fn rederive_download(&self, st: &mut TmState, id: TxId) -> VaultResult<()> {
        let path = match st.txs.get(&id) {
            Some(tx) => tx.path.clone(),
            None => return Ok(()),
        };
        let file = match self.namespace.find(&path)? {
            Some(NamespaceItem::File(f)) => f,
            _ => return Err(PathError::NotFound(path).into()),
        };
        let Some(tx) = st.txs.get_mut(&id) else {
            return Ok(());
        };
        for (seek, b) in tx.blocks.iter_mut() {
            let chunk = file
                .chunks
                .iter()
                .find(|c| c.seek == *seek && c.key == b.remote_key)
                .ok_or_else(|| VaultError::Corruption(format!("{} changed during download", path)))?;
            b.checksum = Some(ContentHash(chunk.checksum));
        }
        let pending = tx.pending();
        if pending.is_empty() {
            st.record(LogRecord::UpdateState {
                tx_id: id,
                status: TxStatus::Finished,
            })?;
        }
        for seek in pending {
            self.enqueue(TxKind::Download, id, seek);
        }
        Ok(())
    }

    fn enqueue(&self, kind: TxKind, tx: TxId, seek: u64) {
        let (queue, counter) = match kind {
            TxKind::Upload => (&self.upload_queue, &self.upload_jobs),
            TxKind::Download => (&self.download_queue, &self.download_jobs),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if queue.send(Job::Transfer { tx, seek, attempt: 0 }).is_err() {
            warn!(tx_id = tx, seek, kind = %kind, "transfer queue closed, job left for recovery");
        }
    }

    /// Transfer jobs queued so far (first attempts only).
    pub fn jobs_queued(&self, kind: TxKind) -> u64 {
        match kind {
            TxKind::Upload => self.upload_jobs.load(Ordering::Relaxed),
            TxKind::Download => self.download_jobs.load(Ordering::Relaxed),
        }
    }

    /// Creates an empty staging block for an upload, after making room for
    /// a full-size block.
    pub fn new_data_block(&self) -> VaultResult<EncodingBlock> {
        if let Err(e) = self.cache.reserve(expected_ciphertext_len(self.max_block_size)) {
            let err = VaultError::from(e);
            self.events
                .critical("upload", format!("cannot stage a new block: {}", err));
            return Err(err);
        }
        let name = format!("{}{}", STAGING_PREFIX, Uuid::new_v4().simple());
        let block = EncodingBlock::create(&self.cache.dynamic_dir().join(&name), self.cache.context())?;
        Ok(block)
    }

    /// Begins an upload to `path`, reserving the file's item id. The replica
    /// count comes from the parent directory.
    pub fn start_upload(&self, path: &str) -> VaultResult<TxId> {
        let path = normalize_path(path)?;
        let (parent_path, _) = split_parent(&path)?;
        let parent = self.namespace.resolve_dir(&parent_path)?;
        if let Some(NamespaceItem::Directory(_)) = self.namespace.find(&path)? {
            return Err(PathError::NotAFile(path).into());
        }
        let reserved = self.namespace.reserve_id()?;

        let mut st = self.state.lock();
        let id = st.next_id;
        st.next_id += 1;
        let started = st.record(LogRecord::Start {
            tx_id: id,
            kind: TxKind::Upload,
            replica_count: parent.replica_count,
            start_time: now_secs(),
            path: path.clone(),
        });
        if let Err(e) = started {
            self.namespace.release_id(reserved);
            return Err(e);
        }
        if let Some(tx) = st.txs.get_mut(&id) {
            tx.reserved_id = Some(reserved);
        }
        self.maybe_compact(&mut st);
        debug!(tx_id = id, path = %path, replica_count = parent.replica_count, "started upload");
        Ok(id)
    }

    /// Finalizes `block` and attaches it to an upload at offset `seek`.
    ///
    /// On error the block file is removed.
    pub fn add_upload_block(&self, tx: TxId, seek: u64, block: EncodingBlock) -> VaultResult<()> {
        let checksum = match block.finalize().and_then(|_| block.checksum()) {
            Ok(sum) => sum,
            Err(e) => {
                block.remove();
                return Err(e.into());
            }
        };

        let mut st = self.state.lock();
        let accepting = matches!(
            st.txs.get(&tx),
            Some(t) if t.kind == TxKind::Upload && t.status == TxStatus::Init
        );
        if !accepting {
            block.remove();
            return Err(VaultError::InvalidOperation(format!(
                "transaction {} is not accepting blocks",
                tx
            )));
        }
        let update = BlockUpdate {
            seek,
            size: Some(block.plain_len()),
            local: Some(block.name()),
            remote: None,
            done: false,
        };
        if let Err(e) = st.record(LogRecord::UpdateBlock { tx_id: tx, update }) {
            block.remove();
            return Err(e);
        }
        if let Some(b) = st.txs.get_mut(&tx).and_then(|t| t.blocks.get_mut(&seek)) {
            b.checksum = Some(checksum);
            b.block = Some(Arc::new(block));
        }
        self.maybe_compact(&mut st);
        Ok(())
    }

    /// Marks an upload LOCAL_SAVED and queues one transfer per block.
    pub fn commit_upload(&self, tx: TxId) -> VaultResult<()> {
        let seeks = {
            let mut st = self.state.lock();
            let seeks = match st.txs.get(&tx) {
                Some(t) if t.kind == TxKind::Upload && t.status == TxStatus::Init && !t.blocks.is_empty() => {
                    t.pending()
                }
                Some(_) => {
                    return Err(VaultError::InvalidOperation(format!(
                        "transaction {} cannot be committed",
                        tx
                    )))
                }
                None => return Err(VaultError::InvalidOperation(format!("unknown transaction {}", tx))),
            };
            st.record(LogRecord::UpdateState {
                tx_id: tx,
                status: TxStatus::LocalSaved,
            })?;
            self.maybe_compact(&mut st);
            seeks
        };
        info!(tx_id = tx, blocks = seeks.len(), "upload saved locally");
        for seek in seeks {
            self.enqueue(TxKind::Upload, tx, seek);
        }
        Ok(())
    }

    /// Records an empty file at `path` without a transaction.
    pub fn save_empty_file(&self, path: &str) -> VaultResult<()> {
        let path = normalize_path(path)?;
        let (parent_path, _) = split_parent(&path)?;
        let parent = self.namespace.resolve_dir(&parent_path)?;
        let file = FileItem::new("", parent.replica_count);
        if let Some(old) = self.namespace.upsert_file(&path, file, None)? {
            self.delete_chunks(&old, &HashSet::new());
        }
        info!(path = %path, "saved empty file");
        Ok(())
    }

    /// Forces a transaction to FAILED.
    pub fn fail(&self, tx: TxId, reason: &str) {
        let failed = {
            let mut st = self.state.lock();
            let failed = self.fail_locked(&mut st, tx, reason);
            self.prune(&mut st);
            self.maybe_compact(&mut st);
            failed
        };
        match failed {
            Ok(Some(failure)) => self.report_failure(tx, &failure, reason),
            Ok(None) => {}
            Err(e) => warn!(tx_id = tx, error = %e, "could not record transaction failure"),
        }
    }

    /// Emits the failure event and deletes the blocks a failed upload had
    /// already sent.
    fn report_failure(&self, tx: TxId, failure: &Failure, reason: &str) {
        self.events.error(
            "transactions",
            format!("transaction {} on {} failed: {}", tx, failure.path, reason),
        );
        for key in &failure.orphans {
            if let Err(e) = self.cache.remove_entry(key) {
                debug!(key = %key, error = %e, "could not drop alias");
            }
            match self.backend.delete(key, failure.replica_count) {
                Ok(_) => debug!(tx_id = tx, key = %key, "deleted orphaned chunk"),
                Err(e) => warn!(tx_id = tx, key = %key, error = %e, "could not delete orphaned chunk"),
            }
        }
    }

    fn fail_locked(&self, st: &mut TmState, id: TxId, reason: &str) -> VaultResult<Option<Failure>> {
        match st.txs.get(&id) {
            Some(tx) if !tx.status.is_terminal() => {}
            _ => return Ok(None),
        }
        st.record(LogRecord::UpdateState {
            tx_id: id,
            status: TxStatus::Failed,
        })?;
        let Some(tx) = st.txs.get_mut(&id) else {
            return Ok(None);
        };
        tx.error = Some(reason.to_string());
        if let Some(reserved) = tx.reserved_id.take() {
            self.namespace.release_id(reserved);
        }
        let mut orphans = Vec::new();
        if tx.kind == TxKind::Upload {
            for b in tx.blocks.values_mut() {
                if let Some(block) = b.block.take() {
                    block.remove();
                }
                if let Some(key) = b.remote_key.clone().filter(|_| b.done) {
                    orphans.push(key);
                }
            }
        }
        self.changed.notify_all();
        Ok(Some(Failure {
            path: tx.path.clone(),
            replica_count: tx.replica_count,
            orphans,
        }))
    }

    /// Reports a transfer that will not be retried.
    pub fn transfer_failed(&self, tx: TxId, seek: u64, error: VaultError) {
        if error.is_resource() {
            self.events
                .critical("transactions", format!("transaction {} ran out of local resources: {}", tx, error));
        }
        self.fail(tx, &format!("block at offset {}: {}", seek, error));
    }

    /// The block an upload worker should send, or `None` when the job is
    /// stale (transaction over or block already sent).
    pub fn upload_source(&self, tx: TxId, seek: u64) -> VaultResult<Option<UploadSource>> {
        let st = self.state.lock();
        let Some(t) = st
            .txs
            .get(&tx)
            .filter(|t| t.kind == TxKind::Upload && t.status == TxStatus::LocalSaved)
        else {
            return Ok(None);
        };
        match t.blocks.get(&seek) {
            Some(b) if !b.done => match &b.block {
                Some(block) => Ok(Some(UploadSource {
                    block: block.clone(),
                    replica_count: t.replica_count,
                })),
                None => Err(VaultError::Corruption(format!(
                    "block at {} of transaction {} has no local data",
                    seek, tx
                ))),
            },
            _ => Ok(None),
        }
    }

    /// Records an acknowledged upload block. The last one commits the file
    /// to the namespace.
    pub fn block_uploaded(&self, tx: TxId, seek: u64, remote_key: &str) -> VaultResult<()> {
        let complete = {
            let mut st = self.state.lock();
            let pending = st
                .txs
                .get(&tx)
                .filter(|t| t.status == TxStatus::LocalSaved)
                .and_then(|t| t.blocks.get(&seek))
                .is_some_and(|b| !b.done);
            if !pending {
                return Ok(());
            }
            st.record(LogRecord::UpdateBlock {
                tx_id: tx,
                update: BlockUpdate {
                    seek,
                    remote: Some(remote_key.to_string()),
                    done: true,
                    ..BlockUpdate::default()
                },
            })?;
            self.changed.notify_all();
            self.maybe_compact(&mut st);
            st.txs.get(&tx).is_some_and(|t| t.all_done())
        };
        debug!(tx_id = tx, seek, remote_key, "block uploaded");
        if complete {
            self.finish_upload(tx);
        }
        Ok(())
    }

    fn prepare_commit(tx: &Transaction) -> VaultResult<Commit> {
        let mut file = FileItem::new("", tx.replica_count);
        let mut staged = Vec::new();
        for (seek, b) in &tx.blocks {
            let key = b
                .remote_key
                .clone()
                .ok_or_else(|| VaultError::Corruption(format!("block at {} has no remote key", seek)))?;
            let checksum = b
                .checksum
                .ok_or_else(|| VaultError::Corruption(format!("block at {} has no checksum", seek)))?;
            if let Some(local) = &b.local_name {
                staged.push((local.clone(), key.clone()));
            }
            file.chunks.push(Chunk {
                key: Some(key),
                checksum: checksum.0,
                seek: *seek,
                size: b.size,
            });
            file.size += b.size;
        }
        if !file.is_complete() {
            return Err(VaultError::Corruption(format!("blocks of {} leave gaps", tx.path)));
        }
        Ok(Commit {
            path: tx.path.clone(),
            file,
            reserved: tx.reserved_id,
            staged,
        })
    }

    fn apply_commit(&self, commit: &Commit) -> VaultResult<Option<FileItem>> {
        for (local, remote) in &commit.staged {
            self.cache.make_alias(local, remote)?;
        }
        self.namespace
            .upsert_file(&commit.path, commit.file.clone(), commit.reserved)
    }

    /// Commits a fully acknowledged upload to the namespace.
    fn finish_upload(&self, tx: TxId) {
        let prepared = {
            let st = self.state.lock();
            match st
                .txs
                .get(&tx)
                .filter(|t| t.kind == TxKind::Upload && t.status == TxStatus::LocalSaved)
            {
                Some(t) => Self::prepare_commit(t),
                None => return,
            }
        };
        let commit = match prepared {
            Ok(commit) => commit,
            Err(e) => {
                self.fail(tx, &e.to_string());
                return;
            }
        };

        match self.apply_commit(&commit) {
            Ok(replaced) => {
                {
                    let mut st = self.state.lock();
                    if let Err(e) = st.record(LogRecord::UpdateState {
                        tx_id: tx,
                        status: TxStatus::Finished,
                    }) {
                        warn!(tx_id = tx, error = %e, "could not record finished upload");
                    }
                    if let Some(t) = st.txs.get_mut(&tx) {
                        t.reserved_id = None;
                        for b in t.blocks.values_mut() {
                            b.block = None;
                        }
                    }
                    self.changed.notify_all();
                    self.prune(&mut st);
                    self.maybe_compact(&mut st);
                }
                self.events.info(
                    "upload",
                    format!("{} uploaded ({} bytes, {} chunks)", commit.path, commit.file.size, commit.file.chunks.len()),
                );
                if let Some(old) = replaced {
                    let keep: HashSet<String> = commit.staged.iter().map(|(_, remote)| remote.clone()).collect();
                    self.delete_chunks(&old, &keep);
                }
            }
            Err(e) => self.fail(tx, &format!("namespace update failed: {}", e)),
        }
    }

    /// Deletes the cached and remote copies of a file's chunks, except keys
    /// in `keep`. Failures are logged.
    pub fn delete_chunks(&self, file: &FileItem, keep: &HashSet<String>) {
        for key in file.chunks.iter().filter_map(|c| c.key.as_deref()) {
            if keep.contains(key) {
                continue;
            }
            if let Err(e) = self.cache.remove_entry(key) {
                debug!(key, error = %e, "could not drop cached chunk");
            }
            match self.backend.delete(key, file.replica_count) {
                Ok(_) => debug!(key, "deleted remote chunk"),
                Err(e) => warn!(key, error = %e, "failed to delete remote chunk"),
            }
        }
    }

    /// True when the chunk is cached and decrypts to its checksum. A cached
    /// copy that does not is removed.
    fn cached_intact(&self, chunk: &Chunk) -> bool {
        match chunk.key.as_deref() {
            Some(key) => self.cached_matches(key, &ContentHash(chunk.checksum)),
            None => false,
        }
    }

    /// True when `key` is cached and decrypts to `checksum`. A cached copy
    /// that does not is removed.
    pub fn cached_matches(&self, key: &str, checksum: &ContentHash) -> bool {
        if !self.cache.contains(key) {
            return false;
        }
        let verdict = self
            .cache
            .path_for(key)
            .and_then(|path| EncodingBlock::open_existing(&path, self.cache.context()))
            .and_then(|block| block.checksum());
        match verdict {
            Ok(sum) if sum == *checksum => return true,
            Ok(sum) => warn!(key, actual = %sum, "cached block does not match its checksum, fetching again"),
            Err(e) => warn!(key, error = %e, "cached block unreadable, fetching again"),
        }
        if let Err(e) = self.cache.remove_entry(key) {
            debug!(key, error = %e, "could not drop damaged block");
        }
        false
    }

    /// Begins reading the file at `path`. Intact cached chunks count as
    /// done; the rest are queued for download.
    pub fn start_download(&self, path: &str) -> VaultResult<(TxId, FileItem)> {
        let path = normalize_path(path)?;
        let file = match self.namespace.find(&path)? {
            Some(NamespaceItem::File(f)) => f,
            Some(NamespaceItem::Directory(_)) => return Err(PathError::NotAFile(path).into()),
            None => return Err(PathError::NotFound(path).into()),
        };
        if !file.is_complete() {
            return Err(VaultError::Corruption(format!("{} has an incomplete chunk list", path)));
        }
        let cached: Vec<bool> = file.chunks.iter().map(|c| self.cached_intact(c)).collect();

        let (id, pending) = {
            let mut st = self.state.lock();
            let id = st.next_id;
            st.next_id += 1;
            st.record(LogRecord::Start {
                tx_id: id,
                kind: TxKind::Download,
                replica_count: file.replica_count,
                start_time: now_secs(),
                path: path.clone(),
            })?;
            for (chunk, done) in file.chunks.iter().zip(&cached) {
                st.record(LogRecord::UpdateBlock {
                    tx_id: id,
                    update: BlockUpdate {
                        seek: chunk.seek,
                        size: Some(chunk.size),
                        local: None,
                        remote: chunk.key.clone(),
                        done: *done,
                    },
                })?;
                if let Some(b) = st.txs.get_mut(&id).and_then(|t| t.blocks.get_mut(&chunk.seek)) {
                    b.checksum = Some(ContentHash(chunk.checksum));
                }
            }
            st.record(LogRecord::UpdateState {
                tx_id: id,
                status: TxStatus::LocalSaved,
            })?;
            let pending = st.txs.get(&id).map(|t| t.pending()).unwrap_or_default();
            if pending.is_empty() {
                st.record(LogRecord::UpdateState {
                    tx_id: id,
                    status: TxStatus::Finished,
                })?;
                self.changed.notify_all();
                self.prune(&mut st);
            }
            self.maybe_compact(&mut st);
            (id, pending)
        };
        debug!(tx_id = id, path = %path, chunks = file.chunks.len(), pending = pending.len(), "started download");
        for seek in pending {
            self.enqueue(TxKind::Download, id, seek);
        }
        Ok((id, file))
    }

    /// The chunk a download worker should fetch, or `None` when the job is stale.
    pub fn download_target(&self, tx: TxId, seek: u64) -> VaultResult<Option<DownloadTarget>> {
        let st = self.state.lock();
        let Some(t) = st
            .txs
            .get(&tx)
            .filter(|t| t.kind == TxKind::Download && t.status == TxStatus::LocalSaved)
        else {
            return Ok(None);
        };
        let Some(b) = t.blocks.get(&seek).filter(|b| !b.done) else {
            return Ok(None);
        };
        let key = b
            .remote_key
            .clone()
            .ok_or_else(|| VaultError::Corruption(format!("chunk at {} has no remote key", seek)))?;
        let checksum = b
            .checksum
            .ok_or_else(|| VaultError::Corruption(format!("chunk at {} has no checksum", seek)))?;
        Ok(Some(DownloadTarget {
            key,
            checksum,
            size: b.size,
            replica_count: t.replica_count,
        }))
    }

    /// Records a verified downloaded block.
    pub fn block_downloaded(&self, tx: TxId, seek: u64) -> VaultResult<()> {
        let mut st = self.state.lock();
        let pending = st
            .txs
            .get(&tx)
            .filter(|t| t.status == TxStatus::LocalSaved)
            .and_then(|t| t.blocks.get(&seek))
            .is_some_and(|b| !b.done);
        if !pending {
            return Ok(());
        }
        st.record(LogRecord::UpdateBlock {
            tx_id: tx,
            update: BlockUpdate {
                seek,
                done: true,
                ..BlockUpdate::default()
            },
        })?;
        if st.txs.get(&tx).is_some_and(|t| t.all_done()) {
            st.record(LogRecord::UpdateState {
                tx_id: tx,
                status: TxStatus::Finished,
            })?;
            debug!(tx_id = tx, "download finished");
        }
        self.changed.notify_all();
        self.prune(&mut st);
        self.maybe_compact(&mut st);
        Ok(())
    }

    /// Blocks until the block at `seek` is local, the transaction fails, or
    /// `timeout` passes.
    pub fn wait_block(&self, tx: TxId, seek: u64, timeout: Duration) -> VaultResult<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            match st.txs.get(&tx) {
                None => {
                    debug!(tx_id = tx, "transaction left the window while waiting");
                    return Ok(());
                }
                Some(t) if t.status == TxStatus::Failed => {
                    return Err(VaultError::TransactionFailed {
                        tx_id: tx,
                        reason: t.error.clone().unwrap_or_default(),
                    });
                }
                Some(t) if t.status == TxStatus::Finished || t.blocks.get(&seek).map_or(true, |b| b.done) => {
                    return Ok(());
                }
                Some(_) => {}
            }
            if self.changed.wait_until(&mut st, deadline).timed_out() {
                return Err(VaultError::Timeout(format!(
                    "block at {} of transaction {}",
                    seek, tx
                )));
            }
        }
    }

    /// Every transaction in the window.
    pub fn operations(&self) -> Vec<OperationInfo> {
        self.state.lock().txs.values().map(Transaction::info).collect()
    }

    /// True while any transaction is INIT or LOCAL_SAVED.
    pub fn has_incomplete(&self) -> bool {
        self.state
            .lock()
            .txs
            .values()
            .any(|t| !t.status.is_terminal())
    }

    /// Waits until no transaction is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if st.txs.values().all(|t| t.status.is_terminal()) {
                return true;
            }
            if self.changed.wait_until(&mut st, deadline).timed_out() {
                return st.txs.values().all(|t| t.status.is_terminal());
            }
        }
    }

    /// Drops the oldest terminal transactions beyond the window.
    fn prune(&self, st: &mut TmState) {
        let terminal: Vec<TxId> = st
            .txs
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        let keep = self.window.max(1);
        if terminal.len() > keep {
            for id in &terminal[..terminal.len() - keep] {
                st.txs.remove(id);
            }
        }
    }

    fn maybe_compact(&self, st: &mut TmState) {
        if st.log.appended_since_rewrite() < self.compact_every {
            return;
        }
        let records = snapshot(&st.txs);
        if let Err(e) = st.log.rewrite(&records) {
            warn!(error = %e, "transaction log compaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::journal::Journal;
    use vaultfs_meta::{MemoryKvStore, NamespaceIndex};
    use vaultfs_storage::{AccountKeys, BlockContext, BlockIoConfig, CacheConfig, FixedFreeSpace};

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: Arc<MemoryBackend>,
        cache: Arc<BlockCache>,
        namespace: Arc<Namespace>,
        config: ClientConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(AccountKeys::generate());
        let backend = Arc::new(MemoryBackend::new());
        let io = BlockIoConfig {
            read_retry_count: 2,
            read_retry_sleep: Duration::from_millis(1),
        };
        let cache = Arc::new(
            BlockCache::open(
                dir.path(),
                CacheConfig::default(),
                BlockContext::new(keys.clone(), io),
                Arc::new(FixedFreeSpace::new(1 << 40)),
            )
            .unwrap(),
        );
        let journal = Arc::new(
            Journal::open(
                &cache.static_path("journal.bin"),
                keys,
                backend.clone(),
                Arc::new(EventBus::new()),
                2,
                2,
            )
            .unwrap(),
        );
        let index = NamespaceIndex::open(Arc::new(MemoryKvStore::new())).unwrap();
        let namespace = Arc::new(Namespace::new(index, journal, 2));
        namespace.init_root().unwrap();
        Fixture {
            _dir: dir,
            backend,
            cache,
            namespace,
            config: ClientConfig {
                max_block_size: 1000,
                ..ClientConfig::default()
            },
        }
    }

    fn open_tm(fx: &Fixture) -> (Arc<TransactionManager>, JobQueues) {
        TransactionManager::open(
            fx.cache.clone(),
            fx.namespace.clone(),
            fx.backend.clone(),
            Arc::new(EventBus::new()),
            &fx.config,
        )
        .unwrap()
    }

    fn staged(tm: &TransactionManager, data: &[u8]) -> EncodingBlock {
        let block = tm.new_data_block().unwrap();
        block.write(data).unwrap();
        block
    }

    fn upload(tm: &TransactionManager, path: &str, parts: &[&[u8]]) -> TxId {
        let tx = tm.start_upload(path).unwrap();
        let mut seek = 0;
        for part in parts {
            tm.add_upload_block(tx, seek, staged(tm, part)).unwrap();
            seek += part.len() as u64;
        }
        tm.commit_upload(tx).unwrap();
        seek = 0;
        for part in parts {
            tm.block_uploaded(tx, seek, &format!("r{}-{}", tx, seek)).unwrap();
            seek += part.len() as u64;
        }
        tx
    }

    fn status_of(tm: &TransactionManager, tx: TxId) -> TxStatus {
        tm.operations().into_iter().find(|o| o.id == tx).unwrap().status
    }

    #[test]
    fn test_upload_reaches_finished() {
        let fx = fixture();
        let (tm, queues) = open_tm(&fx);
        let tx = tm.start_upload("/a.bin").unwrap();
        tm.add_upload_block(tx, 0, staged(&tm, b"hello")).unwrap();
        tm.add_upload_block(tx, 5, staged(&tm, b"world")).unwrap();
        tm.commit_upload(tx).unwrap();
        assert_eq!(queues.upload.receiver.len(), 2);
        assert_eq!(tm.jobs_queued(TxKind::Upload), 2);
        assert_eq!(status_of(&tm, tx), TxStatus::LocalSaved);

        let source = tm.upload_source(tx, 0).unwrap().unwrap();
        assert_eq!(source.replica_count, 2);
        tm.block_uploaded(tx, 0, "r0").unwrap();
        assert!(tm.has_incomplete());
        assert!(tm.upload_source(tx, 0).unwrap().is_none());
        tm.block_uploaded(tx, 5, "r5").unwrap();
        assert!(!tm.has_incomplete());

        let op = tm.operations().pop().unwrap();
        assert_eq!(op.status, TxStatus::Finished);
        assert_eq!(op.size, 10);
        assert_eq!(op.blocks_done, 2);

        let item = fx.namespace.find("/a.bin").unwrap().unwrap();
        let file = item.as_file().unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(file.chunks[1].key.as_deref(), Some("r5"));
        assert_eq!(file.chunks[0].checksum, ContentHash::compute(b"hello").0);
        assert!(fx.cache.contains("r0"));
    }

    #[test]
    fn test_replica_count_follows_parent() {
        let fx = fixture();
        let (tm, _queues) = open_tm(&fx);
        let dir = vaultfs_meta::DirectoryItem::new("triple", 3);
        fx.namespace.insert("/", dir.into()).unwrap();
        let tx = upload(&tm, "/triple/x", &[b"abc"]);
        let file = fx.namespace.find("/triple/x").unwrap().unwrap();
        assert_eq!(file.replica_count(), 3);
        assert_eq!(status_of(&tm, tx), TxStatus::Finished);
    }

    #[test]
    fn test_namespace_failure_fails_transaction() {
        let fx = fixture();
        let (tm, _queues) = open_tm(&fx);
        let dir = fx.namespace.mkdir("/d").unwrap();
        let tx = tm.start_upload("/d/x").unwrap();
        tm.add_upload_block(tx, 0, staged(&tm, b"data")).unwrap();
        tm.commit_upload(tx).unwrap();
        fx.namespace.remove(dir.item_id).unwrap();

        tm.block_uploaded(tx, 0, "r0").unwrap();
        let op = tm.operations().pop().unwrap();
        assert_eq!(op.status, TxStatus::Failed);
        assert!(op.error.unwrap().contains("namespace update failed"));
        assert!(!fx.cache.contains("r0"));
    }

    #[test]
    fn test_failed_upload_deletes_sent_blocks() {
        let fx = fixture();
        let (tm, _queues) = open_tm(&fx);
        let tx = tm.start_upload("/two.bin").unwrap();
        tm.add_upload_block(tx, 0, staged(&tm, b"first")).unwrap();
        tm.add_upload_block(tx, 5, staged(&tm, b"second")).unwrap();
        tm.commit_upload(tx).unwrap();

        let sent = fx.backend.put(b"first ciphertext", None, 2, 2).unwrap().remote_key;
        tm.block_uploaded(tx, 0, &sent).unwrap();
        assert!(fx.backend.contains(&sent));

        tm.transfer_failed(tx, 5, VaultError::Protocol("replicas refused".into()));
        let op = tm.operations().pop().unwrap();
        assert_eq!(op.status, TxStatus::Failed);
        assert_eq!(op.blocks_done, 1);
        assert!(!fx.backend.contains(&sent));
        assert!(fx.namespace.find("/two.bin").unwrap().is_none());
    }

    #[test]
    fn test_restore_fails_init_and_purges_blocks() {
        let fx = fixture();
        let name = {
            let (tm, _queues) = open_tm(&fx);
            let tx = tm.start_upload("/a.bin").unwrap();
            let block = staged(&tm, b"partial");
            let name = block.name();
            tm.add_upload_block(tx, 0, block).unwrap();
            name
        };
        assert!(fx.cache.dynamic_dir().join(&name).exists());

        let (tm, _queues) = open_tm(&fx);
        let op = tm.operations().pop().unwrap();
        assert_eq!(op.status, TxStatus::Failed);
        assert!(!fx.cache.dynamic_dir().join(&name).exists());
        assert!(!tm.has_incomplete());
    }

    #[test]
    fn test_restore_resumes_local_saved_upload() {
        let fx = fixture();
        let tx = {
            let (tm, _queues) = open_tm(&fx);
            let tx = tm.start_upload("/a.bin").unwrap();
            tm.add_upload_block(tx, 0, staged(&tm, b"hello")).unwrap();
            tm.add_upload_block(tx, 5, staged(&tm, b"world")).unwrap();
            tm.commit_upload(tx).unwrap();
            tm.block_uploaded(tx, 0, "r0").unwrap();
            tx
        };

        let (tm, queues) = open_tm(&fx);
        assert_eq!(status_of(&tm, tx), TxStatus::LocalSaved);
        assert_eq!(queues.upload.receiver.len(), 1);
        assert!(matches!(
            queues.upload.receiver.try_recv(),
            Ok(Job::Transfer { seek: 5, .. })
        ));
        tm.block_uploaded(tx, 5, "r5").unwrap();
        assert_eq!(status_of(&tm, tx), TxStatus::Finished);
        let file = fx.namespace.find("/a.bin").unwrap().unwrap();
        assert_eq!(file.size(), 10);
        assert_eq!(
            file.as_file().unwrap().chunks[1].checksum,
            ContentHash::compute(b"world").0
        );
    }

    #[test]
    fn test_download_uses_intact_cache() {
        let fx = fixture();
        let (tm, queues) = open_tm(&fx);
        let up = upload(&tm, "/a.bin", &[b"hello", b"world"]);

        let (tx, file) = tm.start_download("/a.bin").unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(status_of(&tm, tx), TxStatus::Finished);
        assert!(queues.download.receiver.is_empty());

        let key = format!("r{}-5", up);
        let path = fx.cache.path_for(&key).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len / 2)
            .unwrap();

        let (tx, _) = tm.start_download("/a.bin").unwrap();
        assert_eq!(status_of(&tm, tx), TxStatus::LocalSaved);
        assert_eq!(queues.download.receiver.len(), 1);
        let target = tm.download_target(tx, 5).unwrap().unwrap();
        assert_eq!(target.key, key);
        assert_eq!(target.checksum, ContentHash::compute(b"world"));
        assert!(tm.download_target(tx, 0).unwrap().is_none());

        tm.block_downloaded(tx, 5).unwrap();
        assert_eq!(status_of(&tm, tx), TxStatus::Finished);
        tm.wait_block(tx, 5, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_wait_block_reports_failure_and_timeout() {
        let fx = fixture();
        let (tm, _queues) = open_tm(&fx);
        let up = upload(&tm, "/a.bin", &[b"hello"]);
        fx.cache.remove_entry(&format!("r{}-0", up)).unwrap();

        let (tx, _) = tm.start_download("/a.bin").unwrap();
        let err = tm.wait_block(tx, 0, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, VaultError::Timeout(_)));

        tm.transfer_failed(tx, 0, VaultError::Corruption("bad".into()));
        let err = tm.wait_block(tx, 0, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, VaultError::TransactionFailed { .. }));
    }

    #[test]
    fn test_window_keeps_recent_terminal() {
        let mut fx = fixture();
        fx.config.transaction_window = 2;
        fx.config.log_compact_every = 3;
        let last = {
            let (tm, _queues) = open_tm(&fx);
            let mut last = 0;
            for i in 0..4 {
                last = tm.start_upload(&format!("/f{}", i)).unwrap();
                tm.fail(last, "test");
            }
            assert_eq!(tm.operations().len(), 2);
            last
        };
        let (tm, _queues) = open_tm(&fx);
        let ids: Vec<TxId> = tm.operations().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![last - 1, last]);
        assert_eq!(tm.start_upload("/next").unwrap(), last + 1);
    }

    #[test]
    fn test_empty_file_replaces_existing() {
        let fx = fixture();
        let (tm, _queues) = open_tm(&fx);
        let up = upload(&tm, "/a.bin", &[b"hello"]);
        let key = format!("r{}-0", up);
        fx.backend.put(b"x", Some(&key), 2, 2).unwrap();

        tm.save_empty_file("/a.bin").unwrap();
        let file = fx.namespace.find("/a.bin").unwrap().unwrap();
        assert_eq!(file.size(), 0);
        assert!(!fx.backend.contains(&key));
    }
}
