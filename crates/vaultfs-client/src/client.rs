//! The engine facade used by front-ends.
//!
//! [`VaultFs`] owns every component of one account: cache, journal,
//! namespace, transaction manager and the background threads. There are no
//! process-wide singletons; two instances with different cache directories
//! are independent.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vaultfs_meta::{
    join_path, normalize_path, split_parent, split_path, Chunk, DirectoryItem, FileKvStore, ItemId,
    NamespaceIndex, NamespaceItem, PathError, Timestamp,
};
use vaultfs_storage::{
    AccountKeys, BlockCache, BlockContext, CacheStats, CapacityMonitor, FreeSpaceProbe, StatvfsProbe,
};

use crate::backend::Backend;
use crate::config::ClientConfig;
use crate::error::{VaultError, VaultResult};
use crate::events::{EventBus, EventLevel, EventListener};
use crate::file::SmartFile;
use crate::journal::{Journal, JournalStatus, JournalSynchronizer};
use crate::namespace::Namespace;
use crate::transactions::{OperationInfo, TransactionManager};
use crate::workers::{DownloadHandler, UploadHandler, WorkerPool};

/// Name of the journal file in the static cache area.
pub const JOURNAL_FILE: &str = "journal.bin";
/// Name of the namespace index file in the static cache area.
pub const INDEX_FILE: &str = "namespace_index.kv";

/// A namespace entry as shown to front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    /// Absolute path.
    pub path: String,
    /// Last path component, empty for the root.
    pub name: String,
    /// Directory or file.
    pub is_dir: bool,
    /// Bytes, zero for directories.
    pub size: u64,
    /// Backend replicas.
    pub replica_count: u8,
    /// Creation time.
    pub create_date: Timestamp,
    /// Last child change, directories only.
    pub last_modify_date: Option<Timestamp>,
    /// Chunks of a file.
    pub chunks: Vec<Chunk>,
}

impl ItemInfo {
    fn new(path: String, item: &NamespaceItem) -> Self {
        let (last_modify_date, chunks) = match item {
            NamespaceItem::Directory(d) => (Some(d.last_modify_date), Vec::new()),
            NamespaceItem::File(f) => (None, f.chunks.clone()),
        };
        Self {
            path,
            name: item.name().to_string(),
            is_dir: item.is_dir(),
            size: item.size(),
            replica_count: item.replica_count(),
            create_date: item.create_date(),
            last_modify_date,
            chunks,
        }
    }
}

struct Services {
    uploads: WorkerPool,
    downloads: WorkerPool,
    synchronizer: JournalSynchronizer,
    monitor: CapacityMonitor,
}

/// One account's encrypted, replicated file namespace.
pub struct VaultFs {
    config: ClientConfig,
    events: Arc<EventBus>,
    cache: Arc<BlockCache>,
    journal: Arc<Journal>,
    namespace: Arc<Namespace>,
    tm: Arc<TransactionManager>,
    services: Mutex<Option<Services>>,
}

impl std::fmt::Debug for VaultFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultFs")
            .field("cache_dir", &self.config.cache_dir)
            .field("journal", &self.journal)
            .field("transactions", &self.tm)
            .finish()
    }
}

fn open_index(path: &std::path::Path, events: &EventBus) -> VaultResult<NamespaceIndex> {
    let opened = FileKvStore::open(path).and_then(|kv| NamespaceIndex::open(Arc::new(kv)));
    match opened {
        Ok(index) => Ok(index),
        Err(e) => {
            events.warning("namespace", format!("namespace index unreadable, rebuilding: {}", e));
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            Ok(NamespaceIndex::open(Arc::new(FileKvStore::open(path)?))?)
        }
    }
}

impl VaultFs {
    /// Opens the engine, measuring free space on the cache's file system.
    pub fn open(config: ClientConfig, keys: Arc<AccountKeys>, backend: Arc<dyn Backend>) -> VaultResult<Self> {
        Self::open_with_probe(config, keys, backend, Arc::new(StatvfsProbe))
    }

    /// Opens the engine with a custom free-space probe.
    ///
    /// Interrupted transactions are recovered and the worker pools,
    /// journal synchronizer and capacity monitor are started.
    pub fn open_with_probe(
        config: ClientConfig,
        keys: Arc<AccountKeys>,
        backend: Arc<dyn Backend>,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> VaultResult<Self> {
        config
            .validate()
            .map_err(|e| VaultError::InvalidOperation(format!("invalid configuration: {}", e)))?;
        let events = Arc::new(EventBus::new());
        let ctx = BlockContext::new(keys.clone(), config.block_io());
        let cache = Arc::new(BlockCache::open(&config.cache_dir, config.cache.clone(), ctx, probe)?);

        let journal = Arc::new(Journal::open(
            &cache.static_path(JOURNAL_FILE),
            keys,
            backend.clone(),
            events.clone(),
            config.default_replica_count,
            config.wait_for_acks,
        )?);
        if !journal.is_initialized() {
            match journal.pull() {
                Ok(true) => info!("restored journal from backend"),
                Ok(false) => debug!("no replicated journal for this account"),
                Err(e) => warn!(error = %e, "could not pull journal"),
            }
        }

        let index = open_index(&cache.static_path(INDEX_FILE), &events)?;
        let namespace = Arc::new(Namespace::new(index, journal.clone(), config.default_replica_count));
        if journal.is_initialized() {
            namespace.ensure_consistent()?;
        }

        let (tm, queues) =
            TransactionManager::open(cache.clone(), namespace.clone(), backend, events.clone(), &config)?;
        let uploads = WorkerPool::start(
            config.upload_workers,
            queues.upload,
            Arc::new(UploadHandler::new(tm.clone())),
            config.retry,
            events.clone(),
        )?;
        let downloads = WorkerPool::start(
            config.download_workers,
            queues.download,
            Arc::new(DownloadHandler::new(tm.clone())),
            config.retry,
            events.clone(),
        )?;
        let synchronizer = JournalSynchronizer::start(journal.clone(), config.journal_sync_interval())?;
        let monitor = CapacityMonitor::start(
            cache.clone(),
            Duration::from_secs(config.cache.check_interval_secs.max(1)),
        )?;
        info!(
            cache_dir = ?config.cache_dir,
            registered = journal.is_initialized(),
            "vaultfs opened"
        );

        Ok(Self {
            config,
            events,
            cache,
            journal,
            namespace,
            tm,
            services: Mutex::new(Some(Services {
                uploads,
                downloads,
                synchronizer,
                monitor,
            })),
        })
    }

    /// True once the account has a journal, local or pulled.
    pub fn is_registered(&self) -> bool {
        self.journal.is_initialized()
    }

    /// Creates the account's namespace, or adopts the replicated one when
    /// the backend already holds a journal for these keys.
    pub fn register(&self) -> VaultResult<()> {
        if self.is_registered() {
            return Err(VaultError::InvalidOperation("account is already registered".into()));
        }
        if self.journal.foreign_exists()? && self.journal.pull()? {
            let last = self.namespace.rebuild()?;
            info!(last_seq = last, "registered with replicated journal");
        } else {
            self.namespace.init_root()?;
            info!(key = %self.journal.remote_key(), "registered new account");
        }
        Ok(())
    }

    fn ensure_registered(&self) -> VaultResult<()> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(VaultError::NotRegistered)
        }
    }

    /// Looks up `path`.
    pub fn find(&self, path: &str) -> VaultResult<Option<ItemInfo>> {
        self.ensure_registered()?;
        let path = normalize_path(path)?;
        Ok(self.namespace.find(&path)?.map(|item| ItemInfo::new(path, &item)))
    }

    /// Entries of the directory at `path`, sorted by name.
    pub fn listdir(&self, path: &str) -> VaultResult<Vec<ItemInfo>> {
        self.ensure_registered()?;
        let path = normalize_path(path)?;
        let mut items: Vec<ItemInfo> = self
            .namespace
            .list(&path)?
            .iter()
            .map(|item| ItemInfo::new(join_path(&path, item.name()), item))
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    /// Creates a directory. With `recursive` missing parents are created
    /// too; the final path must not exist either way.
    pub fn mkdir(&self, path: &str, recursive: bool) -> VaultResult<()> {
        self.ensure_registered()?;
        let path = normalize_path(path)?;
        if self.namespace.find(&path)?.is_some() {
            return Err(PathError::AlreadyExists(path).into());
        }
        if !recursive {
            self.namespace.mkdir(&path)?;
            return Ok(());
        }
        let mut current = String::from("/");
        for part in split_path(&path)? {
            current = join_path(&current, part);
            match self.namespace.find(&current)? {
                Some(NamespaceItem::Directory(_)) => {}
                Some(NamespaceItem::File(_)) => return Err(PathError::NotADirectory(current).into()),
                None => {
                    self.namespace.mkdir(&current)?;
                }
            }
        }
        Ok(())
    }

    /// Removes a directory. Without `recursive` it must be empty.
    pub fn rmdir(&self, path: &str, recursive: bool) -> VaultResult<()> {
        self.ensure_registered()?;
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(PathError::Invalid {
                path,
                reason: "the root cannot be removed".into(),
            }
            .into());
        }
        let dir = match self.namespace.find(&path)? {
            Some(NamespaceItem::Directory(d)) => d,
            Some(NamespaceItem::File(_)) => return Err(PathError::NotADirectory(path).into()),
            None => return Err(PathError::NotFound(path).into()),
        };
        if recursive {
            self.remove_tree(&dir)?;
        } else {
            self.namespace.remove(dir.item_id)?;
        }
        info!(path = %path, recursive, "removed directory");
        Ok(())
    }

    fn remove_tree(&self, dir: &DirectoryItem) -> VaultResult<()> {
        for child in self.namespace.list_of(dir.item_id)? {
            match child {
                NamespaceItem::Directory(d) => self.remove_tree(&d)?,
                NamespaceItem::File(f) => {
                    self.namespace.remove(f.item_id)?;
                    self.tm.delete_chunks(&f, &Default::default());
                }
            }
        }
        self.namespace.remove(dir.item_id)?;
        Ok(())
    }

    /// Moves or renames an item. An existing directory at `dst` receives
    /// the item under its current name.
    pub fn move_item(&self, src: &str, dst: &str) -> VaultResult<()> {
        self.ensure_registered()?;
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        if src == "/" {
            return Err(PathError::Invalid {
                path: src,
                reason: "the root cannot be moved".into(),
            }
            .into());
        }
        let mut item = self
            .namespace
            .find(&src)?
            .ok_or_else(|| PathError::NotFound(src.clone()))?;
        let (parent, name) = self.destination(&dst, item.name())?;
        if parent == item.parent_id() && name == item.name() {
            return Ok(());
        }
        item.set_parent(parent);
        item.set_name(&name);
        self.namespace.update(item)?;
        info!(src = %src, dst = %dst, "moved item");
        Ok(())
    }

    /// Parent id and name an item named `name` gets when placed at `dst`.
    fn destination(&self, dst: &str, name: &str) -> VaultResult<(ItemId, String)> {
        match self.namespace.find(dst)? {
            Some(NamespaceItem::Directory(d)) => {
                if self.namespace.lookup_child(d.item_id, name)?.is_some() {
                    return Err(PathError::AlreadyExists(join_path(dst, name)).into());
                }
                Ok((d.item_id, name.to_string()))
            }
            Some(NamespaceItem::File(_)) => Err(PathError::AlreadyExists(dst.to_string()).into()),
            None => {
                let (parent_path, name) = split_parent(dst)?;
                let parent = self.namespace.resolve_dir(&parent_path)?;
                Ok((parent.item_id, name))
            }
        }
    }

    /// Copies a file, or a directory recursively. File data is re-encrypted
    /// and uploaded as new chunks.
    pub fn copy(&self, src: &str, dst: &str) -> VaultResult<()> {
        self.ensure_registered()?;
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        let item = self
            .namespace
            .find(&src)?
            .ok_or_else(|| PathError::NotFound(src.clone()))?;
        let (parent, name) = self.destination(&dst, item.name())?;
        let target = join_path(&self.namespace.path_of(parent)?, &name);
        if item.is_dir() && (target == src || target.starts_with(&format!("{}/", src.trim_end_matches('/')))) {
            return Err(PathError::Invalid {
                path: dst,
                reason: "cannot copy a directory into itself".into(),
            }
            .into());
        }
        self.copy_item(&src, &item, &target)?;
        info!(src = %src, dst = %target, "copied item");
        Ok(())
    }

    fn copy_item(&self, src: &str, item: &NamespaceItem, target: &str) -> VaultResult<()> {
        match item {
            NamespaceItem::File(_) => {
                let mut reader = SmartFile::for_read(self.tm.clone(), src.to_string(), self.config.block_wait_timeout());
                let mut writer = SmartFile::for_write(self.tm.clone(), target.to_string(), self.config.max_block_size);
                loop {
                    let data = reader.read(Some(crate::file::READ_STEP))?;
                    if data.is_empty() {
                        break;
                    }
                    writer.write(&data)?;
                }
                reader.close()?;
                writer.close()
            }
            NamespaceItem::Directory(d) => {
                self.namespace.mkdir(target)?;
                for child in self.namespace.list_of(d.item_id)? {
                    let child_src = join_path(src, child.name());
                    let child_dst = join_path(target, child.name());
                    self.copy_item(&child_src, &child, &child_dst)?;
                }
                Ok(())
            }
        }
    }

    /// Removes a file and deletes its chunks, remote deletion best effort.
    pub fn remove_file(&self, path: &str) -> VaultResult<()> {
        self.ensure_registered()?;
        let path = normalize_path(path)?;
        let file = match self.namespace.find(&path)? {
            Some(NamespaceItem::File(f)) => f,
            Some(NamespaceItem::Directory(_)) => return Err(PathError::NotAFile(path).into()),
            None => return Err(PathError::NotFound(path).into()),
        };
        self.namespace.remove(file.item_id)?;
        self.tm.delete_chunks(&file, &Default::default());
        info!(path = %path, chunks = file.chunks.len(), "removed file");
        Ok(())
    }

    /// Opens a file. Writing creates or replaces the file when the handle
    /// is closed; reading requires an existing file.
    pub fn open_file(&self, path: &str, for_write: bool) -> VaultResult<SmartFile> {
        self.ensure_registered()?;
        let path = normalize_path(path)?;
        if for_write {
            let (parent_path, _) = split_parent(&path)?;
            self.namespace.resolve_dir(&parent_path)?;
            if let Some(NamespaceItem::Directory(_)) = self.namespace.find(&path)? {
                return Err(PathError::NotAFile(path).into());
            }
            Ok(SmartFile::for_write(self.tm.clone(), path, self.config.max_block_size))
        } else {
            match self.namespace.find(&path)? {
                Some(NamespaceItem::File(_)) => {}
                Some(NamespaceItem::Directory(_)) => return Err(PathError::NotAFile(path).into()),
                None => return Err(PathError::NotFound(path).into()),
            }
            Ok(SmartFile::for_read(self.tm.clone(), path, self.config.block_wait_timeout()))
        }
    }

    /// Transactions in flight and the most recent finished or failed ones.
    pub fn inprocess_operations(&self) -> Vec<OperationInfo> {
        self.tm.operations()
    }

    /// True while any transaction is INIT or LOCAL_SAVED.
    pub fn has_incomplete_operations(&self) -> bool {
        self.tm.has_incomplete()
    }

    /// Waits for every transaction to finish or fail. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.tm.wait_idle(timeout)
    }

    /// Replication state of the journal.
    pub fn journal_status(&self) -> JournalStatus {
        self.journal.status()
    }

    /// Registers an event listener for events at `min_level` or above.
    pub fn subscribe(&self, min_level: EventLevel, listener: EventListener) {
        self.events.subscribe(min_level, listener);
    }

    /// Current cache usage.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The transaction manager.
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    /// Stops the worker pools, then the journal synchronizer and the
    /// capacity monitor. Unfinished transfers resume on the next open.
    pub fn stop(&self) {
        let Some(mut services) = self.services.lock().take() else {
            return;
        };
        services.uploads.stop();
        services.downloads.stop();
        services.synchronizer.stop();
        services.monitor.stop();
        if let Err(e) = self.journal.sync() {
            debug!(error = %e, "final journal replication failed");
        }
        info!("vaultfs stopped");
    }
}

impl Drop for VaultFs {
    fn drop(&mut self) {
        self.stop();
    }
}
