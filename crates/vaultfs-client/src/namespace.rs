//! Namespace service: every mutation goes to the index and the journal
//! together, under one lock.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use vaultfs_meta::{
    split_parent, DirectoryItem, FileItem, ItemId, NamespaceIndex, NamespaceItem, PathError,
};

use crate::error::VaultResult;
use crate::journal::{Journal, JournalEntry};

/// The namespace index kept in step with the journal.
pub struct Namespace {
    index: NamespaceIndex,
    journal: Arc<Journal>,
    lock: Mutex<()>,
    default_replica: u8,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("journal", &self.journal)
            .field("default_replica", &self.default_replica)
            .finish()
    }
}

impl Namespace {
    /// Wraps an opened index and journal. The root receives `default_replica`.
    pub fn new(index: NamespaceIndex, journal: Arc<Journal>, default_replica: u8) -> Self {
        Self {
            index,
            journal,
            lock: Mutex::new(()),
            default_replica,
        }
    }

    /// The journal backing this namespace.
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Creates the journal with a root directory and indexes the root.
    pub fn init_root(&self) -> VaultResult<DirectoryItem> {
        let _guard = self.lock.lock();
        let root = DirectoryItem::root(self.default_replica);
        let seq = self.journal.init(&root)?;
        self.index.insert_existing(&root.clone().into(), seq)?;
        Ok(root)
    }

    /// Resolves a path.
    pub fn find(&self, path: &str) -> VaultResult<Option<NamespaceItem>> {
        Ok(self.index.find(path)?)
    }

    /// Looks up an item by id.
    pub fn find_by_id(&self, id: ItemId) -> VaultResult<Option<NamespaceItem>> {
        Ok(self.index.find_by_id(id)?)
    }

    /// Resolves a path that must be a directory.
    pub fn resolve_dir(&self, path: &str) -> VaultResult<DirectoryItem> {
        Ok(self.index.resolve_dir(path)?)
    }

    /// The child of `dir` named `name`.
    pub fn lookup_child(&self, dir: ItemId, name: &str) -> VaultResult<Option<NamespaceItem>> {
        Ok(self.index.lookup_child(dir, name)?)
    }

    /// Children of the directory at `path`.
    pub fn list(&self, path: &str) -> VaultResult<Vec<NamespaceItem>> {
        Ok(self.index.list_children(path)?)
    }

    /// Children of a directory given by id.
    pub fn list_of(&self, dir: ItemId) -> VaultResult<Vec<NamespaceItem>> {
        Ok(self.index.list_children_of(dir)?)
    }

    /// Absolute path of an item.
    pub fn path_of(&self, id: ItemId) -> VaultResult<String> {
        Ok(self.index.path_of(id)?)
    }

    /// Reserves an id for a file that an upload will create.
    pub fn reserve_id(&self) -> VaultResult<ItemId> {
        Ok(self.index.reserve_id()?)
    }

    /// Gives back an unused reservation.
    pub fn release_id(&self, id: ItemId) {
        self.index.release_id(id);
    }

    /// Creates a directory inheriting its parent's replica count.
    pub fn mkdir(&self, path: &str) -> VaultResult<DirectoryItem> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.index.resolve_dir(&parent_path)?;
        let dir = DirectoryItem::new(&name, parent.replica_count);
        match self.insert(&parent_path, dir.into())? {
            NamespaceItem::Directory(d) => Ok(d),
            NamespaceItem::File(f) => Err(PathError::NotADirectory(f.name).into()),
        }
    }

    /// Adds a new item under `parent_path`.
    pub fn insert(&self, parent_path: &str, item: NamespaceItem) -> VaultResult<NamespaceItem> {
        let _guard = self.lock.lock();
        let seq = self.journal.next_sequence();
        let item = self.index.append(parent_path, item, seq)?;
        self.journal.append(JournalEntry::Append(item.clone()))?;
        Ok(item)
    }

    /// Stores a changed item; a new parent or name moves it.
    pub fn update(&self, item: NamespaceItem) -> VaultResult<()> {
        let _guard = self.lock.lock();
        let seq = self.journal.next_sequence();
        self.index.update(&item, seq)?;
        self.journal.append(JournalEntry::Update(item))?;
        Ok(())
    }

    /// Removes an item; directories must be empty.
    pub fn remove(&self, id: ItemId) -> VaultResult<NamespaceItem> {
        let _guard = self.lock.lock();
        let seq = self.journal.next_sequence();
        let item = self.index.remove(id, seq)?;
        self.journal.append(JournalEntry::Remove(id))?;
        Ok(item)
    }

    /// Creates or replaces the file at `path`. A replaced file keeps its id;
    /// its previous record is returned.
    pub fn upsert_file(
        &self,
        path: &str,
        mut file: FileItem,
        reserved: Option<ItemId>,
    ) -> VaultResult<Option<FileItem>> {
        let (parent_path, name) = split_parent(path)?;
        let _guard = self.lock.lock();
        let parent = self.index.resolve_dir(&parent_path)?;
        let seq = self.journal.next_sequence();
        file.name = name;
        file.parent_dir_id = parent.item_id;

        match self.index.lookup_child(parent.item_id, &file.name)? {
            Some(NamespaceItem::File(old)) => {
                if let Some(id) = reserved {
                    self.index.release_id(id);
                }
                file.item_id = old.item_id;
                file.create_date = old.create_date;
                let item = NamespaceItem::File(file);
                self.index.update(&item, seq)?;
                self.journal.append(JournalEntry::Update(item))?;
                Ok(Some(old))
            }
            Some(NamespaceItem::Directory(_)) => Err(PathError::NotAFile(path.to_string()).into()),
            None => {
                if let Some(id) = reserved {
                    file.item_id = id;
                }
                let item = self.index.append(&parent_path, file.into(), seq)?;
                self.journal.append(JournalEntry::Append(item))?;
                Ok(None)
            }
        }
    }

    /// Clears the index and replays the whole journal into it.
    pub fn rebuild(&self) -> VaultResult<u64> {
        let _guard = self.lock.lock();
        self.index.clear()?;
        let mut last = 0;
        for record in self.journal.iter(None)? {
            let record = record?;
            match &record.entry {
                JournalEntry::Append(item) => self.index.insert_existing(item, record.sequence)?,
                JournalEntry::Update(item) => self.index.update(item, record.sequence)?,
                JournalEntry::Remove(id) => {
                    self.index.remove(*id, record.sequence)?;
                }
            }
            last = record.sequence;
        }
        self.index.mark_applied(last)?;
        info!(records = last, "rebuilt namespace index from journal");
        Ok(last)
    }

    /// Rebuilds the index unless it reflects exactly the journal's last
    /// record. Returns true when a rebuild ran.
    pub fn ensure_consistent(&self) -> VaultResult<bool> {
        let last = self.journal.last_sequence();
        if last == 0 {
            return Ok(false);
        }
        let consistent = match (self.index.has_root(), self.index.applied_sequence()) {
            (Ok(true), Ok(Some(applied))) => applied == last,
            (Ok(_), Ok(_)) => false,
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "namespace index unreadable");
                false
            }
        };
        if consistent {
            return Ok(false);
        }
        warn!(journal_seq = last, "namespace index out of step with journal, rebuilding");
        self.rebuild()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::events::EventBus;
    use vaultfs_meta::{Chunk, KvStore, MemoryKvStore};
    use vaultfs_storage::AccountKeys;

    struct Fixture {
        _dir: tempfile::TempDir,
        kv: Arc<MemoryKvStore>,
        journal: Arc<Journal>,
        ns: Namespace,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(
            Journal::open(
                &dir.path().join("journal.bin"),
                Arc::new(AccountKeys::generate()),
                Arc::new(MemoryBackend::new()),
                Arc::new(EventBus::new()),
                2,
                2,
            )
            .unwrap(),
        );
        let kv = Arc::new(MemoryKvStore::new());
        let ns = Namespace::new(NamespaceIndex::open(kv.clone()).unwrap(), journal.clone(), 3);
        ns.init_root().unwrap();
        Fixture {
            _dir: dir,
            kv,
            journal,
            ns,
        }
    }

    fn file(size: u64) -> FileItem {
        let mut f = FileItem::new("ignored", 3);
        f.size = size;
        f.chunks = vec![Chunk {
            key: Some("k0".into()),
            checksum: [7u8; 32],
            seek: 0,
            size,
        }];
        f
    }

    #[test]
    fn test_mutations_are_journaled() {
        let fx = fixture();
        let docs = fx.ns.mkdir("/docs").unwrap();
        assert_eq!(docs.replica_count, 3);
        fx.ns.upsert_file("/docs/a.bin", file(10), None).unwrap();
        assert_eq!(fx.journal.last_sequence(), 3);

        let entries: Vec<_> = fx.journal.iter(None).unwrap().map(|r| r.unwrap().entry).collect();
        assert!(matches!(&entries[1], JournalEntry::Append(NamespaceItem::Directory(d)) if d.name == "docs"));
        assert!(matches!(&entries[2], JournalEntry::Append(NamespaceItem::File(f)) if f.size == 10));
    }

    #[test]
    fn test_upsert_replaces_and_keeps_id() {
        let fx = fixture();
        fx.ns.upsert_file("/a.bin", file(10), None).unwrap();
        let first = fx.ns.find("/a.bin").unwrap().unwrap();

        let reserved = fx.ns.reserve_id().unwrap();
        let old = fx.ns.upsert_file("/a.bin", file(20), Some(reserved)).unwrap();
        assert_eq!(old.unwrap().size, 10);
        let second = fx.ns.find("/a.bin").unwrap().unwrap();
        assert_eq!(second.id(), first.id());
        assert_eq!(second.size(), 20);
    }

    #[test]
    fn test_upsert_onto_directory_fails() {
        let fx = fixture();
        fx.ns.mkdir("/d").unwrap();
        let err = fx.ns.upsert_file("/d", file(1), None).unwrap_err();
        assert!(matches!(err, crate::VaultError::Path(PathError::NotAFile(_))));
    }

    #[test]
    fn test_rebuild_after_index_loss() {
        let fx = fixture();
        fx.ns.mkdir("/a").unwrap();
        fx.ns.mkdir("/a/b").unwrap();
        let b = fx.ns.find("/a/b").unwrap().unwrap();
        let mut moved = b.clone();
        moved.set_parent(ItemId::ROOT);
        moved.set_name("b2");
        fx.ns.update(moved).unwrap();
        let a = fx.ns.find("/a").unwrap().unwrap();
        fx.ns.remove(a.id()).unwrap();

        fx.kv.clear().unwrap();
        assert!(fx.ns.ensure_consistent().unwrap());
        assert!(fx.ns.find("/a").unwrap().is_none());
        assert_eq!(fx.ns.find("/b2").unwrap().unwrap().id(), b.id());
        assert!(!fx.ns.ensure_consistent().unwrap());
    }
}
