//! Namespace index: the local, rebuildable directory tree.
//!
//! Records live in a [`KvStore`] under 9-byte keys
//! `(a u32 LE, b u32 LE, kind u8)`:
//!
//! | kind     | a          | b              | value                        |
//! |----------|------------|----------------|------------------------------|
//! | Address  | parent id  | crc32(name)    | ids sharing that name hash   |
//! | Item     | item id    | 0              | encoded item record          |
//! | Children | dir id     | 0              | insertion-ordered child list |
//! | Meta     | slot       | 0              | index bookkeeping            |
//!
//! Every mutation, including a cross-directory move, is one `write_batch`
//! that also stamps the journal sequence it was applied for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::kvstore::{BatchOp, KvStore};
use crate::record::{decode_children, decode_id_list, decode_item, encode_children, encode_id_list, encode_item};
use crate::types::{DirectoryItem, ItemId, MetaError, MetaResult, NamespaceItem, PathError, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum KeyKind {
    Address = 1,
    Item = 2,
    Children = 3,
    Meta = 4,
}

fn make_key(a: u32, b: u32, kind: KeyKind) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.extend_from_slice(&a.to_le_bytes());
    key.extend_from_slice(&b.to_le_bytes());
    key.push(kind as u8);
    key
}

fn item_key(id: ItemId) -> Vec<u8> {
    make_key(id.as_u32(), 0, KeyKind::Item)
}

fn address_key(parent: ItemId, name: &str) -> Vec<u8> {
    make_key(parent.as_u32(), name_hash(name), KeyKind::Address)
}

fn children_key(dir: ItemId) -> Vec<u8> {
    make_key(dir.as_u32(), 0, KeyKind::Children)
}

const META_APPLIED_SEQ: u32 = 0;
const META_LAST_ID: u32 = 1;

fn meta_key(slot: u32) -> Vec<u8> {
    make_key(slot, 0, KeyKind::Meta)
}

/// Deepest tree walked before a parent chain is declared cyclic.
const MAX_DEPTH: usize = 4096;

/// Hash used to bucket children by name.
pub fn name_hash(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

/// Splits an absolute path into its components.
///
/// Empty components (`//`, trailing `/`) are ignored; `.` and `..` are
/// rejected.
pub fn split_path(path: &str) -> Result<Vec<&str>, PathError> {
    let invalid = |reason: &str| PathError::Invalid {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if !path.starts_with('/') {
        return Err(invalid("not absolute"));
    }
    let mut parts = Vec::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == "." || part == ".." {
            return Err(invalid("relative component"));
        }
        if part.contains('\0') {
            return Err(invalid("NUL in name"));
        }
        parts.push(part);
    }
    Ok(parts)
}

/// Normalizes an absolute path to `/a/b` form (`/` for the root).
pub fn normalize_path(path: &str) -> Result<String, PathError> {
    Ok(format!("/{}", split_path(path)?.join("/")))
}

/// Splits a path into its normalized parent path and final name.
pub fn split_parent(path: &str) -> Result<(String, String), PathError> {
    let mut parts = split_path(path)?;
    let name = parts.pop().ok_or_else(|| PathError::Invalid {
        path: path.to_string(),
        reason: "the root has no parent".to_string(),
    })?;
    Ok((format!("/{}", parts.join("/")), name.to_string()))
}

/// Joins a directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

struct IdState {
    last_id: u32,
    reserved: BTreeSet<u32>,
}

/// Persistent namespace index over a [`KvStore`].
pub struct NamespaceIndex {
    kv: Arc<dyn KvStore>,
    /// Serializes mutations and id allocation.
    state: Mutex<IdState>,
}

impl NamespaceIndex {
    /// Opens the index stored in `kv`. An empty store is a valid, empty index.
    pub fn open(kv: Arc<dyn KvStore>) -> MetaResult<Self> {
        let last_id = match kv.get(&meta_key(META_LAST_ID))? {
            Some(v) => read_u32(&v, "last id")?,
            None => 0,
        };
        debug!(last_id, "opened namespace index");
        Ok(Self {
            kv,
            state: Mutex::new(IdState {
                last_id,
                reserved: BTreeSet::new(),
            }),
        })
    }

    /// True once a root directory record exists.
    pub fn has_root(&self) -> MetaResult<bool> {
        self.kv.contains_key(&item_key(ItemId::ROOT))
    }

    /// Journal sequence of the last applied mutation.
    pub fn applied_sequence(&self) -> MetaResult<Option<u64>> {
        match self.kv.get(&meta_key(META_APPLIED_SEQ))? {
            Some(v) if v.len() == 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&v);
                Ok(Some(u64::from_le_bytes(b)))
            }
            Some(v) => Err(MetaError::Corruption(format!(
                "applied sequence marker has {} bytes",
                v.len()
            ))),
            None => Ok(None),
        }
    }

    /// Removes every record and forgets allocated ids.
    pub fn clear(&self) -> MetaResult<()> {
        let mut state = self.state.lock();
        self.kv.clear()?;
        state.last_id = 0;
        state.reserved.clear();
        info!("cleared namespace index");
        Ok(())
    }

    /// Reserves an item id for an item that will be appended later.
    pub fn reserve_id(&self) -> MetaResult<ItemId> {
        let mut state = self.state.lock();
        let id = state.last_id + 1;
        self.kv.put(meta_key(META_LAST_ID), id.to_le_bytes().to_vec())?;
        state.last_id = id;
        state.reserved.insert(id);
        debug!(item_id = id, "reserved item id");
        Ok(ItemId::new(id))
    }

    /// Returns an unused reservation.
    pub fn release_id(&self, id: ItemId) {
        let mut state = self.state.lock();
        if state.reserved.remove(&id.as_u32()) {
            debug!(item_id = %id, "released item id");
        }
    }

    /// Looks up an item by id.
    pub fn find_by_id(&self, id: ItemId) -> MetaResult<Option<NamespaceItem>> {
        match self.kv.get(&item_key(id))? {
            Some(rec) => Ok(Some(decode_item(&rec)?)),
            None => Ok(None),
        }
    }

    fn get_item(&self, id: ItemId) -> MetaResult<NamespaceItem> {
        self.find_by_id(id)?
            .ok_or_else(|| MetaError::Corruption(format!("dangling item id {}", id)))
    }

    fn bucket(&self, parent: ItemId, name: &str) -> MetaResult<Vec<ItemId>> {
        match self.kv.get(&address_key(parent, name))? {
            Some(v) => decode_id_list(&v),
            None => Ok(Vec::new()),
        }
    }

    fn children_ids(&self, dir: ItemId) -> MetaResult<Vec<(u32, ItemId)>> {
        match self.kv.get(&children_key(dir))? {
            Some(v) => decode_children(&v),
            None => Ok(Vec::new()),
        }
    }

    /// Finds the child of `parent` named exactly `name`, resolving hash
    /// collisions by comparing names.
    pub fn lookup_child(&self, parent: ItemId, name: &str) -> MetaResult<Option<NamespaceItem>> {
        for id in self.bucket(parent, name)? {
            let item = self.get_item(id)?;
            if item.name() == name {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Resolves a path. A missing component, or a file where a directory is
    /// needed, yields `None`.
    pub fn find(&self, path: &str) -> MetaResult<Option<NamespaceItem>> {
        let parts = split_path(path)?;
        let mut current = match self.find_by_id(ItemId::ROOT)? {
            Some(root) => root,
            None => return Ok(None),
        };
        for part in parts {
            if !current.is_dir() {
                return Ok(None);
            }
            current = match self.lookup_child(current.id(), part)? {
                Some(child) => child,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// Resolves a path that must name a directory.
    pub fn resolve_dir(&self, path: &str) -> MetaResult<DirectoryItem> {
        match self.find(path)? {
            Some(NamespaceItem::Directory(d)) => Ok(d),
            Some(NamespaceItem::File(_)) => Err(PathError::NotADirectory(path.to_string()).into()),
            None => Err(self.missing(path)),
        }
    }

    /// Distinguishes "no such entry" from "a file sits on the way".
    fn missing(&self, path: &str) -> MetaError {
        if let Ok(parts) = split_path(path) {
            let mut prefix = String::new();
            for part in &parts[..parts.len().saturating_sub(1)] {
                prefix = join_path(if prefix.is_empty() { "/" } else { &prefix }, part);
                if let Ok(Some(NamespaceItem::File(_))) = self.find(&prefix) {
                    return PathError::NotADirectory(prefix).into();
                }
            }
        }
        PathError::NotFound(path.to_string()).into()
    }

    /// Lists a directory's children in insertion order.
    pub fn list_children(&self, path: &str) -> MetaResult<Vec<NamespaceItem>> {
        let dir = self.resolve_dir(path)?;
        self.list_children_of(dir.item_id)
    }

    /// Lists children of a directory given by id.
    pub fn list_children_of(&self, dir: ItemId) -> MetaResult<Vec<NamespaceItem>> {
        self.children_ids(dir)?
            .into_iter()
            .map(|(_, id)| self.get_item(id))
            .collect()
    }

    /// Absolute path of an item.
    pub fn path_of(&self, id: ItemId) -> MetaResult<String> {
        let mut names = Vec::new();
        let mut current = id;
        while current != ItemId::ROOT {
            if names.len() > MAX_DEPTH {
                return Err(MetaError::Corruption(format!("parent chain of {} is cyclic", id)));
            }
            let item = self.get_item(current)?;
            names.push(item.name().to_string());
            current = item.parent_id();
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Inserts a new item under `parent_path`, assigning its id (or consuming
    /// a reservation when the item already carries a reserved id).
    pub fn append(&self, parent_path: &str, item: NamespaceItem, journal_seq: u64) -> MetaResult<NamespaceItem> {
        let mut state = self.state.lock();
        let parent = self.resolve_dir(parent_path)?;
        let full = join_path(parent_path, item.name());
        if self.lookup_child(parent.item_id, item.name())?.is_some() {
            return Err(PathError::AlreadyExists(full).into());
        }

        let mut item = item;
        let reserved = state.reserved.contains(&item.id().as_u32());
        let id = if reserved {
            item.id().as_u32()
        } else {
            state.last_id + 1
        };
        item.set_id(ItemId::new(id));
        item.set_parent(parent.item_id);

        let mut parent = parent;
        parent.last_modify_date = item.create_date();
        let mut ops = self.link_ops(&item, parent)?;
        ops.push(BatchOp::Put {
            key: item_key(item.id()),
            value: encode_item(&item)?,
        });
        let last_id = state.last_id.max(id);
        ops.push(BatchOp::Put {
            key: meta_key(META_LAST_ID),
            value: last_id.to_le_bytes().to_vec(),
        });
        ops.push(seq_op(journal_seq));
        self.kv.write_batch(ops)?;

        state.last_id = last_id;
        if reserved {
            state.reserved.remove(&id);
        }
        debug!(item_id = id, path = %full, seq = journal_seq, "appended namespace item");
        Ok(item)
    }

    /// Inserts an item that already has its id and parent, as recorded in
    /// the journal. The root directory is stored without any links.
    pub fn insert_existing(&self, item: &NamespaceItem, journal_seq: u64) -> MetaResult<()> {
        let mut state = self.state.lock();
        let mut ops = Vec::new();
        if item.id() != ItemId::ROOT {
            let mut parent = match self.get_item(item.parent_id())? {
                NamespaceItem::Directory(d) => d,
                NamespaceItem::File(f) => {
                    return Err(PathError::NotADirectory(f.name).into());
                }
            };
            if let Some(existing) = self.lookup_child(parent.item_id, item.name())? {
                if existing.id() != item.id() {
                    return Err(PathError::AlreadyExists(item.name().to_string()).into());
                }
            } else {
                parent.last_modify_date = item.create_date();
                ops = self.link_ops(item, parent)?;
            }
        }
        ops.push(BatchOp::Put {
            key: item_key(item.id()),
            value: encode_item(item)?,
        });
        let last_id = state.last_id.max(item.id().as_u32());
        ops.push(BatchOp::Put {
            key: meta_key(META_LAST_ID),
            value: last_id.to_le_bytes().to_vec(),
        });
        ops.push(seq_op(journal_seq));
        self.kv.write_batch(ops)?;
        state.last_id = last_id;
        Ok(())
    }

    /// Rewrites an item. When its parent or name changed, the address
    /// buckets and child lists of both directories change in the same batch.
    pub fn update(&self, item: &NamespaceItem, journal_seq: u64) -> MetaResult<()> {
        let _state = self.state.lock();
        let old = self
            .find_by_id(item.id())?
            .ok_or_else(|| PathError::NotFound(format!("item {}", item.id())))?;
        if old.is_dir() != item.is_dir() {
            return Err(PathError::Invalid {
                path: self.path_of(item.id())?,
                reason: "cannot change between file and directory".to_string(),
            }
            .into());
        }

        let moved = old.parent_id() != item.parent_id() || old.name() != item.name();
        let mut ops = Vec::new();
        if moved {
            if item.id() == ItemId::ROOT {
                return Err(PathError::Invalid {
                    path: "/".to_string(),
                    reason: "the root cannot move".to_string(),
                }
                .into());
            }
            let dest = match self.find_by_id(item.parent_id())? {
                Some(NamespaceItem::Directory(d)) => d,
                Some(NamespaceItem::File(_)) => {
                    return Err(PathError::NotADirectory(self.path_of(item.parent_id())?).into());
                }
                None => return Err(PathError::NotFound(format!("directory {}", item.parent_id())).into()),
            };
            if item.is_dir() && self.is_within(dest.item_id, item.id())? {
                return Err(PathError::Invalid {
                    path: self.path_of(item.id())?,
                    reason: "cannot move a directory into itself".to_string(),
                }
                .into());
            }
            if let Some(existing) = self.lookup_child(dest.item_id, item.name())? {
                if existing.id() != item.id() {
                    let dest_path = self.path_of(dest.item_id)?;
                    return Err(PathError::AlreadyExists(join_path(&dest_path, item.name())).into());
                }
            }
            ops = self.relink_ops(&old, item)?;
        }
        ops.push(BatchOp::Put {
            key: item_key(item.id()),
            value: encode_item(item)?,
        });
        ops.push(seq_op(journal_seq));
        self.kv.write_batch(ops)?;
        debug!(item_id = %item.id(), moved, seq = journal_seq, "updated namespace item");
        Ok(())
    }

    /// Removes an item by id. Directories must be empty.
    pub fn remove(&self, id: ItemId, journal_seq: u64) -> MetaResult<NamespaceItem> {
        let _state = self.state.lock();
        if id == ItemId::ROOT {
            return Err(PathError::Invalid {
                path: "/".to_string(),
                reason: "the root cannot be removed".to_string(),
            }
            .into());
        }
        let item = self
            .find_by_id(id)?
            .ok_or_else(|| PathError::NotFound(format!("item {}", id)))?;
        if item.is_dir() && !self.children_ids(id)?.is_empty() {
            return Err(PathError::NotEmpty(self.path_of(id)?).into());
        }

        let mut dirs = BTreeMap::new();
        let mut ops = self.unlink_ops(&item, &mut dirs)?;
        for dir in dirs.into_values() {
            ops.push(BatchOp::Put {
                key: item_key(dir.item_id),
                value: encode_item(&NamespaceItem::Directory(dir))?,
            });
        }
        ops.push(BatchOp::Delete { key: item_key(id) });
        if item.is_dir() {
            ops.push(BatchOp::Delete { key: children_key(id) });
        }
        ops.push(seq_op(journal_seq));
        self.kv.write_batch(ops)?;
        debug!(item_id = %id, seq = journal_seq, "removed namespace item");
        Ok(item)
    }

    /// Records that the index reflects the journal up to `seq`.
    pub fn mark_applied(&self, seq: u64) -> MetaResult<()> {
        let _state = self.state.lock();
        self.kv.write_batch(vec![seq_op(seq)])
    }

    /// True when `dir` is `ancestor` or lies below it.
    fn is_within(&self, dir: ItemId, ancestor: ItemId) -> MetaResult<bool> {
        let mut current = dir;
        for _ in 0..MAX_DEPTH {
            if current == ancestor {
                return Ok(true);
            }
            if current == ItemId::ROOT {
                return Ok(false);
            }
            current = self.get_item(current)?.parent_id();
        }
        Err(MetaError::Corruption(format!("parent chain of {} is cyclic", dir)))
    }

    /// Ops adding `item` to `parent`'s bucket and child list, plus the
    /// rewritten parent record.
    fn link_ops(&self, item: &NamespaceItem, parent: DirectoryItem) -> MetaResult<Vec<BatchOp>> {
        let mut bucket = self.bucket(parent.item_id, item.name())?;
        bucket.push(item.id());
        let mut children = self.children_ids(parent.item_id)?;
        children.push((name_hash(item.name()), item.id()));
        Ok(vec![
            BatchOp::Put {
                key: address_key(parent.item_id, item.name()),
                value: encode_id_list(&bucket),
            },
            BatchOp::Put {
                key: children_key(parent.item_id),
                value: encode_children(&children),
            },
            BatchOp::Put {
                key: item_key(parent.item_id),
                value: encode_item(&NamespaceItem::Directory(parent))?,
            },
        ])
    }

    /// Ops removing `item` from its parent's bucket and child list. The
    /// parent record is stamped and left in `dirs` for the caller to write.
    fn unlink_ops(
        &self,
        item: &NamespaceItem,
        dirs: &mut BTreeMap<ItemId, DirectoryItem>,
    ) -> MetaResult<Vec<BatchOp>> {
        let parent_id = item.parent_id();
        let mut bucket = self.bucket(parent_id, item.name())?;
        bucket.retain(|id| *id != item.id());
        let mut children = self.children_ids(parent_id)?;
        children.retain(|(_, id)| *id != item.id());

        let addr = address_key(parent_id, item.name());
        let mut ops = vec![
            if bucket.is_empty() {
                BatchOp::Delete { key: addr }
            } else {
                BatchOp::Put {
                    key: addr,
                    value: encode_id_list(&bucket),
                }
            },
            BatchOp::Put {
                key: children_key(parent_id),
                value: encode_children(&children),
            },
        ];
        if children.is_empty() {
            ops.pop();
            ops.push(BatchOp::Delete {
                key: children_key(parent_id),
            });
        }

        if let NamespaceItem::Directory(mut parent) = self.get_item(parent_id)? {
            parent.last_modify_date = Timestamp::now();
            dirs.insert(parent_id, parent);
        }
        Ok(ops)
    }

    /// Ops moving `old` to the parent and name of `new`.
    fn relink_ops(&self, old: &NamespaceItem, new: &NamespaceItem) -> MetaResult<Vec<BatchOp>> {
        let mut dirs = BTreeMap::new();
        let mut ops = self.unlink_ops(old, &mut dirs)?;

        // The new parent's lists must reflect the unlink when both parents
        // are the same directory, so read them back through the pending ops.
        let pending: BTreeMap<Vec<u8>, Option<Vec<u8>>> = ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => (key.clone(), Some(value.clone())),
                BatchOp::Delete { key } => (key.clone(), None),
            })
            .collect();
        let read = |key: Vec<u8>| -> MetaResult<Option<Vec<u8>>> {
            match pending.get(&key) {
                Some(v) => Ok(v.clone()),
                None => self.kv.get(&key),
            }
        };

        let parent_id = new.parent_id();
        let mut bucket = match read(address_key(parent_id, new.name()))? {
            Some(v) => decode_id_list(&v)?,
            None => Vec::new(),
        };
        bucket.push(new.id());
        let mut children = match read(children_key(parent_id))? {
            Some(v) => decode_children(&v)?,
            None => Vec::new(),
        };
        children.push((name_hash(new.name()), new.id()));
        ops.push(BatchOp::Put {
            key: address_key(parent_id, new.name()),
            value: encode_id_list(&bucket),
        });
        ops.push(BatchOp::Put {
            key: children_key(parent_id),
            value: encode_children(&children),
        });

        let dest = match dirs.remove(&parent_id) {
            Some(d) => d,
            None => match self.get_item(parent_id)? {
                NamespaceItem::Directory(d) => d,
                NamespaceItem::File(f) => return Err(PathError::NotADirectory(f.name).into()),
            },
        };
        let mut dest = dest;
        dest.last_modify_date = Timestamp::now();
        dirs.insert(parent_id, dest);
        for dir in dirs.into_values() {
            ops.push(BatchOp::Put {
                key: item_key(dir.item_id),
                value: encode_item(&NamespaceItem::Directory(dir))?,
            });
        }
        Ok(ops)
    }
}

fn seq_op(seq: u64) -> BatchOp {
    BatchOp::Put {
        key: meta_key(META_APPLIED_SEQ),
        value: seq.to_le_bytes().to_vec(),
    }
}

fn read_u32(v: &[u8], what: &str) -> MetaResult<u32> {
    if v.len() != 4 {
        return Err(MetaError::Corruption(format!("{} has {} bytes", what, v.len())));
    }
    Ok(u32::from_le_bytes([v[0], v[1], v[2], v[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use crate::types::FileItem;

    fn index() -> NamespaceIndex {
        let idx = NamespaceIndex::open(Arc::new(MemoryKvStore::new())).unwrap();
        idx.insert_existing(&DirectoryItem::root(2).into(), 1).unwrap();
        idx
    }

    fn dir(name: &str) -> NamespaceItem {
        DirectoryItem::new(name, 2).into()
    }

    fn file(name: &str) -> NamespaceItem {
        FileItem::new(name, 2).into()
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/").unwrap(), Vec::<&str>::new());
        assert_eq!(split_path("/a//b/").unwrap(), vec!["a", "b"]);
        assert!(split_path("a/b").is_err());
        assert!(split_path("/a/../b").is_err());
        assert_eq!(split_parent("/a/b").unwrap(), ("/a".to_string(), "b".to_string()));
        assert_eq!(split_parent("/a").unwrap(), ("/".to_string(), "a".to_string()));
        assert!(split_parent("/").is_err());
        assert_eq!(normalize_path("/a//b/").unwrap(), "/a/b");
    }

    #[test]
    fn test_append_and_find() {
        let idx = index();
        let docs = idx.append("/", dir("docs"), 2).unwrap();
        assert_eq!(docs.id(), ItemId::new(1));
        let f = idx.append("/docs", file("a.txt"), 3).unwrap();
        assert_eq!(f.parent_id(), docs.id());
        assert_eq!(idx.find("/docs/a.txt").unwrap().unwrap().id(), f.id());
        assert!(idx.find("/docs/missing").unwrap().is_none());
        assert!(idx.find("/docs/a.txt/x").unwrap().is_none());
        assert_eq!(idx.path_of(f.id()).unwrap(), "/docs/a.txt");
        assert_eq!(idx.applied_sequence().unwrap(), Some(3));
    }

    #[test]
    fn test_append_conflicts() {
        let idx = index();
        idx.append("/", dir("docs"), 2).unwrap();
        let err = idx.append("/", file("docs"), 3).unwrap_err();
        assert!(matches!(err, MetaError::Path(PathError::AlreadyExists(_))));
        let err = idx.append("/nope", file("x"), 3).unwrap_err();
        assert!(matches!(err, MetaError::Path(PathError::NotFound(_))));
        idx.append("/", file("f"), 3).unwrap();
        let err = idx.append("/f", file("x"), 4).unwrap_err();
        assert!(matches!(err, MetaError::Path(PathError::NotADirectory(_))));
    }

    #[test]
    fn test_children_in_insertion_order() {
        let idx = index();
        for name in ["zeta", "alpha", "mid"] {
            idx.append("/", file(name), 2).unwrap();
        }
        let names: Vec<_> = idx
            .list_children("/")
            .unwrap()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_remove_rules() {
        let idx = index();
        let d = idx.append("/", dir("d"), 2).unwrap();
        let f = idx.append("/d", file("f"), 3).unwrap();
        let err = idx.remove(d.id(), 4).unwrap_err();
        assert!(matches!(err, MetaError::Path(PathError::NotEmpty(_))));
        idx.remove(f.id(), 4).unwrap();
        idx.remove(d.id(), 5).unwrap();
        assert!(idx.find("/d").unwrap().is_none());
        assert!(idx.list_children("/").unwrap().is_empty());
        assert!(idx.remove(ItemId::ROOT, 6).is_err());
    }

    #[test]
    fn test_move_across_directories() {
        let idx = index();
        idx.append("/", dir("a"), 2).unwrap();
        let b = idx.append("/", dir("b"), 3).unwrap();
        let mut f = idx.append("/a", file("f"), 4).unwrap();
        f.set_parent(b.id());
        f.set_name("g");
        idx.update(&f, 5).unwrap();
        assert!(idx.find("/a/f").unwrap().is_none());
        assert_eq!(idx.find("/b/g").unwrap().unwrap().id(), f.id());
        assert!(idx.list_children("/a").unwrap().is_empty());
        assert_eq!(idx.list_children("/b").unwrap().len(), 1);
    }

    #[test]
    fn test_rename_within_directory() {
        let idx = index();
        let mut f = idx.append("/", file("old"), 2).unwrap();
        idx.append("/", file("other"), 3).unwrap();
        f.set_name("new");
        idx.update(&f, 4).unwrap();
        let names: Vec<_> = idx
            .list_children("/")
            .unwrap()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(names, vec!["other", "new"]);
        assert!(idx.find("/old").unwrap().is_none());
    }

    #[test]
    fn test_move_into_own_subtree_rejected() {
        let idx = index();
        let mut a = idx.append("/", dir("a"), 2).unwrap();
        let sub = idx.append("/a", dir("sub"), 3).unwrap();
        a.set_parent(sub.id());
        let err = idx.update(&a, 4).unwrap_err();
        assert!(matches!(err, MetaError::Path(PathError::Invalid { .. })));
        assert!(idx.find("/a/sub").unwrap().is_some());
    }

    #[test]
    fn test_move_onto_existing_name_rejected() {
        let idx = index();
        idx.append("/", file("x"), 2).unwrap();
        let mut y = idx.append("/", file("y"), 3).unwrap();
        y.set_name("x");
        let err = idx.update(&y, 4).unwrap_err();
        assert!(matches!(err, MetaError::Path(PathError::AlreadyExists(_))));
        assert!(idx.find("/y").unwrap().is_some());
    }

    #[test]
    fn test_reserved_id_is_consumed() {
        let idx = index();
        let id = idx.reserve_id().unwrap();
        let other = idx.append("/", file("other"), 2).unwrap();
        assert_ne!(other.id(), id);
        let mut item = file("mine");
        item.set_id(id);
        let appended = idx.append("/", item, 3).unwrap();
        assert_eq!(appended.id(), id);
    }

    #[test]
    fn test_ids_survive_reopen() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let idx = NamespaceIndex::open(kv.clone()).unwrap();
            idx.insert_existing(&DirectoryItem::root(2).into(), 1).unwrap();
            idx.append("/", file("a"), 2).unwrap();
            idx.reserve_id().unwrap();
        }
        let idx = NamespaceIndex::open(kv).unwrap();
        assert_eq!(idx.append("/", file("b"), 3).unwrap().id(), ItemId::new(3));
    }

    #[test]
    fn test_resolve_dir_errors() {
        let idx = index();
        idx.append("/", file("f"), 2).unwrap();
        assert!(matches!(
            idx.resolve_dir("/f/g").unwrap_err(),
            MetaError::Path(PathError::NotADirectory(_))
        ));
        assert!(matches!(
            idx.list_children("/f").unwrap_err(),
            MetaError::Path(PathError::NotADirectory(_))
        ));
        assert!(matches!(
            idx.list_children("/none").unwrap_err(),
            MetaError::Path(PathError::NotFound(_))
        ));
    }

    #[test]
    fn test_clear_empties_index() {
        let idx = index();
        idx.append("/", file("f"), 2).unwrap();
        idx.clear().unwrap();
        assert!(!idx.has_root().unwrap());
        assert_eq!(idx.applied_sequence().unwrap(), None);
        assert!(idx.find("/").unwrap().is_none());
    }
}
