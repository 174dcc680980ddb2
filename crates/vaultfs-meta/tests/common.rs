//! Common fixtures for namespace index integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use vaultfs_meta::{DirectoryItem, FileKvStore, KvStore, NamespaceIndex};

/// Index over a file-backed store at `dir/namespace_index.kv`, seeded with a root.
pub fn file_index(dir: &Path) -> (Arc<FileKvStore>, NamespaceIndex) {
    let kv = Arc::new(FileKvStore::open(&dir.join("namespace_index.kv")).unwrap());
    let idx = NamespaceIndex::open(kv.clone() as Arc<dyn KvStore>).unwrap();
    if !idx.has_root().unwrap() {
        idx.insert_existing(&DirectoryItem::root(2).into(), 1).unwrap();
    }
    (kv, idx)
}

/// Creates each directory of `path` that does not exist yet.
pub fn mkdirs(idx: &NamespaceIndex, path: &str, seq: &mut u64) {
    let mut current = String::from("/");
    for part in vaultfs_meta::split_path(path).unwrap() {
        let next = vaultfs_meta::join_path(&current, part);
        if idx.find(&next).unwrap().is_none() {
            *seq += 1;
            idx.append(&current, DirectoryItem::new(part, 2).into(), *seq).unwrap();
        }
        current = next;
    }
}
