//! Namespace index behavior over the file-backed store.

mod common;

use std::fs::OpenOptions;

use common::{file_index, mkdirs};
use vaultfs_meta::{DirectoryItem, FileItem, MetaError, NamespaceItem, PathError};

#[test]
fn test_tree_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = 1;
    {
        let (_kv, idx) = file_index(dir.path());
        mkdirs(&idx, "/a/b/c", &mut seq);
        seq += 1;
        idx.append("/a/b", FileItem::new("f.bin", 3).into(), seq).unwrap();
    }
    let (_kv, idx) = file_index(dir.path());
    assert_eq!(idx.applied_sequence().unwrap(), Some(seq));
    let f = idx.find("/a/b/f.bin").unwrap().unwrap();
    assert_eq!(f.replica_count(), 3);
    let names: Vec<_> = idx
        .list_children("/a/b")
        .unwrap()
        .iter()
        .map(|i| i.name().to_string())
        .collect();
    assert_eq!(names, vec!["c", "f.bin"]);
}

#[test]
fn test_move_is_all_or_nothing_after_torn_write() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = 1;
    let log = dir.path().join("namespace_index.kv");
    let before_move;
    {
        let (_kv, idx) = file_index(dir.path());
        mkdirs(&idx, "/src", &mut seq);
        mkdirs(&idx, "/dst", &mut seq);
        seq += 1;
        idx.append("/src", FileItem::new("doc", 2).into(), seq).unwrap();
        before_move = std::fs::metadata(&log).unwrap().len();

        let mut item = idx.find("/src/doc").unwrap().unwrap();
        let dst = idx.find("/dst").unwrap().unwrap();
        item.set_parent(dst.id());
        seq += 1;
        idx.update(&item, seq).unwrap();
    }
    // Cut the move batch in half, as a crash during the append would.
    let after_move = std::fs::metadata(&log).unwrap().len();
    let cut = before_move + (after_move - before_move) / 2;
    OpenOptions::new().write(true).open(&log).unwrap().set_len(cut).unwrap();

    let (kv, idx) = file_index(dir.path());
    assert!(kv.replay_report().truncated_bytes > 0);
    assert!(idx.find("/src/doc").unwrap().is_some());
    assert!(idx.find("/dst/doc").unwrap().is_none());
    assert_eq!(idx.applied_sequence().unwrap(), Some(seq - 1));
}

#[test]
fn test_namespace_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (_kv, idx) = file_index(dir.path());
    let mut seq = 1;

    let err = idx
        .append("/a", DirectoryItem::new("b", 2).into(), 2)
        .unwrap_err();
    assert!(matches!(err, MetaError::Path(PathError::NotFound(_))));

    mkdirs(&idx, "/a", &mut seq);
    seq += 1;
    let err = idx.append("/", DirectoryItem::new("a", 2).into(), seq).unwrap_err();
    assert!(matches!(err, MetaError::Path(PathError::AlreadyExists(_))));

    seq += 1;
    idx.append("/a", FileItem::new("x", 2).into(), seq).unwrap();
    let a = idx.find("/a").unwrap().unwrap();
    let err = idx.remove(a.id(), seq + 1).unwrap_err();
    assert!(matches!(err, MetaError::Path(PathError::NotEmpty(_))));
}

#[test]
fn test_many_hash_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let (_kv, idx) = file_index(dir.path());
    for i in 0..200u64 {
        let item: NamespaceItem = FileItem::new(&format!("file-{:03}", i), 2).into();
        idx.append("/", item, i + 2).unwrap();
    }
    assert_eq!(idx.list_children("/").unwrap().len(), 200);
    for i in (0..200).step_by(37) {
        let path = format!("/file-{:03}", i);
        let item = idx.find(&path).unwrap().unwrap();
        assert_eq!(idx.path_of(item.id()).unwrap(), path);
    }
}
