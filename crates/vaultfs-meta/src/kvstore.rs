//! Key-value stores backing the namespace index.
//!
//! [`MemoryKvStore`] keeps everything in a `BTreeMap`. [`FileKvStore`] keeps
//! the same map in memory and persists every write batch as one framed,
//! CRC-protected record in an append-only log, so a batch is either replayed
//! whole or not at all.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{MetaError, MetaResult};

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for metadata persistence.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> MetaResult<Option<Value>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> MetaResult<()> {
        self.write_batch(vec![BatchOp::Put { key, value }])
    }

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> MetaResult<()> {
        self.write_batch(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<KvPair>>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> MetaResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> MetaResult<()>;

    /// Removes every key.
    fn clear(&self) -> MetaResult<()>;
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

fn apply(map: &mut BTreeMap<Key, Value>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                map.insert(key, value);
            }
            BatchOp::Delete { key } => {
                map.remove(&key);
            }
        }
    }
}

fn scan(map: &BTreeMap<Key, Value>, prefix: &[u8]) -> Vec<KvPair> {
    map.range::<Vec<u8>, _>(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Key, Value>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Value>> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<KvPair>> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(scan(&data, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> MetaResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        apply(&mut data, ops);
        Ok(())
    }

    fn clear(&self) -> MetaResult<()> {
        self.data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?
            .clear();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct FrameHeader {
    len: u32,
    /// CRC of `len` alone, so a damaged length is told apart from a torn tail.
    len_crc: u32,
    crc: u32,
}

impl FrameHeader {
    fn for_body(body: &[u8]) -> Self {
        let len = body.len() as u32;
        Self {
            len,
            len_crc: crc32fast::hash(&len.to_le_bytes()),
            crc: crc32fast::hash(body),
        }
    }

    fn len_intact(&self) -> bool {
        crc32fast::hash(&self.len.to_le_bytes()) == self.len_crc
    }
}

#[derive(Serialize, Deserialize)]
struct OpHeader {
    kind: u8,
    key_len: u32,
    value_len: u32,
}

const FRAME_HEADER_LEN: usize = 12;
const OP_HEADER_LEN: usize = 9;
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
/// Log size that always allows compaction to be skipped.
const COMPACT_MIN_BYTES: u64 = 1 << 20;

fn encode_frame(ops: &[BatchOp]) -> MetaResult<Vec<u8>> {
    let mut body = Vec::new();
    for op in ops {
        let (kind, key, value): (u8, &[u8], &[u8]) = match op {
            BatchOp::Put { key, value } => (OP_PUT, key, value),
            BatchOp::Delete { key } => (OP_DELETE, key, &[]),
        };
        let hdr = OpHeader {
            kind,
            key_len: key.len() as u32,
            value_len: value.len() as u32,
        };
        bincode::serialize_into(&mut body, &hdr).map_err(|e| MetaError::KvError(e.to_string()))?;
        body.extend_from_slice(key);
        body.extend_from_slice(value);
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    let hdr = FrameHeader::for_body(&body);
    bincode::serialize_into(&mut frame, &hdr).map_err(|e| MetaError::KvError(e.to_string()))?;
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode_ops(mut body: &[u8]) -> MetaResult<Vec<BatchOp>> {
    let mut ops = Vec::new();
    while !body.is_empty() {
        if body.len() < OP_HEADER_LEN {
            return Err(MetaError::Corruption("short batch operation header".into()));
        }
        let hdr: OpHeader =
            bincode::deserialize(&body[..OP_HEADER_LEN]).map_err(|e| MetaError::Corruption(e.to_string()))?;
        body = &body[OP_HEADER_LEN..];
        let klen = hdr.key_len as usize;
        let vlen = hdr.value_len as usize;
        if body.len() < klen + vlen {
            return Err(MetaError::Corruption("batch operation overruns frame".into()));
        }
        let key = body[..klen].to_vec();
        let value = body[klen..klen + vlen].to_vec();
        body = &body[klen + vlen..];
        ops.push(match hdr.kind {
            OP_PUT => BatchOp::Put { key, value },
            OP_DELETE => BatchOp::Delete { key },
            other => {
                return Err(MetaError::Corruption(format!("unknown batch operation {}", other)));
            }
        });
    }
    Ok(ops)
}

/// Outcome of replaying a log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Frames applied.
    pub frames: u64,
    /// Bytes of a torn final frame that were cut off.
    pub truncated_bytes: u64,
}

struct FileState {
    data: BTreeMap<Key, Value>,
    file: File,
    log_bytes: u64,
}

/// Persistent KV store: in-memory map plus an append-only batch log.
pub struct FileKvStore {
    path: PathBuf,
    state: Mutex<FileState>,
    report: ReplayReport,
}

impl FileKvStore {
    /// Opens or creates the log at `path` and replays it.
    ///
    /// A torn final frame (from a crash mid-append) is cut off. A frame whose
    /// length fails its check, a complete frame that fails its CRC, or one
    /// that decodes to garbage, is corruption.
    pub fn open(path: &Path) -> MetaResult<Self> {
        let mut raw = Vec::new();
        if path.exists() {
            File::open(path)?.read_to_end(&mut raw)?;
        }

        let mut data = BTreeMap::new();
        let mut offset = 0usize;
        let mut report = ReplayReport::default();
        while offset < raw.len() {
            if raw.len() - offset < FRAME_HEADER_LEN {
                break;
            }
            let hdr: FrameHeader = bincode::deserialize(&raw[offset..offset + FRAME_HEADER_LEN])
                .map_err(|e| MetaError::Corruption(e.to_string()))?;
            if !hdr.len_intact() {
                return Err(MetaError::Corruption(format!(
                    "{}: frame length at offset {} is damaged",
                    path.display(),
                    offset
                )));
            }
            let start = offset + FRAME_HEADER_LEN;
            let end = start + hdr.len as usize;
            if end > raw.len() {
                break;
            }
            let body = &raw[start..end];
            if crc32fast::hash(body) != hdr.crc {
                return Err(MetaError::Corruption(format!(
                    "{}: frame at offset {} fails its checksum",
                    path.display(),
                    offset
                )));
            }
            apply(&mut data, decode_ops(body)?);
            report.frames += 1;
            offset = end;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if offset < raw.len() {
            report.truncated_bytes = (raw.len() - offset) as u64;
            warn!(
                path = ?path,
                truncated = report.truncated_bytes,
                "discarding torn batch at end of index log"
            );
            file.set_len(offset as u64)?;
        }
        debug!(path = ?path, frames = report.frames, keys = data.len(), "replayed index log");

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(FileState {
                data,
                file,
                log_bytes: offset as u64,
            }),
            report,
        })
    }

    /// What happened during the replay in [`open`](Self::open).
    pub fn replay_report(&self) -> ReplayReport {
        self.report
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log as a single snapshot frame.
    pub fn compact(&self) -> MetaResult<()> {
        let mut state = self.lock()?;
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut FileState) -> MetaResult<()> {
        let ops: Vec<BatchOp> = state
            .data
            .iter()
            .map(|(k, v)| BatchOp::Put {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        let frame = if ops.is_empty() { Vec::new() } else { encode_frame(&ops)? };

        let tmp = self.path.with_extension("compact");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&frame)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        state.file = OpenOptions::new().append(true).open(&self.path)?;
        info!(
            path = ?self.path,
            before = state.log_bytes,
            after = frame.len(),
            "compacted index log"
        );
        state.log_bytes = frame.len() as u64;
        Ok(())
    }

    fn lock(&self) -> MetaResult<std::sync::MutexGuard<'_, FileState>> {
        self.state
            .lock()
            .map_err(|e| MetaError::KvError(e.to_string()))
    }

    fn live_bytes(state: &FileState) -> u64 {
        state
            .data
            .iter()
            .map(|(k, v)| (OP_HEADER_LEN + k.len() + v.len()) as u64)
            .sum()
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Value>> {
        Ok(self.lock()?.data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<KvPair>> {
        Ok(scan(&self.lock()?.data, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> MetaResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(&ops)?;
        let mut state = self.lock()?;
        state.file.write_all(&frame)?;
        state.file.sync_data()?;
        state.log_bytes += frame.len() as u64;
        apply(&mut state.data, ops);

        if state.log_bytes > COMPACT_MIN_BYTES && state.log_bytes > 4 * Self::live_bytes(&state) {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }

    fn clear(&self) -> MetaResult<()> {
        let mut state = self.lock()?;
        state.data.clear();
        state.file.set_len(0)?;
        state.file.sync_all()?;
        state.log_bytes = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(k: &[u8], v: &[u8]) -> BatchOp {
        BatchOp::Put {
            key: k.to_vec(),
            value: v.to_vec(),
        }
    }

    #[test]
    fn test_memory_store_basics() {
        let kv = MemoryKvStore::new();
        kv.put(b"a1".to_vec(), b"x".to_vec()).unwrap();
        kv.put(b"a2".to_vec(), b"y".to_vec()).unwrap();
        kv.put(b"b1".to_vec(), b"z".to_vec()).unwrap();
        assert_eq!(kv.get(b"a1").unwrap(), Some(b"x".to_vec()));
        assert_eq!(kv.scan_prefix(b"a").unwrap().len(), 2);
        kv.delete(b"a1").unwrap();
        assert!(!kv.contains_key(b"a1").unwrap());
        kv.clear().unwrap();
        assert!(kv.scan_prefix(b"").unwrap().is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kv");
        {
            let kv = FileKvStore::open(&path).unwrap();
            kv.write_batch(vec![put(b"k1", b"v1"), put(b"k2", b"v2")]).unwrap();
            kv.delete(b"k1").unwrap();
        }
        let kv = FileKvStore::open(&path).unwrap();
        assert_eq!(kv.replay_report().frames, 2);
        assert_eq!(kv.get(b"k1").unwrap(), None);
        assert_eq!(kv.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_torn_batch_is_discarded_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kv");
        {
            let kv = FileKvStore::open(&path).unwrap();
            kv.put(b"keep".to_vec(), b"1".to_vec()).unwrap();
            kv.write_batch(vec![put(b"a", b"1"), put(b"b", b"2")]).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let kv = FileKvStore::open(&path).unwrap();
        assert!(kv.replay_report().truncated_bytes > 0);
        assert!(kv.contains_key(b"keep").unwrap());
        assert!(!kv.contains_key(b"a").unwrap());
        assert!(!kv.contains_key(b"b").unwrap());

        kv.put(b"after".to_vec(), b"ok".to_vec()).unwrap();
        drop(kv);
        let kv = FileKvStore::open(&path).unwrap();
        assert_eq!(kv.replay_report().truncated_bytes, 0);
        assert!(kv.contains_key(b"after").unwrap());
    }

    #[test]
    fn test_bad_crc_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kv");
        {
            let kv = FileKvStore::open(&path).unwrap();
            kv.put(b"k".to_vec(), b"value".to_vec()).unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(FileKvStore::open(&path), Err(MetaError::Corruption(_))));
    }

    #[test]
    fn test_damaged_middle_length_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kv");
        {
            let kv = FileKvStore::open(&path).unwrap();
            kv.put(b"first".to_vec(), b"1".to_vec()).unwrap();
            kv.put(b"second".to_vec(), b"2".to_vec()).unwrap();
            kv.put(b"third".to_vec(), b"3".to_vec()).unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        let first_len = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        let second = FRAME_HEADER_LEN + first_len;
        raw[second..second + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(FileKvStore::open(&path), Err(MetaError::Corruption(_))));
    }

    #[test]
    fn test_compact_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kv");
        let kv = FileKvStore::open(&path).unwrap();
        for i in 0..50u32 {
            kv.put(b"same".to_vec(), i.to_le_bytes().to_vec()).unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();
        kv.compact().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);
        kv.put(b"other".to_vec(), b"x".to_vec()).unwrap();
        drop(kv);

        let kv = FileKvStore::open(&path).unwrap();
        assert_eq!(kv.get(b"same").unwrap(), Some(49u32.to_le_bytes().to_vec()));
        assert!(kv.contains_key(b"other").unwrap());
    }

    #[test]
    fn test_clear_truncates_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kv");
        let kv = FileKvStore::open(&path).unwrap();
        kv.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        kv.clear().unwrap();
        kv.put(b"n".to_vec(), b"v".to_vec()).unwrap();
        drop(kv);
        let kv = FileKvStore::open(&path).unwrap();
        assert!(!kv.contains_key(b"k").unwrap());
        assert!(kv.contains_key(b"n").unwrap());
    }
}
