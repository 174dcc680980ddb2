//! Core namespace types: item ids, timestamps, chunks, files, directories
//! and the error types shared by the metadata layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique 32-bit identifier of a namespace item, assigned monotonically.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(u32);

impl ItemId {
    /// The root directory. It is its own parent.
    pub const ROOT: ItemId = ItemId(0);

    /// Creates an id from its raw value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

/// One contiguous slice of a file's plaintext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Remote content key; `None` until the chunk is uploaded.
    pub key: Option<String>,
    /// BLAKE3 hash of the chunk's plaintext.
    pub checksum: [u8; 32],
    /// Byte offset of the chunk within the file.
    pub seek: u64,
    /// Plaintext length.
    pub size: u64,
}

/// A regular file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    /// Item id (assigned by the index).
    pub item_id: ItemId,
    /// Containing directory.
    pub parent_dir_id: ItemId,
    /// Name within the parent.
    pub name: String,
    /// Creation time.
    pub create_date: Timestamp,
    /// Declared size in bytes.
    pub size: u64,
    /// Backend replicas requested for this file's chunks.
    pub replica_count: u8,
    /// Chunks ordered by offset.
    pub chunks: Vec<Chunk>,
}

impl FileItem {
    /// Creates an empty file record named `name`.
    pub fn new(name: &str, replica_count: u8) -> Self {
        Self {
            item_id: ItemId::ROOT,
            parent_dir_id: ItemId::ROOT,
            name: name.to_string(),
            create_date: Timestamp::now(),
            size: 0,
            replica_count,
            chunks: Vec::new(),
        }
    }

    /// True when the chunks are gapless, non-overlapping, uploaded and cover
    /// exactly `[0, size)`.
    pub fn is_complete(&self) -> bool {
        let mut expected = 0u64;
        for chunk in &self.chunks {
            if chunk.seek != expected || chunk.key.is_none() {
                return false;
            }
            expected += chunk.size;
        }
        expected == self.size
    }
}

/// A directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryItem {
    /// Item id (assigned by the index).
    pub item_id: ItemId,
    /// Containing directory; the root points at itself.
    pub parent_dir_id: ItemId,
    /// Name within the parent; empty for the root.
    pub name: String,
    /// Creation time.
    pub create_date: Timestamp,
    /// Last time an entry was added or removed.
    pub last_modify_date: Timestamp,
    /// Replica count inherited by files created inside.
    pub replica_count: u8,
}

impl DirectoryItem {
    /// Creates a directory record named `name`.
    pub fn new(name: &str, replica_count: u8) -> Self {
        let now = Timestamp::now();
        Self {
            item_id: ItemId::ROOT,
            parent_dir_id: ItemId::ROOT,
            name: name.to_string(),
            create_date: now,
            last_modify_date: now,
            replica_count,
        }
    }

    /// The root directory record.
    pub fn root(replica_count: u8) -> Self {
        Self::new("", replica_count)
    }
}

/// A file or a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceItem {
    /// A regular file.
    File(FileItem),
    /// A directory.
    Directory(DirectoryItem),
}

impl NamespaceItem {
    /// Item id.
    pub fn id(&self) -> ItemId {
        match self {
            NamespaceItem::File(f) => f.item_id,
            NamespaceItem::Directory(d) => d.item_id,
        }
    }

    /// Parent directory id.
    pub fn parent_id(&self) -> ItemId {
        match self {
            NamespaceItem::File(f) => f.parent_dir_id,
            NamespaceItem::Directory(d) => d.parent_dir_id,
        }
    }

    /// Name within the parent.
    pub fn name(&self) -> &str {
        match self {
            NamespaceItem::File(f) => &f.name,
            NamespaceItem::Directory(d) => &d.name,
        }
    }

    /// Creation time.
    pub fn create_date(&self) -> Timestamp {
        match self {
            NamespaceItem::File(f) => f.create_date,
            NamespaceItem::Directory(d) => d.create_date,
        }
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        matches!(self, NamespaceItem::Directory(_))
    }

    /// File size, zero for directories.
    pub fn size(&self) -> u64 {
        match self {
            NamespaceItem::File(f) => f.size,
            NamespaceItem::Directory(_) => 0,
        }
    }

    /// Replica count of the file, or the one a directory hands to new files.
    pub fn replica_count(&self) -> u8 {
        match self {
            NamespaceItem::File(f) => f.replica_count,
            NamespaceItem::Directory(d) => d.replica_count,
        }
    }

    /// Assigns the item id, normally a reservation from the index.
    pub fn set_id(&mut self, id: ItemId) {
        match self {
            NamespaceItem::File(f) => f.item_id = id,
            NamespaceItem::Directory(d) => d.item_id = id,
        }
    }

    /// Moves the item under another directory.
    pub fn set_parent(&mut self, parent: ItemId) {
        match self {
            NamespaceItem::File(f) => f.parent_dir_id = parent,
            NamespaceItem::Directory(d) => d.parent_dir_id = parent,
        }
    }

    /// Renames the item.
    pub fn set_name(&mut self, name: &str) {
        match self {
            NamespaceItem::File(f) => f.name = name.to_string(),
            NamespaceItem::Directory(d) => d.name = name.to_string(),
        }
    }

    /// The file record, if this is a file.
    pub fn as_file(&self) -> Option<&FileItem> {
        match self {
            NamespaceItem::File(f) => Some(f),
            NamespaceItem::Directory(_) => None,
        }
    }

    /// The directory record, if this is a directory.
    pub fn as_dir(&self) -> Option<&DirectoryItem> {
        match self {
            NamespaceItem::Directory(d) => Some(d),
            NamespaceItem::File(_) => None,
        }
    }
}

impl From<FileItem> for NamespaceItem {
    fn from(f: FileItem) -> Self {
        NamespaceItem::File(f)
    }
}

impl From<DirectoryItem> for NamespaceItem {
    fn from(d: DirectoryItem) -> Self {
        NamespaceItem::Directory(d)
    }
}

/// Caller-visible namespace failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// Nothing exists at the path.
    #[error("{0}: no such file or directory")]
    NotFound(String),

    /// A directory was required.
    #[error("{0}: not a directory")]
    NotADirectory(String),

    /// A file was required.
    #[error("{0}: not a file")]
    NotAFile(String),

    /// The name is taken in the target directory.
    #[error("{0}: already exists")]
    AlreadyExists(String),

    /// The directory still has children.
    #[error("{0}: directory not empty")]
    NotEmpty(String),

    /// The path is not absolute or contains invalid components.
    #[error("{path}: invalid path ({reason})")]
    Invalid {
        /// Offending path.
        path: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors that can occur during metadata operations
#[derive(Debug, Error)]
pub enum MetaError {
    /// A path-level failure surfaced to the caller.
    #[error(transparent)]
    Path(#[from] PathError),

    /// A persisted record could not be decoded.
    #[error("corrupt metadata record: {0}")]
    Corruption(String),

    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seek: u64, size: u64) -> Chunk {
        Chunk {
            key: Some(format!("k{}", seek)),
            checksum: [0u8; 32],
            seek,
            size,
        }
    }

    #[test]
    fn test_file_completeness() {
        let mut f = FileItem::new("a", 2);
        assert!(f.is_complete());
        f.size = 300;
        f.chunks = vec![chunk(0, 100), chunk(100, 100), chunk(200, 100)];
        assert!(f.is_complete());
        f.chunks[1].seek = 150;
        assert!(!f.is_complete());
        f.chunks[1].seek = 100;
        f.chunks[2].key = None;
        assert!(!f.is_complete());
    }

    #[test]
    fn test_item_accessors() {
        let mut item: NamespaceItem = DirectoryItem::new("docs", 3).into();
        item.set_parent(ItemId::new(7));
        item.set_name("papers");
        assert!(item.is_dir());
        assert_eq!(item.parent_id(), ItemId::new(7));
        assert_eq!(item.name(), "papers");
        assert_eq!(item.replica_count(), 3);
        assert!(item.as_file().is_none());
    }

    #[test]
    fn test_path_error_display() {
        let e = PathError::NotEmpty("/a".into());
        assert_eq!(e.to_string(), "/a: directory not empty");
        let m: MetaError = e.into();
        assert!(matches!(m, MetaError::Path(PathError::NotEmpty(_))));
    }
}
