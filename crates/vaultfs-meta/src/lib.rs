#![warn(missing_docs)]

//! VaultFS metadata subsystem: namespace items, their binary records and the
//! persistent namespace index.

pub mod index;
pub mod kvstore;
pub mod record;
pub mod types;

pub use index::{join_path, name_hash, normalize_path, split_parent, split_path, NamespaceIndex};
pub use kvstore::{BatchOp, FileKvStore, KvStore, MemoryKvStore, ReplayReport};
pub use types::{
    Chunk, DirectoryItem, FileItem, ItemId, MetaError, MetaResult, NamespaceItem, PathError, Timestamp,
};
