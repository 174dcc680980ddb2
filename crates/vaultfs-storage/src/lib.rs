#![warn(missing_docs)]

//! VaultFS storage subsystem: streaming block encryption, encrypted block
//! files and the local block cache.
//!
//! Everything here is synchronous and thread-safe. Blocks are sealed to an
//! account key pair, written once, then read back any number of times
//! through independent handles. The cache evicts least recently used blocks
//! that no handle is holding when free space runs low.

pub mod block_cache;
pub mod capacity;
pub mod checksum;
pub mod cipher;
pub mod encoding_block;
pub mod error;
pub mod lock_registry;

pub use block_cache::{BlockCache, CacheConfig, CacheStats, DYNAMIC_DIR, STATIC_DIR};
pub use capacity::{CapacityMonitor, FixedFreeSpace, FreeSpaceProbe, StatvfsProbe};
pub use checksum::{ContentHash, ContentHasher};
pub use cipher::{expected_ciphertext_len, open_all, seal_all, AccountKeys, Decryptor, Encryptor};
pub use encoding_block::{BlockContext, BlockIoConfig, EncodingBlock};
pub use error::{CipherError, StorageError, StorageResult};
pub use lock_registry::{BlockRegistry, UnlockCallback};
