#![warn(missing_docs)]

//! VaultFS client engine: a hierarchical file namespace over an encrypted,
//! replicated remote store.
//!
//! File data is split into blocks, encrypted locally and uploaded by worker
//! threads; every namespace change is journaled and the journal is
//! replicated. Uploads and downloads are tracked by a crash-recoverable
//! transaction log so interrupted work resumes on the next start.
//! [`VaultFs`] is the entry point.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod file;
pub mod journal;
pub mod namespace;
pub mod retry;
pub mod transactions;
pub mod txlog;
pub mod workers;

pub use backend::{Backend, BackendError, LocalDirBackend, MemoryBackend, PutReceipt};
pub use client::{ItemInfo, VaultFs};
pub use config::ClientConfig;
pub use error::{VaultError, VaultResult};
pub use events::{Event, EventBus, EventLevel, EventListener};
pub use file::SmartFile;
pub use journal::{Journal, JournalEntry, JournalStatus};
pub use retry::RetryPolicy;
pub use transactions::{OperationInfo, TransactionManager};
pub use txlog::{TxId, TxKind, TxStatus};
