//! Error types for the client engine.

use thiserror::Error;
use vaultfs_meta::{MetaError, PathError};
use vaultfs_storage::StorageError;

use crate::backend::BackendError;

/// Result type alias for client operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Not found, wrong type, already exists or not empty. Never retried.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Checksum mismatch, malformed record or broken ciphertext.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The backend failed or timed out.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Disk full or permission denied.
    #[error("Resource error: {0}")]
    Resource(String),

    /// A local log holds a record this engine cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A transaction ended in FAILED.
    #[error("Transaction {tx_id} failed: {reason}")]
    TransactionFailed {
        /// Failed transaction.
        tx_id: u64,
        /// Why it failed.
        reason: String,
    },

    /// No journal exists for this account yet.
    #[error("Account is not registered")]
    NotRegistered,

    /// The call does not fit the object's state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Waiting for an event took too long.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Storage failure that is neither corruption nor a resource problem.
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Metadata store failure.
    #[error("Metadata error: {0}")]
    Meta(MetaError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// True for errors that poison cached data rather than the operation.
    pub fn is_corruption(&self) -> bool {
        matches!(self, VaultError::Corruption(_))
    }

    /// True for disk-full and permission failures.
    pub fn is_resource(&self) -> bool {
        match self {
            VaultError::Resource(_) => true,
            VaultError::Io(e) => StorageError::is_resource_io(e),
            _ => false,
        }
    }
}

impl From<StorageError> for VaultError {
    fn from(e: StorageError) -> Self {
        if e.is_corruption() {
            VaultError::Corruption(e.to_string())
        } else if e.is_resource() {
            VaultError::Resource(e.to_string())
        } else {
            match e {
                StorageError::IoError(io) => VaultError::Io(io),
                other => VaultError::Storage(other),
            }
        }
    }
}

impl From<MetaError> for VaultError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::Path(p) => VaultError::Path(p),
            MetaError::Corruption(msg) => VaultError::Corruption(msg),
            other => VaultError::Meta(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_classified() {
        let e: VaultError = StorageError::OutOfSpace {
            needed: 10,
            available: 1,
        }
        .into();
        assert!(e.is_resource());

        let e: VaultError = StorageError::ChecksumMismatch {
            path: "/x".into(),
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(e.is_corruption());
    }

    #[test]
    fn test_meta_errors_are_classified() {
        let e: VaultError = MetaError::Path(PathError::NotEmpty("/d".into())).into();
        assert!(matches!(e, VaultError::Path(PathError::NotEmpty(_))));
        let e: VaultError = MetaError::Corruption("bad".into()).into();
        assert!(e.is_corruption());
    }

    #[test]
    fn test_display() {
        let e = VaultError::TransactionFailed {
            tx_id: 7,
            reason: "disk full".into(),
        };
        assert_eq!(e.to_string(), "Transaction 7 failed: disk full");
    }
}
