//! Error types for the storage subsystem.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures raised by the streaming block cipher.
///
/// Every variant means the ciphertext cannot be trusted; once a stream has
/// returned one of these it refuses further input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// The length-prefixed header is not the size this format produces.
    #[error("Malformed cipher header: declared {declared} bytes, expected {expected}")]
    MalformedHeader {
        /// Length found in the prefix.
        declared: usize,
        /// Length this format writes.
        expected: usize,
    },

    /// The session key could not be unwrapped with the account key.
    #[error("Cipher header does not unwrap with this account key")]
    WrongKey,

    /// The stream ended before its final segment.
    #[error("Ciphertext truncated: {reason}")]
    Truncated {
        /// What was missing.
        reason: String,
    },

    /// A segment failed authentication.
    #[error("Ciphertext segment {segment} failed authentication")]
    Tampered {
        /// Zero-based segment counter.
        segment: u32,
    },

    /// Input arrived after the final segment was processed.
    #[error("Cipher stream already finalized")]
    Finalized,

    /// A previous call on this stream failed.
    #[error("Cipher stream poisoned by an earlier error")]
    Poisoned,
}

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Encryption or decryption failed.
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Block content does not match its recorded checksum.
    #[error("Checksum mismatch on {path:?}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// The block file.
        path: PathBuf,
        /// Checksum the caller expected.
        expected: String,
        /// Checksum computed from the content.
        actual: String,
    },

    /// A block file is shorter than it should be and stopped growing.
    #[error("Timed out waiting for {path:?} to reach {expected} bytes (have {actual})")]
    ReadTimeout {
        /// The block file.
        path: PathBuf,
        /// Expected ciphertext length.
        expected: u64,
        /// Bytes present when the wait gave up.
        actual: u64,
    },

    /// The operation is not valid in the block's current mode.
    #[error("Invalid block mode for {operation} on {path:?}")]
    InvalidMode {
        /// The attempted operation.
        operation: &'static str,
        /// The block file.
        path: PathBuf,
    },

    /// The cache cannot make room for a new block.
    #[error("Out of space: need {needed} bytes, {available} available")]
    OutOfSpace {
        /// Bytes requested.
        needed: u64,
        /// Bytes available after eviction.
        available: u64,
    },

    /// Cache key is empty or contains path separators.
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),
}

impl StorageError {
    /// True when the error means the block content is damaged rather than
    /// temporarily unavailable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Cipher(_) | StorageError::ChecksumMismatch { .. }
        )
    }

    /// True when the error is a local resource failure (disk full, permissions).
    pub fn is_resource(&self) -> bool {
        match self {
            StorageError::OutOfSpace { .. } => true,
            StorageError::IoError(e) => Self::is_resource_io(e),
            _ => false,
        }
    }

    /// True for I/O errors caused by a full disk or missing permissions.
    pub fn is_resource_io(e: &std::io::Error) -> bool {
        e.kind() == std::io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(libc::ENOSPC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_errors_are_corruption() {
        let err: StorageError = CipherError::WrongKey.into();
        assert!(err.is_corruption());
        assert!(!err.is_resource());
    }

    #[test]
    fn test_permission_denied_is_resource() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: StorageError = io.into();
        assert!(err.is_resource());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::OutOfSpace {
            needed: 10,
            available: 3,
        };
        assert_eq!(err.to_string(), "Out of space: need 10 bytes, 3 available");
    }
}
