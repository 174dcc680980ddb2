//! Content hashes for plaintext integrity checks.
//!
//! Chunks record the BLAKE3 hash of their plaintext. Downloads and cached
//! blocks are accepted only when the decrypted content hashes to the same
//! value.

use serde::{Deserialize, Serialize};

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = 32;

/// BLAKE3 hash of a block's plaintext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; HASH_LEN]);

impl ContentHash {
    /// Hashes a complete buffer.
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Parses the lowercase hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(h: blake3::Hash) -> Self {
        Self(*h.as_bytes())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

/// Incremental hasher that yields a [`ContentHash`].
#[derive(Clone, Default)]
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    /// Feeds more plaintext.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Hash of everything fed so far.
    pub fn finish(&self) -> ContentHash {
        self.0.finalize().into()
    }
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentHasher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = vec![7u8; 10_000];
        let mut hasher = ContentHasher::new();
        for part in data.chunks(333) {
            hasher.update(part);
        }
        assert_eq!(hasher.finish(), ContentHash::compute(&data));
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = ContentHash::compute(b"vaultfs");
        let parsed = ContentHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(h.to_string().len(), 64);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentHash::from_hex("zz").is_none());
        assert!(ContentHash::from_hex("abcd").is_none());
    }
}
