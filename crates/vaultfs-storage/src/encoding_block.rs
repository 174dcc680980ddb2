//! Encrypted block files.
//!
//! An [`EncodingBlock`] wraps one file in the cache. While being written it
//! encrypts and appends plaintext and keeps a running BLAKE3 hash; after
//! [`EncodingBlock::finalize`] it switches to read mode and decrypts from the
//! start. Readers may open a block whose file is still growing (a transfer
//! in progress) and will wait, with bounded retries, for the bytes to land.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::checksum::{ContentHash, ContentHasher};
use crate::cipher::{expected_ciphertext_len, AccountKeys, Decryptor, Encryptor};
use crate::error::{StorageError, StorageResult};
use crate::lock_registry::BlockRegistry;

/// Ciphertext bytes pulled from disk per read step.
const READ_CHUNK: usize = 64 * 1024;

/// Retry behaviour for reads that outrun a growing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIoConfig {
    /// Attempts before giving up on a file that stopped growing (default 30).
    pub read_retry_count: u32,
    /// Pause between attempts (default 1s).
    pub read_retry_sleep: Duration,
}

impl Default for BlockIoConfig {
    fn default() -> Self {
        Self {
            read_retry_count: 30,
            read_retry_sleep: Duration::from_secs(1),
        }
    }
}

/// Everything a block needs besides its path: account keys, the shared lock
/// registry and read retry settings.
#[derive(Debug, Clone)]
pub struct BlockContext {
    /// Keys blocks are sealed to.
    pub keys: Arc<AccountKeys>,
    /// Lock registry shared with the cache.
    pub registry: Arc<BlockRegistry>,
    /// Read retry settings.
    pub io: BlockIoConfig,
}

impl BlockContext {
    /// Creates a context with a fresh registry.
    pub fn new(keys: Arc<AccountKeys>, io: BlockIoConfig) -> Self {
        Self {
            keys,
            registry: Arc::new(BlockRegistry::new()),
            io,
        }
    }
}

enum Mode {
    Write {
        file: File,
        enc: Encryptor,
    },
    RawWrite {
        file: File,
    },
    Read {
        file: Option<File>,
        dec: Decryptor,
        expected: u64,
        pos: u64,
        pending: Vec<u8>,
        hasher: ContentHasher,
        done: bool,
    },
    Closed,
}

impl Mode {
    fn reader(keys: &AccountKeys, expected: u64) -> Self {
        Mode::Read {
            file: None,
            dec: keys.decryptor(),
            expected,
            pos: 0,
            pending: Vec::new(),
            hasher: ContentHasher::new(),
            done: false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Mode::Write { .. } => "write",
            Mode::RawWrite { .. } => "raw-write",
            Mode::Read { .. } => "read",
            Mode::Closed => "closed",
        }
    }
}

struct BlockInner {
    mode: Mode,
    plain_len: u64,
    raw_len: u64,
    write_hasher: ContentHasher,
    checksum: Option<ContentHash>,
}

/// A single encrypted block file.
pub struct EncodingBlock {
    path: PathBuf,
    ctx: BlockContext,
    inner: Mutex<BlockInner>,
}

impl std::fmt::Debug for EncodingBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodingBlock")
            .field("path", &self.path)
            .field("mode", &self.inner.lock().mode.name())
            .finish()
    }
}

impl EncodingBlock {
    fn with_mode(path: &Path, ctx: &BlockContext, mode: Mode) -> Self {
        ctx.registry.acquire(path);
        Self {
            path: path.to_path_buf(),
            ctx: ctx.clone(),
            inner: Mutex::new(BlockInner {
                mode,
                plain_len: 0,
                raw_len: 0,
                write_hasher: ContentHasher::new(),
                checksum: None,
            }),
        }
    }

    /// Opens `path` for encrypted writing.
    ///
    /// Existing content left by an unclean shutdown is decrypted and
    /// re-encrypted under a fresh session so the block continues from where
    /// it stopped. If that replay fails the file is deleted and the block
    /// starts empty.
    pub fn create(path: &Path, ctx: &BlockContext) -> StorageResult<Self> {
        let existing = match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => Some(meta.len()),
            _ => None,
        };
        let recovered = match existing {
            Some(len) => match recover_plaintext(path, &ctx.keys) {
                Ok(plain) => {
                    debug!(path = ?path, cipher_len = len, plain_len = plain.len(), "replaying partial block");
                    Some(plain)
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "partial block unreadable, discarding");
                    None
                }
            },
            None => None,
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let (_, enc) = ctx.keys.encryptor();
        let block = Self::with_mode(path, ctx, Mode::Write { file, enc });

        if let Some(plain) = recovered {
            if let Err(e) = block.write(&plain) {
                warn!(path = ?path, error = %e, "replay of partial block failed, starting empty");
                drop(block);
                let _ = std::fs::remove_file(path);
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?;
                let (_, enc) = ctx.keys.encryptor();
                return Ok(Self::with_mode(path, ctx, Mode::Write { file, enc }));
            }
        }
        Ok(block)
    }

    /// Opens `path` for appending ciphertext received from elsewhere.
    pub fn create_raw(path: &Path, ctx: &BlockContext) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_mode(path, ctx, Mode::RawWrite { file }))
    }

    /// Opens a block holding `plain_len` bytes of plaintext for reading.
    ///
    /// The file may not exist yet or may still be growing.
    pub fn open_read(path: &Path, plain_len: u64, ctx: &BlockContext) -> Self {
        let expected = expected_ciphertext_len(plain_len);
        Self::with_mode(path, ctx, Mode::reader(&ctx.keys, expected))
    }

    /// Opens a complete block file, taking its current size as the expected length.
    pub fn open_existing(path: &Path, ctx: &BlockContext) -> StorageResult<Self> {
        let expected = std::fs::metadata(path)?.len();
        Ok(Self::with_mode(path, ctx, Mode::reader(&ctx.keys, expected)))
    }

    /// Encrypts and appends `data`, returning the ciphertext bytes written.
    pub fn write(&self, data: &[u8]) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let BlockInner {
            mode,
            plain_len,
            raw_len,
            write_hasher,
            ..
        } = &mut *inner;
        let Mode::Write { file, enc } = mode else {
            return Err(self.invalid("write"));
        };
        let out = enc.transform(data, false)?;
        file.write_all(&out)?;
        write_hasher.update(data);
        *plain_len += data.len() as u64;
        *raw_len += out.len() as u64;
        Ok(out.len())
    }

    /// Appends ciphertext verbatim.
    pub fn write_raw(&self, data: &[u8]) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let Mode::RawWrite { file } = &mut inner.mode else {
            return Err(self.invalid("write_raw"));
        };
        file.write_all(data)?;
        inner.raw_len += data.len() as u64;
        Ok(data.len())
    }

    /// Completes a write and switches the block to read mode.
    ///
    /// A second call, or a call on a block opened for reading, does nothing.
    pub fn finalize(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let mode = std::mem::replace(&mut inner.mode, Mode::Closed);
        match mode {
            Mode::Write { mut file, mut enc } => {
                let out = enc.transform(&[], true)?;
                file.write_all(&out)?;
                file.sync_all()?;
                inner.raw_len += out.len() as u64;
                inner.checksum = Some(inner.write_hasher.finish());
                debug!(
                    path = ?self.path,
                    plain_len = inner.plain_len,
                    raw_len = inner.raw_len,
                    "finalized block"
                );
            }
            Mode::RawWrite { file } => {
                file.sync_all()?;
                debug!(path = ?self.path, raw_len = inner.raw_len, "finalized raw block");
            }
            other @ (Mode::Read { .. } | Mode::Closed) => {
                inner.mode = other;
                return Ok(());
            }
        }
        inner.mode = Mode::reader(&self.ctx.keys, inner.raw_len);
        Ok(())
    }

    /// Decrypts and returns up to `n` bytes of plaintext. An empty result
    /// means the end of the block.
    pub fn read(&self, n: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let BlockInner { mode, checksum, .. } = &mut *inner;
        let Mode::Read {
            file,
            dec,
            expected,
            pos,
            pending,
            hasher,
            done,
        } = mode
        else {
            return Err(self.invalid("read"));
        };

        let mut attempts = 0u32;
        let mut buf = vec![0u8; READ_CHUNK];
        while pending.len() < n && !*done {
            let want = (*expected - *pos).min(READ_CHUNK as u64) as usize;
            let got = if want == 0 {
                0
            } else {
                match self.read_some(file, &mut buf[..want])? {
                    Some(got) => got,
                    None => 0,
                }
            };

            if got == 0 && *pos < *expected {
                attempts += 1;
                if attempts > self.ctx.io.read_retry_count {
                    return Err(StorageError::ReadTimeout {
                        path: self.path.clone(),
                        expected: *expected,
                        actual: *pos,
                    });
                }
                std::thread::sleep(self.ctx.io.read_retry_sleep);
                continue;
            }
            attempts = 0;
            *pos += got as u64;

            let last = *pos >= *expected;
            let plain = dec.transform(&buf[..got], last)?;
            hasher.update(&plain);
            pending.extend_from_slice(&plain);
            if last {
                *done = true;
                checksum.get_or_insert_with(|| hasher.finish());
            }
        }

        let take = n.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    fn read_some(&self, file: &mut Option<File>, buf: &mut [u8]) -> StorageResult<Option<usize>> {
        if file.is_none() {
            match File::open(&self.path) {
                Ok(f) => *file = Some(f),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        match file.as_mut() {
            Some(f) => Ok(Some(f.read(buf)?)),
            None => Ok(None),
        }
    }

    /// Reads the remaining plaintext.
    pub fn read_all(&self) -> StorageResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let part = self.read(READ_CHUNK)?;
            if part.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&part);
        }
    }

    /// Returns the complete ciphertext of a finalized block.
    pub fn read_raw_all(&self) -> StorageResult<Vec<u8>> {
        let expected = match &self.inner.lock().mode {
            Mode::Read { expected, .. } => *expected,
            _ => return Err(self.invalid("read_raw_all")),
        };
        let data = std::fs::read(&self.path)?;
        if data.len() as u64 != expected {
            return Err(StorageError::ReadTimeout {
                path: self.path.clone(),
                expected,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// BLAKE3 hash of the block's plaintext.
    ///
    /// Known immediately for blocks written through [`write`](Self::write);
    /// otherwise the block is decrypted once through a separate handle.
    pub fn checksum(&self) -> StorageResult<ContentHash> {
        if let Some(sum) = self.inner.lock().checksum {
            return Ok(sum);
        }
        let verifier = self.clone_handle()?;
        let mut hasher = ContentHasher::new();
        loop {
            let part = verifier.read(READ_CHUNK)?;
            if part.is_empty() {
                break;
            }
            hasher.update(&part);
        }
        let sum = hasher.finish();
        self.inner.lock().checksum = Some(sum);
        Ok(sum)
    }

    /// Opens an independent read handle on the same file.
    pub fn clone_handle(&self) -> StorageResult<EncodingBlock> {
        let inner = self.inner.lock();
        let expected = match &inner.mode {
            Mode::Read { expected, .. } => *expected,
            _ => return Err(self.invalid("clone")),
        };
        let clone = Self::with_mode(&self.path, &self.ctx, Mode::reader(&self.ctx.keys, expected));
        clone.inner.lock().checksum = inner.checksum;
        Ok(clone)
    }

    /// Schedules the file for deletion once every handle is dropped.
    pub fn remove(&self) {
        self.ctx.registry.remove_on_unlock(&self.path);
    }

    /// Path of the block file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the block, which is its cache key.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Plaintext bytes written through this handle.
    pub fn plain_len(&self) -> u64 {
        self.inner.lock().plain_len
    }

    /// Expected ciphertext length once in read mode.
    pub fn expected_len(&self) -> Option<u64> {
        match &self.inner.lock().mode {
            Mode::Read { expected, .. } => Some(*expected),
            _ => None,
        }
    }

    /// Current size of the file on disk.
    pub fn actual_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// True once the block is readable.
    pub fn is_finalized(&self) -> bool {
        matches!(self.inner.lock().mode, Mode::Read { .. })
    }

    fn invalid(&self, operation: &'static str) -> StorageError {
        StorageError::InvalidMode {
            operation,
            path: self.path.clone(),
        }
    }
}

impl Drop for EncodingBlock {
    fn drop(&mut self) {
        self.inner.get_mut().mode = Mode::Closed;
        self.ctx.registry.release(&self.path);
    }
}

/// Decrypts what an interrupted writer left behind: the whole block when it
/// was finalized, otherwise every complete segment.
fn recover_plaintext(path: &Path, keys: &AccountKeys) -> StorageResult<Vec<u8>> {
    let data = std::fs::read(path)?;
    if let Ok(plain) = keys.decryptor().transform(&data, true) {
        return Ok(plain);
    }
    Ok(keys.decryptor().transform(&data, false)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::SEGMENT_SIZE;

    fn ctx() -> BlockContext {
        BlockContext::new(
            Arc::new(AccountKeys::generate()),
            BlockIoConfig {
                read_retry_count: 3,
                read_retry_sleep: Duration::from_millis(5),
            },
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[test]
    fn test_write_finalize_read() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let path = dir.path().join("blk");
        let block = EncodingBlock::create(&path, &ctx).unwrap();
        let data = pattern(150_000);
        let mut raw = 0;
        for part in data.chunks(40_000) {
            raw += block.write(part).unwrap();
        }
        block.finalize().unwrap();
        assert_eq!(block.expected_len(), Some(block.actual_size()));
        assert!(raw as u64 <= block.actual_size());
        assert_eq!(block.read_all().unwrap(), data);
        assert_eq!(block.checksum().unwrap(), ContentHash::compute(&data));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let block = EncodingBlock::create(&dir.path().join("blk"), &ctx).unwrap();
        block.write(b"hello world").unwrap();
        block.finalize().unwrap();
        let sum = block.checksum().unwrap();
        let len = block.expected_len();
        block.finalize().unwrap();
        assert_eq!(block.checksum().unwrap(), sum);
        assert_eq!(block.expected_len(), len);
        assert_eq!(block.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn test_empty_block() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let block = EncodingBlock::create(&dir.path().join("blk"), &ctx).unwrap();
        block.finalize().unwrap();
        assert!(block.read_all().unwrap().is_empty());
        assert_eq!(block.checksum().unwrap(), ContentHash::compute(&[]));
    }

    #[test]
    fn test_clone_handles_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let path = dir.path().join("blk");
        let block = EncodingBlock::create(&path, &ctx).unwrap();
        block.write(b"abcdef").unwrap();
        block.finalize().unwrap();

        let other = block.clone_handle().unwrap();
        assert_eq!(block.read(2).unwrap(), b"ab");
        assert_eq!(other.read(4).unwrap(), b"abcd");
        assert_eq!(block.read(10).unwrap(), b"cdef");
        assert_eq!(ctx.registry.ref_count(&path), 2);
        drop(other);
        assert_eq!(ctx.registry.ref_count(&path), 1);
    }

    #[test]
    fn test_remove_deferred_until_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let path = dir.path().join("blk");
        let block = EncodingBlock::create(&path, &ctx).unwrap();
        block.write(b"x").unwrap();
        block.finalize().unwrap();
        block.remove();
        assert!(path.exists());
        drop(block);
        assert!(!path.exists());
    }

    #[test]
    fn test_raw_write_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let src = EncodingBlock::create(&dir.path().join("src"), &ctx).unwrap();
        let data = pattern(SEGMENT_SIZE + 77);
        src.write(&data).unwrap();
        src.finalize().unwrap();
        let raw = src.read_raw_all().unwrap();

        let dst = EncodingBlock::create_raw(&dir.path().join("dst"), &ctx).unwrap();
        for part in raw.chunks(1000) {
            dst.write_raw(part).unwrap();
        }
        dst.finalize().unwrap();
        assert_eq!(dst.checksum().unwrap(), ContentHash::compute(&data));
        assert_eq!(dst.read_all().unwrap(), data);
    }

    #[test]
    fn test_truncated_block_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let path = dir.path().join("blk");
        let block = EncodingBlock::create(&path, &ctx).unwrap();
        block.write(&pattern(5000)).unwrap();
        block.finalize().unwrap();
        drop(block);

        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 100).unwrap();
        drop(f);

        let reopened = EncodingBlock::open_existing(&path, &ctx).unwrap();
        let err = reopened.checksum().unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn test_read_times_out_on_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let block = EncodingBlock::open_read(&dir.path().join("missing"), 10, &ctx);
        assert!(matches!(
            block.read(10),
            Err(StorageError::ReadTimeout { .. })
        ));
    }

    #[test]
    fn test_read_waits_for_growing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BlockContext::new(
            Arc::new(AccountKeys::generate()),
            BlockIoConfig {
                read_retry_count: 200,
                read_retry_sleep: Duration::from_millis(5),
            },
        );
        let data = pattern(3 * SEGMENT_SIZE);
        let (_, mut enc) = ctx.keys.encryptor();
        let ct = enc.transform(&data, true).unwrap();
        let path = dir.path().join("growing");

        let reader = EncodingBlock::open_read(&path, data.len() as u64, &ctx);
        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            let mut f = File::create(&writer_path).unwrap();
            for part in ct.chunks(50_000) {
                f.write_all(part).unwrap();
                f.flush().unwrap();
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        assert_eq!(reader.read_all().unwrap(), data);
        writer.join().unwrap();
    }

    #[test]
    fn test_reopen_replays_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let path = dir.path().join("blk");
        let data = pattern(2 * SEGMENT_SIZE + 10);
        {
            let block = EncodingBlock::create(&path, &ctx).unwrap();
            block.write(&data).unwrap();
            // dropped without finalize: only whole segments reached the file
        }
        let block = EncodingBlock::create(&path, &ctx).unwrap();
        let kept = block.plain_len() as usize;
        assert!(kept > 0 && kept <= data.len());
        block.write(&data[kept..]).unwrap();
        block.finalize().unwrap();
        assert_eq!(block.read_all().unwrap(), data);
    }

    #[test]
    fn test_reopen_discards_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();
        let path = dir.path().join("blk");
        std::fs::write(&path, vec![0xAB; 500]).unwrap();
        let block = EncodingBlock::create(&path, &ctx).unwrap();
        assert_eq!(block.plain_len(), 0);
        block.write(b"fresh").unwrap();
        block.finalize().unwrap();
        assert_eq!(block.read_all().unwrap(), b"fresh");
    }
}
