//! Streaming file handles.
//!
//! A write handle encrypts data into staging blocks of at most
//! `max_block_size` plaintext bytes and commits them as one upload
//! transaction on close. A read handle starts a download transaction on
//! first use and decrypts blocks in order as they become local.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use vaultfs_meta::{Chunk, FileItem};
use vaultfs_storage::{ContentHash, EncodingBlock};

use crate::error::{VaultError, VaultResult};
use crate::transactions::TransactionManager;
use crate::txlog::TxId;

/// Plaintext bytes decrypted per step when reading.
pub const READ_STEP: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct WriteState {
    tx: Option<TxId>,
    block: Option<EncodingBlock>,
    block_seek: u64,
    block_len: u64,
    written: u64,
    failed: bool,
}

#[derive(Debug, Default)]
struct ReadState {
    download: Option<(TxId, FileItem)>,
    chunk_idx: usize,
    current: Option<EncodingBlock>,
    current_read: u64,
    pos: u64,
}

#[derive(Debug)]
enum Mode {
    Write(WriteState),
    Read(ReadState),
}

/// An open file in the vault.
#[derive(Debug)]
pub struct SmartFile {
    tm: Arc<TransactionManager>,
    path: String,
    mode: Mode,
    max_block_size: u64,
    block_wait: Duration,
    closed: bool,
}

impl SmartFile {
    pub(crate) fn for_write(tm: Arc<TransactionManager>, path: String, max_block_size: u64) -> Self {
        Self {
            tm,
            path,
            mode: Mode::Write(WriteState::default()),
            max_block_size: max_block_size.max(1),
            block_wait: Duration::ZERO,
            closed: false,
        }
    }

    pub(crate) fn for_read(tm: Arc<TransactionManager>, path: String, block_wait: Duration) -> Self {
        Self {
            tm,
            path,
            mode: Mode::Read(ReadState::default()),
            max_block_size: 0,
            block_wait,
            closed: false,
        }
    }

    /// Path the handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True for handles opened for writing.
    pub fn is_writable(&self) -> bool {
        matches!(self.mode, Mode::Write(_))
    }

    /// True once [`close`](Self::close) ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Transaction behind the handle, once one was started.
    pub fn transaction(&self) -> Option<TxId> {
        match &self.mode {
            Mode::Write(w) => w.tx,
            Mode::Read(r) => r.download.as_ref().map(|(tx, _)| *tx),
        }
    }

    /// Plaintext bytes written, or the position of a reader.
    pub fn position(&self) -> u64 {
        match &self.mode {
            Mode::Write(w) => w.written,
            Mode::Read(r) => r.pos,
        }
    }

    /// Appends `data`, sealing a block each time `max_block_size` is reached.
    ///
    /// Any failure abandons the whole write: the transaction is failed and
    /// the handle rejects further calls.
    pub fn write(&mut self, data: &[u8]) -> VaultResult<usize> {
        if self.closed {
            return Err(VaultError::InvalidOperation(format!("{} is closed", self.path)));
        }
        let max = self.max_block_size;
        let tm = self.tm.clone();
        let path = self.path.clone();
        let Mode::Write(state) = &mut self.mode else {
            return Err(VaultError::InvalidOperation(format!("{} is open for reading", path)));
        };
        if state.failed {
            return Err(VaultError::InvalidOperation(format!("write to {} already failed", path)));
        }

        let mut rest = data;
        while !rest.is_empty() {
            let result = Self::write_step(&tm, &path, max, state, rest);
            match result {
                Ok(n) => rest = &rest[n..],
                Err(e) => {
                    Self::abort(&tm, state, &e);
                    return Err(e);
                }
            }
        }
        Ok(data.len())
    }

    fn write_step(
        tm: &TransactionManager,
        path: &str,
        max: u64,
        state: &mut WriteState,
        data: &[u8],
    ) -> VaultResult<usize> {
        if state.block.is_none() {
            state.block = Some(tm.new_data_block()?);
            state.block_len = 0;
        }
        let room = (max - state.block_len).min(data.len() as u64) as usize;
        if let Some(block) = &state.block {
            block.write(&data[..room])?;
        }
        state.block_len += room as u64;
        state.written += room as u64;
        if state.block_len >= max {
            Self::seal_block(tm, path, state)?;
        }
        Ok(room)
    }

    /// Hands the current block to the upload transaction, starting the
    /// transaction with the first block.
    fn seal_block(tm: &TransactionManager, path: &str, state: &mut WriteState) -> VaultResult<()> {
        let Some(block) = state.block.take() else {
            return Ok(());
        };
        let tx = match state.tx {
            Some(tx) => tx,
            None => match tm.start_upload(path) {
                Ok(tx) => {
                    state.tx = Some(tx);
                    tx
                }
                Err(e) => {
                    block.remove();
                    return Err(e);
                }
            },
        };
        tm.add_upload_block(tx, state.block_seek, block)?;
        debug!(tx_id = tx, seek = state.block_seek, size = state.block_len, "sealed block");
        state.block_seek += state.block_len;
        state.block_len = 0;
        Ok(())
    }

    fn abort(tm: &TransactionManager, state: &mut WriteState, error: &VaultError) {
        if let Some(block) = state.block.take() {
            block.remove();
        }
        if let Some(tx) = state.tx {
            tm.fail(tx, &error.to_string());
        }
        state.failed = true;
    }

    /// Finishes the handle. For writers this seals the last block and
    /// commits the upload, or records an empty file when nothing was
    /// written. Calling it twice does nothing.
    pub fn close(&mut self) -> VaultResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let tm = self.tm.clone();
        match &mut self.mode {
            Mode::Read(state) => {
                state.current = None;
                Ok(())
            }
            Mode::Write(state) => {
                if state.failed {
                    return Err(VaultError::InvalidOperation(format!("write to {} already failed", self.path)));
                }
                let result = Self::seal_block(&tm, &self.path, state).and_then(|_| match state.tx {
                    Some(tx) => tm.commit_upload(tx),
                    None => tm.save_empty_file(&self.path),
                });
                if let Err(e) = &result {
                    Self::abort(&tm, state, e);
                }
                result
            }
        }
    }

    /// Reads up to `size` bytes, or everything left when `size` is `None`.
    /// An empty result means end of file.
    pub fn read(&mut self, size: Option<usize>) -> VaultResult<Vec<u8>> {
        if self.closed {
            return Err(VaultError::InvalidOperation(format!("{} is closed", self.path)));
        }
        let tm = self.tm.clone();
        let wait = self.block_wait;
        let Mode::Read(state) = &mut self.mode else {
            return Err(VaultError::InvalidOperation(format!("{} is open for writing", self.path)));
        };
        if state.download.is_none() {
            state.download = Some(tm.start_download(&self.path)?);
        }

        let mut out = Vec::new();
        loop {
            let want = match size {
                Some(n) if out.len() >= n => break,
                Some(n) => (n - out.len()).min(READ_STEP),
                None => READ_STEP,
            };
            let Some(chunk) = Self::current_chunk(&tm, state, wait)? else {
                break;
            };
            let Some(block) = &state.current else {
                break;
            };
            let part = block.read(want)?;
            if part.is_empty() {
                Self::finish_chunk(state, &chunk)?;
                continue;
            }
            state.current_read += part.len() as u64;
            state.pos += part.len() as u64;
            out.extend_from_slice(&part);
        }
        Ok(out)
    }

    /// Opens the next block if none is open, waiting for it to be local.
    /// Returns the chunk being read, `None` at end of file.
    fn current_chunk(tm: &TransactionManager, state: &mut ReadState, wait: Duration) -> VaultResult<Option<Chunk>> {
        let Some((tx, file)) = &state.download else {
            return Ok(None);
        };
        let Some(chunk) = file.chunks.get(state.chunk_idx).cloned() else {
            return Ok(None);
        };
        if state.current.is_none() {
            let key = chunk
                .key
                .as_deref()
                .ok_or_else(|| VaultError::Corruption(format!("chunk at {} has no key", chunk.seek)))?;
            tm.wait_block(*tx, chunk.seek, wait)?;
            let path = tm.cache().path_for(key)?;
            state.current = Some(EncodingBlock::open_read(&path, chunk.size, tm.cache().context()));
            state.current_read = 0;
        }
        Ok(Some(chunk))
    }

    fn finish_chunk(state: &mut ReadState, chunk: &Chunk) -> VaultResult<()> {
        let Some(block) = state.current.take() else {
            return Ok(());
        };
        if state.current_read != chunk.size {
            return Err(VaultError::Corruption(format!(
                "block at {} held {} bytes, expected {}",
                chunk.seek, state.current_read, chunk.size
            )));
        }
        let sum = block.checksum()?;
        if sum.0 != chunk.checksum {
            return Err(VaultError::Corruption(format!(
                "block at {} has checksum {}, expected {}",
                chunk.seek,
                sum,
                ContentHash(chunk.checksum)
            )));
        }
        state.chunk_idx += 1;
        Ok(())
    }

    /// Moves a reader forward to `offset`. Whole blocks before the offset are
    /// skipped without being read.
    pub fn seek(&mut self, offset: u64) -> VaultResult<u64> {
        if self.closed {
            return Err(VaultError::InvalidOperation(format!("{} is closed", self.path)));
        }
        let tm = self.tm.clone();
        let Mode::Read(state) = &mut self.mode else {
            return Err(VaultError::InvalidOperation("seek is not supported on write handles".to_string()));
        };
        if offset < state.pos {
            return Err(VaultError::InvalidOperation(format!(
                "cannot seek backwards from {} to {}",
                state.pos, offset
            )));
        }
        if state.download.is_none() {
            state.download = Some(tm.start_download(&self.path)?);
        }
        if state.current.is_none() {
            if let Some((_, file)) = &state.download {
                while let Some(chunk) = file.chunks.get(state.chunk_idx) {
                    if chunk.seek + chunk.size > offset {
                        break;
                    }
                    state.pos = chunk.seek + chunk.size;
                    state.chunk_idx += 1;
                }
            }
        }
        while self.position() < offset {
            let step = (offset - self.position()).min(READ_STEP as u64) as usize;
            if self.read(Some(step))?.is_empty() {
                break;
            }
        }
        Ok(self.position())
    }
}

impl Drop for SmartFile {
    fn drop(&mut self) {
        if !self.closed && self.is_writable() {
            if let Err(e) = self.close() {
                warn!(path = %self.path, error = %e, "closing dropped file failed");
            }
        }
    }
}

fn to_io(e: VaultError) -> io::Error {
    match e {
        VaultError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl io::Read for SmartFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = SmartFile::read(self, Some(buf.len())).map_err(to_io)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Write for SmartFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SmartFile::write(self, buf).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
