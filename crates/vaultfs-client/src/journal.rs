//! Append-only namespace journal.
//!
//! Every namespace mutation is appended as one fixed-size slot to
//! `static_cache/journal.bin`. The journal is the source of truth: the
//! namespace index can always be rebuilt by replaying it. The whole file is
//! replicated to the backend, encrypted to the account key, under
//! `journal-<hex public key>`.
//!
//! Slot layout: `(payload_len u32, operation u8, sequence u64)` little-endian,
//! the payload, zero padding to a multiple of [`SLOT_ALIGN`] bytes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vaultfs_meta::record::{decode_item, encode_item};
use vaultfs_meta::{DirectoryItem, ItemId, NamespaceItem};
use vaultfs_storage::{open_all, seal_all, AccountKeys};

use crate::backend::Backend;
use crate::error::{VaultError, VaultResult};
use crate::events::EventBus;

/// Slots are padded to a multiple of this many bytes.
pub const SLOT_ALIGN: usize = 64;
/// Largest payload one slot may carry.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;
const SLOT_HEADER_LEN: usize = 13;

const OP_APPEND: u8 = 1;
const OP_UPDATE: u8 = 2;
const OP_REMOVE: u8 = 3;

#[derive(Serialize, Deserialize)]
struct SlotHeader {
    payload_len: u32,
    operation: u8,
    sequence: u64,
}

/// A namespace mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// A new item, with its assigned id.
    Append(NamespaceItem),
    /// The new state of an existing item.
    Update(NamespaceItem),
    /// An item that was deleted.
    Remove(ItemId),
}

/// One journal slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// Monotonic sequence number, starting at 1.
    pub sequence: u64,
    /// The mutation.
    pub entry: JournalEntry,
}

/// Replication state of the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalStatus {
    /// The backend holds the current journal.
    Sync,
    /// Local appends are not replicated yet.
    NotSync,
    /// No journal exists locally.
    NotInit,
    /// The last replication attempt failed.
    SyncFailed,
}

impl std::fmt::Display for JournalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JournalStatus::Sync => "SYNC",
            JournalStatus::NotSync => "NOT_SYNC",
            JournalStatus::NotInit => "NOT_INIT",
            JournalStatus::SyncFailed => "SYNC_FAILED",
        };
        f.write_str(s)
    }
}

fn padded_len(payload_len: usize) -> usize {
    (SLOT_HEADER_LEN + payload_len).div_ceil(SLOT_ALIGN) * SLOT_ALIGN
}

fn encode_record(record: &JournalRecord) -> VaultResult<Vec<u8>> {
    let (operation, payload) = match &record.entry {
        JournalEntry::Append(item) => (OP_APPEND, encode_item(item)?),
        JournalEntry::Update(item) => (OP_UPDATE, encode_item(item)?),
        JournalEntry::Remove(id) => (OP_REMOVE, id.as_u32().to_le_bytes().to_vec()),
    };
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(VaultError::InvalidOperation(format!(
            "journal record of {} bytes exceeds {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }
    let header = SlotHeader {
        payload_len: payload.len() as u32,
        operation,
        sequence: record.sequence,
    };
    let mut out = bincode::serialize(&header).map_err(|e| VaultError::Corruption(e.to_string()))?;
    out.extend_from_slice(&payload);
    out.resize(padded_len(payload.len()), 0);
    Ok(out)
}

/// Parses one slot from the front of `data`.
///
/// Returns `Ok(None)` when `data` ends before a plausible slot does. A
/// header with an unknown operation or an impossible length is corruption.
fn decode_record(data: &[u8]) -> VaultResult<Option<(JournalRecord, usize)>> {
    if data.len() < SLOT_HEADER_LEN {
        return Ok(None);
    }
    let header: SlotHeader = bincode::deserialize(&data[..SLOT_HEADER_LEN])
        .map_err(|e| VaultError::Corruption(format!("journal slot header: {}", e)))?;
    if !matches!(header.operation, OP_APPEND | OP_UPDATE | OP_REMOVE) {
        return Err(VaultError::Corruption(format!(
            "journal slot {} has unknown operation {}",
            header.sequence, header.operation
        )));
    }
    if header.payload_len as usize > MAX_PAYLOAD_LEN {
        return Err(VaultError::Corruption(format!(
            "journal slot {} claims {} payload bytes",
            header.sequence, header.payload_len
        )));
    }
    let slot_len = padded_len(header.payload_len as usize);
    if data.len() < slot_len {
        return Ok(None);
    }
    let payload = &data[SLOT_HEADER_LEN..SLOT_HEADER_LEN + header.payload_len as usize];
    let entry = match header.operation {
        OP_APPEND => JournalEntry::Append(decode_item(payload)?),
        OP_UPDATE => JournalEntry::Update(decode_item(payload)?),
        OP_REMOVE if payload.len() == 4 => JournalEntry::Remove(ItemId::new(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))),
        other => {
            return Err(VaultError::Corruption(format!(
                "journal slot {} has operation {} with {} payload bytes",
                header.sequence,
                other,
                payload.len()
            )));
        }
    };
    Ok(Some((
        JournalRecord {
            sequence: header.sequence,
            entry,
        },
        slot_len,
    )))
}

/// Validates a whole journal image, returning its last sequence and the
/// length of the complete slots.
fn scan(data: &[u8]) -> VaultResult<(u64, usize)> {
    let mut offset = 0;
    let mut last = 0u64;
    while let Some((record, len)) = decode_record(&data[offset..])? {
        if record.sequence != last + 1 {
            return Err(VaultError::Corruption(format!(
                "journal sequence jumps from {} to {}",
                last, record.sequence
            )));
        }
        last = record.sequence;
        offset += len;
    }
    Ok((last, offset))
}

struct JournalState {
    file: Option<File>,
    last_seq: u64,
    status: JournalStatus,
    foreign: Option<Option<Vec<u8>>>,
    /// Last sequence known to be on the backend, `None` until checked.
    replicated: Option<u64>,
}

/// The namespace journal of one account.
pub struct Journal {
    path: PathBuf,
    keys: Arc<AccountKeys>,
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    replica_count: u8,
    wait_for_acks: u8,
    state: Mutex<JournalState>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("last_seq", &state.last_seq)
            .field("status", &state.status)
            .finish()
    }
}

impl Journal {
    /// Opens the local journal at `path`.
    ///
    /// A torn final slot is cut off, unless the replicated copy holds more
    /// records than what remains. A journal that does not parse, or one the
    /// replicated copy is ahead of, is discarded so it can be pulled from the
    /// backend again.
    pub fn open(
        path: &Path,
        keys: Arc<AccountKeys>,
        backend: Arc<dyn Backend>,
        events: Arc<EventBus>,
        replica_count: u8,
        wait_for_acks: u8,
    ) -> VaultResult<Self> {
        let journal = Self {
            path: path.to_path_buf(),
            keys,
            backend,
            events,
            replica_count,
            wait_for_acks,
            state: Mutex::new(JournalState {
                file: None,
                last_seq: 0,
                status: JournalStatus::NotInit,
                foreign: None,
                replicated: None,
            }),
        };
        if path.exists() {
            journal.load()?;
        }
        debug!(path = ?path, last_seq = journal.last_sequence(), status = %journal.status(), "opened journal");
        Ok(journal)
    }

    fn load(&self) -> VaultResult<()> {
        let data = std::fs::read(&self.path)?;
        let (last, valid) = match scan(&data) {
            Ok((last, valid)) if last > 0 => (last, valid),
            Ok(_) => {
                std::fs::remove_file(&self.path)?;
                return Ok(());
            }
            Err(e) => return self.discard(&e.to_string()),
        };
        if valid < data.len() {
            match self.fetch_replicated() {
                Ok(Some(remote)) if remote > last => {
                    return self.discard(&format!(
                        "local journal ends at {} but the replicated copy reaches {}",
                        last, remote
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not compare torn journal with the replicated copy"),
            }
            warn!(path = ?self.path, dropped = data.len() - valid, "cutting torn journal slot");
            OpenOptions::new().write(true).open(&self.path)?.set_len(valid as u64)?;
        }
        let mut state = self.state.lock();
        state.file = Some(OpenOptions::new().append(true).open(&self.path)?);
        state.last_seq = last;
        state.status = JournalStatus::NotSync;
        Ok(())
    }

    fn discard(&self, reason: &str) -> VaultResult<()> {
        self.events
            .error("journal", format!("local journal is corrupt, discarding: {}", reason));
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Fetches the replicated journal, keeps it for [`pull`](Self::pull) and
    /// returns its last sequence. `None` when the backend has no journal.
    fn fetch_replicated(&self) -> VaultResult<Option<u64>> {
        let fetched = self.backend.get(&self.remote_key(), self.replica_count)?;
        let last = match &fetched {
            Some(blob) => {
                let data = open_all(&self.keys, blob)
                    .map_err(|e| VaultError::Corruption(format!("replicated journal: {}", e)))?;
                Some(scan(&data)?.0)
            }
            None => None,
        };
        let mut state = self.state.lock();
        state.foreign = Some(fetched);
        state.replicated = Some(last.unwrap_or(0));
        Ok(last)
    }

    /// Backend key of this account's journal.
    pub fn remote_key(&self) -> String {
        format!("journal-{}", hex::encode(self.keys.public_bytes()))
    }

    /// True once a local journal with at least the root record exists.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Replication state.
    pub fn status(&self) -> JournalStatus {
        self.state.lock().status
    }

    /// Sequence of the newest record, zero when empty.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().last_seq
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().last_seq + 1
    }

    /// Creates the journal with the root directory record and replicates it.
    ///
    /// A failed replication leaves the journal in `SyncFailed` for the
    /// synchronizer to retry.
    pub fn init(&self, root: &DirectoryItem) -> VaultResult<u64> {
        {
            let mut state = self.state.lock();
            if state.file.is_some() {
                return Err(VaultError::InvalidOperation("journal already initialized".into()));
            }
            state.file = Some(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&self.path)?,
            );
        }
        let seq = self.append(JournalEntry::Append(root.clone().into()))?;
        if let Err(e) = self.sync() {
            warn!(error = %e, "initial journal replication failed");
        }
        info!(key = %self.remote_key(), "initialized journal");
        Ok(seq)
    }

    /// Appends a mutation and returns its sequence number.
    pub fn append(&self, entry: JournalEntry) -> VaultResult<u64> {
        let mut state = self.state.lock();
        let sequence = state.last_seq + 1;
        let slot = encode_record(&JournalRecord { sequence, entry })?;
        let file = state.file.as_mut().ok_or(VaultError::NotRegistered)?;
        file.write_all(&slot)?;
        file.sync_data()?;
        state.last_seq = sequence;
        state.status = JournalStatus::NotSync;
        debug!(sequence, "appended journal record");
        Ok(sequence)
    }

    /// Reads records with a sequence of at least `from` (all when `None`).
    ///
    /// Each call reads the file afresh, so iteration can be restarted at any
    /// point.
    pub fn iter(&self, from: Option<u64>) -> VaultResult<JournalIter> {
        let _state = self.state.lock();
        let data = if self.path.exists() {
            std::fs::read(&self.path)?
        } else {
            Vec::new()
        };
        Ok(JournalIter {
            data,
            offset: 0,
            from: from.unwrap_or(0),
        })
    }

    /// Uploads the whole journal, encrypted, to the backend.
    ///
    /// A local journal with fewer records than the replicated copy is never
    /// pushed; that is reported as corruption.
    pub fn sync(&self) -> VaultResult<()> {
        let (known, local) = {
            let state = self.state.lock();
            if state.file.is_none() {
                return Ok(());
            }
            (state.replicated, state.last_seq)
        };
        let remote = match known {
            Some(remote) => remote,
            None => match self.fetch_replicated() {
                Ok(remote) => remote.unwrap_or(0),
                Err(e) if e.is_corruption() => {
                    warn!(error = %e, "replicated journal unreadable, replacing it");
                    0
                }
                Err(e) => return Err(self.sync_failed(e)),
            },
        };
        if remote > local {
            let err = VaultError::Corruption(format!(
                "local journal ends at {} but the replicated copy reaches {}",
                local, remote
            ));
            self.state.lock().status = JournalStatus::SyncFailed;
            self.events.error("journal", format!("refusing to replicate journal: {}", err));
            return Err(err);
        }

        let (data, seq) = {
            let state = self.state.lock();
            (std::fs::read(&self.path)?, state.last_seq)
        };
        let blob = seal_all(self.keys.public_key(), &data);
        let key = self.remote_key();
        let result = self
            .backend
            .put(&blob, Some(&key), self.replica_count, self.wait_for_acks.min(self.replica_count));

        let mut state = self.state.lock();
        match result {
            Ok(_) => {
                if state.last_seq == seq {
                    state.status = JournalStatus::Sync;
                }
                state.replicated = Some(seq);
                debug!(sequence = seq, bytes = blob.len(), "replicated journal");
                Ok(())
            }
            Err(e) => {
                drop(state);
                Err(self.sync_failed(e.into()))
            }
        }
    }

    fn sync_failed(&self, error: VaultError) -> VaultError {
        self.state.lock().status = JournalStatus::SyncFailed;
        self.events
            .warning("journal", format!("journal replication failed: {}", error));
        error
    }

    /// True if the backend holds a journal for this account. The first
    /// successful check fetches and keeps the replicated copy.
    pub fn foreign_exists(&self) -> VaultResult<bool> {
        if let Some(found) = &self.state.lock().foreign {
            return Ok(found.is_some());
        }
        let fetched = self.backend.get(&self.remote_key(), self.replica_count)?;
        let exists = fetched.is_some();
        self.state.lock().foreign = Some(fetched);
        Ok(exists)
    }

    /// Replaces the local journal with the replicated copy.
    ///
    /// Returns false when the backend has no journal for this account.
    pub fn pull(&self) -> VaultResult<bool> {
        if !self.foreign_exists()? {
            return Ok(false);
        }
        let mut state = self.state.lock();
        let blob = match state.foreign.take().flatten() {
            Some(blob) => blob,
            None => return Ok(false),
        };
        let data = open_all(&self.keys, &blob)
            .map_err(|e| VaultError::Corruption(format!("replicated journal: {}", e)))?;
        let (last, valid) = scan(&data)?;
        if valid != data.len() || last == 0 {
            return Err(VaultError::Corruption("replicated journal is incomplete".into()));
        }

        let tmp = self.path.with_extension("pull");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        state.file = Some(OpenOptions::new().append(true).open(&self.path)?);
        state.last_seq = last;
        state.status = JournalStatus::Sync;
        state.replicated = Some(last);
        state.foreign = Some(None);
        info!(last_seq = last, "pulled journal from backend");
        Ok(true)
    }
}

/// Lazy iterator over journal records.
#[derive(Debug)]
pub struct JournalIter {
    data: Vec<u8>,
    offset: usize,
    from: u64,
}

impl Iterator for JournalIter {
    type Item = VaultResult<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match decode_record(&self.data[self.offset..]) {
                Ok(Some((record, len))) => {
                    self.offset += len;
                    if record.sequence >= self.from {
                        return Some(Ok(record));
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    self.offset = self.data.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Background thread re-replicating the journal while it is out of sync.
pub struct JournalSynchronizer {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl JournalSynchronizer {
    /// Starts checking `journal` every `interval`.
    pub fn start(journal: Arc<Journal>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("vaultfs-journal-sync".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if matches!(journal.status(), JournalStatus::NotSync | JournalStatus::SyncFailed) {
                            let _ = journal.sync();
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("journal synchronizer thread panicked");
            }
        }
    }
}

impl Drop for JournalSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}
