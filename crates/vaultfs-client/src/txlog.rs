//! Transaction log: the crash-recovery record of uploads and downloads.
//!
//! Each record is framed as `(len u32, crc32 u32)` followed by `len` bytes:
//! a kind byte and a fixed little-endian body with trailing names.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{VaultError, VaultResult};

/// Transaction identifier.
pub type TxId = u64;

/// Direction of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    /// Local data going to the backend.
    Upload,
    /// Backend data coming into the cache.
    Download,
}

impl TxKind {
    fn code(self) -> u8 {
        match self {
            TxKind::Upload => 1,
            TxKind::Download => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TxKind::Upload),
            2 => Some(TxKind::Download),
            _ => None,
        }
    }
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TxKind::Upload => "UPLOAD",
            TxKind::Download => "DOWNLOAD",
        })
    }
}

/// Transaction state. INIT -> LOCAL_SAVED -> FINISHED, or FAILED from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    /// Blocks are being staged.
    Init,
    /// Every block is local; transfers are queued.
    LocalSaved,
    /// Every block transferred and, for uploads, the namespace updated.
    Finished,
    /// Abandoned.
    Failed,
}

impl TxStatus {
    fn code(self) -> u8 {
        match self {
            TxStatus::Init => 0,
            TxStatus::LocalSaved => 1,
            TxStatus::Finished => 2,
            TxStatus::Failed => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TxStatus::Init),
            1 => Some(TxStatus::LocalSaved),
            2 => Some(TxStatus::Finished),
            3 => Some(TxStatus::Failed),
            _ => None,
        }
    }

    /// True for FINISHED and FAILED.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Finished | TxStatus::Failed)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TxStatus::Init => "INIT",
            TxStatus::LocalSaved => "LOCAL_SAVED",
            TxStatus::Finished => "FINISHED",
            TxStatus::Failed => "FAILED",
        })
    }
}

/// Change to one block of a transaction. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUpdate {
    /// Offset of the block within the file.
    pub seek: u64,
    /// Plaintext size.
    pub size: Option<u64>,
    /// Cache key of the local block file.
    pub local: Option<String>,
    /// Backend key.
    pub remote: Option<String>,
    /// The transfer of this block completed.
    pub done: bool,
}

/// A transaction log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A transaction began.
    Start {
        /// Transaction id.
        tx_id: TxId,
        /// Direction.
        kind: TxKind,
        /// Replicas used for the transfer.
        replica_count: u8,
        /// Seconds since the Unix epoch.
        start_time: u64,
        /// Namespace path of the file.
        path: String,
    },
    /// A transaction changed state.
    UpdateState {
        /// Transaction id.
        tx_id: TxId,
        /// New state.
        status: TxStatus,
    },
    /// A block of a transaction changed.
    UpdateBlock {
        /// Transaction id.
        tx_id: TxId,
        /// The change.
        update: BlockUpdate,
    },
}

impl LogRecord {
    /// Transaction the record belongs to.
    pub fn tx_id(&self) -> TxId {
        match self {
            LogRecord::Start { tx_id, .. }
            | LogRecord::UpdateState { tx_id, .. }
            | LogRecord::UpdateBlock { tx_id, .. } => *tx_id,
        }
    }
}

const KIND_START: u8 = 1;
const KIND_STATE: u8 = 2;
const KIND_BLOCK: u8 = 3;

const FLAG_SIZE: u8 = 0x01;
const FLAG_LOCAL: u8 = 0x02;
const FLAG_REMOTE: u8 = 0x04;
const FLAG_DONE: u8 = 0x08;

const FRAME_HEADER_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct FrameHeader {
    len: u32,
    /// CRC of `len` alone; only a frame with an intact length may be torn.
    len_crc: u32,
    crc: u32,
}

impl FrameHeader {
    fn for_body(body: &[u8]) -> Self {
        let len = body.len() as u32;
        Self {
            len,
            len_crc: crc32fast::hash(&len.to_le_bytes()),
            crc: crc32fast::hash(body),
        }
    }

    fn len_intact(&self) -> bool {
        crc32fast::hash(&self.len.to_le_bytes()) == self.len_crc
    }
}

#[derive(Serialize, Deserialize)]
struct StartBody {
    tx_id: u64,
    kind: u8,
    replica_count: u8,
    start_time: u64,
    path_len: u16,
}

#[derive(Serialize, Deserialize)]
struct StateBody {
    tx_id: u64,
    status: u8,
}

#[derive(Serialize, Deserialize)]
struct BlockBody {
    tx_id: u64,
    seek: u64,
    size: u64,
    flags: u8,
    local_len: u16,
    remote_len: u16,
}

fn protocol(what: impl std::fmt::Display) -> VaultError {
    VaultError::Protocol(what.to_string())
}

fn put<T: Serialize>(out: &mut Vec<u8>, body: &T) -> VaultResult<()> {
    bincode::serialize_into(out, body).map_err(protocol)
}

fn name_len(name: &str) -> VaultResult<u16> {
    u16::try_from(name.len()).map_err(|_| protocol(format!("name of {} bytes is too long", name.len())))
}

/// Encodes a record as one frame.
pub fn encode_record(record: &LogRecord) -> VaultResult<Vec<u8>> {
    let mut body = Vec::new();
    match record {
        LogRecord::Start {
            tx_id,
            kind,
            replica_count,
            start_time,
            path,
        } => {
            body.push(KIND_START);
            put(
                &mut body,
                &StartBody {
                    tx_id: *tx_id,
                    kind: kind.code(),
                    replica_count: *replica_count,
                    start_time: *start_time,
                    path_len: name_len(path)?,
                },
            )?;
            body.extend_from_slice(path.as_bytes());
        }
        LogRecord::UpdateState { tx_id, status } => {
            body.push(KIND_STATE);
            put(
                &mut body,
                &StateBody {
                    tx_id: *tx_id,
                    status: status.code(),
                },
            )?;
        }
        LogRecord::UpdateBlock { tx_id, update } => {
            let local = update.local.as_deref().unwrap_or("");
            let remote = update.remote.as_deref().unwrap_or("");
            let mut flags = 0;
            if update.size.is_some() {
                flags |= FLAG_SIZE;
            }
            if update.local.is_some() {
                flags |= FLAG_LOCAL;
            }
            if update.remote.is_some() {
                flags |= FLAG_REMOTE;
            }
            if update.done {
                flags |= FLAG_DONE;
            }
            body.push(KIND_BLOCK);
            put(
                &mut body,
                &BlockBody {
                    tx_id: *tx_id,
                    seek: update.seek,
                    size: update.size.unwrap_or(0),
                    flags,
                    local_len: name_len(local)?,
                    remote_len: name_len(remote)?,
                },
            )?;
            body.extend_from_slice(local.as_bytes());
            body.extend_from_slice(remote.as_bytes());
        }
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    put(&mut frame, &FrameHeader::for_body(&body))?;
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn take_str(input: &mut &[u8], n: usize) -> VaultResult<String> {
    if input.len() < n {
        return Err(protocol("record name overruns frame"));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    String::from_utf8(head.to_vec()).map_err(protocol)
}

fn decode_body(body: &[u8]) -> VaultResult<LogRecord> {
    let (&kind, mut rest) = body.split_first().ok_or_else(|| protocol("empty record"))?;
    let record = match kind {
        KIND_START => {
            let b: StartBody = bincode::deserialize_from(&mut rest).map_err(protocol)?;
            LogRecord::Start {
                tx_id: b.tx_id,
                kind: TxKind::from_code(b.kind).ok_or_else(|| protocol(format!("unknown kind {}", b.kind)))?,
                replica_count: b.replica_count,
                start_time: b.start_time,
                path: take_str(&mut rest, b.path_len as usize)?,
            }
        }
        KIND_STATE => {
            let b: StateBody = bincode::deserialize_from(&mut rest).map_err(protocol)?;
            LogRecord::UpdateState {
                tx_id: b.tx_id,
                status: TxStatus::from_code(b.status)
                    .ok_or_else(|| protocol(format!("unknown status {}", b.status)))?,
            }
        }
        KIND_BLOCK => {
            let b: BlockBody = bincode::deserialize_from(&mut rest).map_err(protocol)?;
            let local = take_str(&mut rest, b.local_len as usize)?;
            let remote = take_str(&mut rest, b.remote_len as usize)?;
            LogRecord::UpdateBlock {
                tx_id: b.tx_id,
                update: BlockUpdate {
                    seek: b.seek,
                    size: (b.flags & FLAG_SIZE != 0).then_some(b.size),
                    local: (b.flags & FLAG_LOCAL != 0).then_some(local),
                    remote: (b.flags & FLAG_REMOTE != 0).then_some(remote),
                    done: b.flags & FLAG_DONE != 0,
                },
            }
        }
        other => return Err(protocol(format!("unknown record kind {}", other))),
    };
    if !rest.is_empty() {
        return Err(protocol(format!("{} trailing bytes in record", rest.len())));
    }
    Ok(record)
}

/// Parses a log image. Returns the records and the length of the complete
/// frames; a torn final frame is not an error, a damaged length anywhere is.
pub fn decode_log(data: &[u8]) -> VaultResult<(Vec<LogRecord>, usize)> {
    let mut records = Vec::new();
    let mut offset = 0;
    while data.len() - offset >= FRAME_HEADER_LEN {
        let header: FrameHeader =
            bincode::deserialize(&data[offset..offset + FRAME_HEADER_LEN]).map_err(protocol)?;
        if !header.len_intact() {
            return Err(protocol(format!("record length at offset {} is damaged", offset)));
        }
        let start = offset + FRAME_HEADER_LEN;
        let end = start + header.len as usize;
        if end > data.len() {
            break;
        }
        let body = &data[start..end];
        if crc32fast::hash(body) != header.crc {
            return Err(protocol(format!("record at offset {} fails its checksum", offset)));
        }
        records.push(decode_body(body)?);
        offset = end;
    }
    Ok((records, offset))
}

/// Outcome of opening the log.
#[derive(Debug, Default)]
pub struct LogReplay {
    /// Records in log order.
    pub records: Vec<LogRecord>,
    /// Bytes of a torn final frame that were cut off.
    pub truncated_bytes: u64,
    /// The log did not parse and was deleted.
    pub discarded: bool,
}

/// Append-only transaction log file.
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    file: File,
    appended: u64,
}

impl TransactionLog {
    /// Opens the log at `path` and replays it.
    ///
    /// A log with a damaged or unknown record is deleted and replaced by an
    /// empty one.
    pub fn open(path: &Path) -> VaultResult<(Self, LogReplay)> {
        let mut replay = LogReplay::default();
        let mut data = Vec::new();
        if path.exists() {
            File::open(path)?.read_to_end(&mut data)?;
        }
        match decode_log(&data) {
            Ok((records, valid)) => {
                replay.records = records;
                if valid < data.len() {
                    replay.truncated_bytes = (data.len() - valid) as u64;
                    warn!(path = ?path, truncated = replay.truncated_bytes, "cutting torn transaction log record");
                    OpenOptions::new().write(true).open(path)?.set_len(valid as u64)?;
                }
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "transaction log unreadable, starting empty");
                std::fs::remove_file(path)?;
                replay.discarded = true;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = ?path, records = replay.records.len(), "opened transaction log");
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                appended: 0,
            },
            replay,
        ))
    }

    /// Appends and syncs one record.
    pub fn append(&mut self, record: &LogRecord) -> VaultResult<()> {
        let frame = encode_record(record)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.appended += 1;
        Ok(())
    }

    /// Records appended since the last rewrite.
    pub fn appended_since_rewrite(&self) -> u64 {
        self.appended
    }

    /// Replaces the log with `records` through a temp file and rename.
    pub fn rewrite(&mut self, records: &[LogRecord]) -> VaultResult<()> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&encode_record(record)?);
        }
        let tmp = self.path.with_extension("compact");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.appended = 0;
        info!(records = records.len(), bytes = data.len(), "compacted transaction log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<LogRecord> {
        vec![
            LogRecord::Start {
                tx_id: 1,
                kind: TxKind::Upload,
                replica_count: 3,
                start_time: 1_700_000_000,
                path: "/docs/report.bin".into(),
            },
            LogRecord::UpdateBlock {
                tx_id: 1,
                update: BlockUpdate {
                    seek: 100_000,
                    size: Some(100_000),
                    local: Some("w-abc".into()),
                    remote: None,
                    done: false,
                },
            },
            LogRecord::UpdateState {
                tx_id: 1,
                status: TxStatus::LocalSaved,
            },
            LogRecord::UpdateBlock {
                tx_id: 1,
                update: BlockUpdate {
                    seek: 100_000,
                    remote: Some("k1".into()),
                    done: true,
                    ..BlockUpdate::default()
                },
            },
        ]
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        {
            let (mut log, replay) = TransactionLog::open(&path).unwrap();
            assert!(replay.records.is_empty());
            for r in sample() {
                log.append(&r).unwrap();
            }
            assert_eq!(log.appended_since_rewrite(), 4);
        }
        let (_log, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.records, sample());
        assert!(!replay.discarded);
    }

    #[test]
    fn test_torn_tail_is_cut() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        {
            let (mut log, _) = TransactionLog::open(&path).unwrap();
            for r in sample() {
                log.append(&r).unwrap();
            }
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 2).unwrap();

        let (mut log, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.records.len(), 3);
        assert!(replay.truncated_bytes > 0);
        log.append(&sample()[3]).unwrap();
        drop(log);
        let (_log, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.records, sample());
    }

    #[test]
    fn test_unknown_kind_discards_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        let mut body = vec![9u8, 1, 2, 3];
        let mut frame = Vec::new();
        put(&mut frame, &FrameHeader::for_body(&body)).unwrap();
        frame.append(&mut body);
        std::fs::write(&path, frame).unwrap();

        let (_log, replay) = TransactionLog::open(&path).unwrap();
        assert!(replay.discarded);
        assert!(replay.records.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_bad_crc_is_protocol_error() {
        let mut data = encode_record(&sample()[0]).unwrap();
        let last = data.len() - 1;
        data[last] ^= 1;
        assert!(matches!(decode_log(&data), Err(VaultError::Protocol(_))));
    }

    #[test]
    fn test_damaged_length_discards_whole_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        {
            let (mut log, _) = TransactionLog::open(&path).unwrap();
            for r in sample() {
                log.append(&r).unwrap();
            }
        }
        let mut data = std::fs::read(&path).unwrap();
        let second = encode_record(&sample()[0]).unwrap().len();
        data[second..second + 4].copy_from_slice(&10_000u32.to_le_bytes());
        assert!(matches!(decode_log(&data), Err(VaultError::Protocol(_))));

        data[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        let (_log, replay) = TransactionLog::open(&path).unwrap();
        assert!(replay.discarded);
        assert!(replay.records.is_empty());
        assert_eq!(replay.truncated_bytes, 0);
    }

    #[test]
    fn test_rewrite_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        let (mut log, _) = TransactionLog::open(&path).unwrap();
        for r in sample() {
            log.append(&r).unwrap();
        }
        log.rewrite(&sample()[..1]).unwrap();
        assert_eq!(log.appended_since_rewrite(), 0);
        log.append(&sample()[2]).unwrap();
        drop(log);
        let (_log, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.records, vec![sample()[0].clone(), sample()[2].clone()]);
    }
}
