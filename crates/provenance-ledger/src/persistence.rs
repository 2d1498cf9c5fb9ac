//! On-disk ledger persistence: a checksummed, length-prefixed write-ahead
//! log with periodic segment compaction, a per-tenant metadata sidecar
//! written atomically, and the plain-text canonical receipt stream that
//! downstream, non-Rust collaborators read.
//!
//! The WAL framing mirrors the teacher's `PersistentAppendLog`: a 4-byte
//! big-endian length prefix, a 32-byte BLAKE3 checksum over a
//! domain-separated prefix plus body, then the canonical JSON body. Every
//! write is followed by `sync_all` so a crash mid-write leaves, at worst,
//! one truncated trailing record, which recovery detects and rejects.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use provenance_spec::{CompositeDigest, Receipt};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

const CHECKSUM_DOMAIN: &[u8] = b"provenance-ledger:wal:v1";

/// One WAL record: a receipt plus the ingestion metadata assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    /// The receipt as emitted.
    pub receipt: Receipt,
    /// Per-tenant sequence number assigned at ingestion.
    pub sequence: u64,
    /// The antecedent this receipt chains from, if any.
    pub parent_hash: Option<CompositeDigest>,
}

fn write_record(file: &mut File, record: &WalRecord) -> Result<(), LedgerError> {
    let bytes = serde_json::to_vec(record)
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to serialize wal record: {e}")))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let len = (bytes.len() as u32).to_be_bytes();
    file.write_all(&len)
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to write wal length prefix: {e}")))?;
    file.write_all(digest.as_bytes())
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to write wal checksum: {e}")))?;
    file.write_all(&bytes)
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to write wal body: {e}")))?;
    file.flush()
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to flush wal: {e}")))?;
    file.sync_all()
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to fsync wal: {e}")))?;
    Ok(())
}

/// Read every well-formed record from a length-prefixed, checksummed file.
/// A truncated trailing record (the crash-mid-write case) is rejected.
pub fn read_records(path: &Path) -> Result<Vec<WalRecord>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to open {}: {e}", path.display())))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to read {}: {e}", path.display())))?;
    let mut cursor = 0usize;
    let mut items = Vec::new();
    while cursor < buf.len() {
        if cursor + 4 > buf.len() {
            return Err(LedgerError::Storage(anyhow::anyhow!(
                "truncated record length in {}",
                path.display()
            )));
        }
        let len = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + 32 + len > buf.len() {
            return Err(LedgerError::Storage(anyhow::anyhow!(
                "truncated record body in {}",
                path.display()
            )));
        }
        let checksum: [u8; 32] = buf[cursor..cursor + 32].try_into().unwrap();
        cursor += 32;
        let body = &buf[cursor..cursor + len];
        cursor += len;
        let mut hasher = blake3::Hasher::new();
        hasher.update(CHECKSUM_DOMAIN);
        hasher.update(body);
        if *hasher.finalize().as_bytes() != checksum {
            return Err(LedgerError::Storage(anyhow::anyhow!(
                "wal checksum mismatch in {}",
                path.display()
            )));
        }
        let record: WalRecord = serde_json::from_slice(body).map_err(|e| {
            LedgerError::Storage(anyhow::anyhow!("failed to decode wal record: {e}"))
        })?;
        items.push(record);
    }
    Ok(items)
}

/// Per-tenant metadata sidecar: `state.<tenant>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantState {
    /// Last sequence number assigned to this tenant.
    pub last_sequence: u64,
    /// The most recent anchor root published for this tenant, if any.
    pub last_anchor_root: Option<String>,
}

/// Atomically rewrite a small JSON sidecar via a temp file plus rename.
pub fn write_sidecar_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let tmp = path.with_extension("tmp");
    let encoded = serde_json::to_vec_pretty(value)
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to serialize sidecar: {e}")))?;
    fs::write(&tmp, encoded)
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        LedgerError::Storage(anyhow::anyhow!(
            "failed to atomically persist {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

/// Read a tenant sidecar, if present.
pub fn read_sidecar<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}

/// The durable store backing a [`crate::Ledger`]: a WAL, a compacted segment
/// file, and the plain-text canonical receipt stream. Recovery replays the
/// segment file then the WAL, in that order, which is exactly insertion order
/// because compaction only ever moves whole records from WAL to segment.
pub struct LedgerStore {
    dir: PathBuf,
    wal_path: PathBuf,
    segments_path: PathBuf,
    stream_path: PathBuf,
    wal: File,
    segments: File,
    stream: File,
    wal_entries: usize,
}

impl LedgerStore {
    /// Open (or create) a ledger store at `dir`, replaying any existing WAL
    /// and segment file to recover prior entries.
    pub fn open(dir: impl AsRef<Path>) -> Result<(Self, Vec<WalRecord>), LedgerError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            LedgerError::Storage(anyhow::anyhow!("failed to create ledger dir {}: {e}", dir.display()))
        })?;
        fs::create_dir_all(dir.join("index")).ok();
        let wal_path = dir.join("receipts.wal");
        let segments_path = dir.join("receipts.segments");
        let stream_path = dir.join("receipts.jsonl");

        let mut entries = read_records(&segments_path)?;
        let wal_entries = read_records(&wal_path)?;
        let wal_count = wal_entries.len();
        entries.extend(wal_entries);

        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&wal_path)
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to open wal: {e}")))?;
        let segments = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&segments_path)
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to open segments: {e}")))?;
        let stream = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stream_path)
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to open receipt stream: {e}")))?;

        Ok((
            Self {
                dir: dir.to_path_buf(),
                wal_path,
                segments_path,
                stream_path,
                wal,
                segments,
                stream,
                wal_entries: wal_count,
            },
            entries,
        ))
    }

    /// The ledger directory, exposed for building index/metadata sidecar paths.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one record: to the WAL (fsync'd), and as a canonicalized line
    /// in the plain-text receipt stream.
    pub fn append(&mut self, record: &WalRecord, segment_size: usize) -> Result<(), LedgerError> {
        write_record(&mut self.wal, record)?;
        self.wal_entries += 1;

        let mut line = record.receipt.canonical_bytes().map_err(|e| {
            LedgerError::Storage(anyhow::anyhow!("failed to canonicalize receipt for stream: {e}"))
        })?;
        line.push(b'\n');
        self.stream.write_all(&line).map_err(|e| {
            LedgerError::Storage(anyhow::anyhow!("failed to write receipt stream: {e}"))
        })?;
        self.stream.flush().ok();

        if self.wal_entries >= segment_size {
            self.compact()?;
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<(), LedgerError> {
        let wal_bytes = fs::read(&self.wal_path).unwrap_or_default();
        if wal_bytes.is_empty() {
            return Ok(());
        }
        self.segments.write_all(&wal_bytes).map_err(|e| {
            LedgerError::Storage(anyhow::anyhow!("failed to write compacted segments: {e}"))
        })?;
        self.segments
            .sync_all()
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to sync segments: {e}")))?;
        self.wal
            .set_len(0)
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to truncate wal: {e}")))?;
        self.wal
            .seek(SeekFrom::End(0))
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to reset wal cursor: {e}")))?;
        self.wal
            .sync_all()
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to sync truncated wal: {e}")))?;
        self.wal_entries = 0;
        Ok(())
    }

    /// Path of the per-tenant metadata sidecar.
    pub fn tenant_state_path(&self, tenant: &str) -> PathBuf {
        self.dir.join(format!("state.{tenant}.json"))
    }

    /// Path of a secondary index file under `index/<kind>/<key>`.
    pub fn index_path(&self, kind: &str, key: &str) -> PathBuf {
        self.dir.join("index").join(kind).join(key)
    }

    /// Append a digest to a secondary index file, one per line, creating
    /// parent directories as needed. Index files are a derived convenience
    /// for non-Rust tooling; recovery never depends on them, only on the WAL.
    pub fn append_index_entry(&self, kind: &str, key: &str, digest: &str) -> Result<(), LedgerError> {
        let path = self.index_path(kind, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Storage(anyhow::anyhow!("failed to create index dir: {e}"))
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to open index file: {e}")))?;
        writeln!(file, "{digest}")
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("failed to append index entry: {e}")))?;
        Ok(())
    }

    /// Best-effort size on disk of the receipt stream, for diagnostics.
    pub fn stream_path(&self) -> &Path {
        &self.stream_path
    }

    /// Best-effort size of the segments file, for diagnostics.
    pub fn segments_path(&self) -> &Path {
        &self.segments_path
    }
}
