//! Disconnected receipt generation with deferred, verifiable reconciliation.
//!
//! An [`OfflineQueue`] is a local append-only spool: every enqueue computes
//! the Merkle root over the queue's contents *including* the just-appended
//! entry, so `local_root()` is always reproducible from the on-disk file
//! alone. On reconnect, `sync` replays the queue into a
//! [`provenance_ledger::Ledger`], checking for the conflict conditions the
//! spec enumerates before committing.

#![deny(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use provenance_ledger::persistence::{read_sidecar, write_sidecar_atomic};
use provenance_ledger::{Ledger, LedgerError};
use provenance_merkle::{merkle_root_of_receipts, MerkleError};
use provenance_spec::{
    emit, empty_sentinel_digest, CompositeDigest, EnvelopeError, Receipt, ReceiptType, Tenant,
    TypeRegistry,
};
use provenance_stoprule::{Action, Breach, Classification};

/// Default timeout for a sync attempt before it aborts and preserves the
/// local queue unchanged.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for an [`OfflineQueue`].
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Deadline for a single `sync` call.
    pub sync_timeout: Duration,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        OfflineConfig {
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

/// A reachability check the sync path probes before attempting to reconnect.
/// A single method so tests can substitute a deterministic fake for the
/// production bounded-timeout TCP implementation.
pub trait ConnectivityProbe {
    /// Whether the main ledger's endpoint is currently reachable.
    fn is_reachable(&self) -> bool;
}

/// A bounded-timeout TCP connect against a configured `host:port`. Mirrors a
/// plain reachability check rather than anything transport-specific; it does
/// not speak the ledger's protocol, only tests that the socket accepts.
pub struct TcpConnectivityProbe {
    addr: String,
    timeout: Duration,
}

impl TcpConnectivityProbe {
    /// A probe against `addr` (`host:port`), bounded by `timeout`.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        TcpConnectivityProbe {
            addr: addr.into(),
            timeout,
        }
    }
}

impl ConnectivityProbe for TcpConnectivityProbe {
    fn is_reachable(&self) -> bool {
        let Ok(mut addrs) = self.addr.to_socket_addrs() else {
            return false;
        };
        addrs
            .next()
            .map(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
            .unwrap_or(false)
    }
}

/// An always-reachable or always-unreachable fake, for tests.
pub struct FixedConnectivityProbe(pub bool);

impl ConnectivityProbe for FixedConnectivityProbe {
    fn is_reachable(&self) -> bool {
        self.0
    }
}

/// A receipt plus the offline metadata attached to it: the local sequence
/// number, the queue's Merkle root at the moment of enqueue (inclusive of
/// this entry), and — once synced — the sync timestamp and batch id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRecord {
    /// The receipt as emitted.
    pub receipt: Receipt,
    /// Monotonic per-queue sequence number.
    pub local_sequence: u64,
    /// Merkle root over the queue's contents through this entry, inclusive.
    pub local_root: CompositeDigest,
    /// Timestamp this entry was synced, if it has been.
    pub sync_timestamp: Option<String>,
    /// Id of the batch this entry was synced under, if any.
    pub sync_batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OfflineState {
    local_sequence_id: u64,
    last_sync_time: Option<String>,
    last_sync_batch_id: Option<String>,
    local_merkle_root: Option<String>,
}

impl Default for OfflineState {
    fn default() -> Self {
        OfflineState {
            local_sequence_id: 0,
            last_sync_time: None,
            last_sync_batch_id: None,
            local_merkle_root: None,
        }
    }
}

/// A snapshot of queue state for a status check.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    /// Entries not yet synced.
    pub pending: usize,
    /// When the queue last synced successfully, if ever.
    pub last_sync_time: Option<String>,
    /// Current local Merkle root.
    pub local_root: CompositeDigest,
    /// Current local sequence counter.
    pub local_sequence: u64,
}

/// Conflicts detected scanning the queue before a sync attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictReport {
    /// Sequence numbers skipped by the local counter. Informational.
    pub sequence_gaps: Vec<u64>,
    /// `(earlier_sequence, later_sequence)` pairs where the later entry's
    /// timestamp precedes the earlier one's. Informational.
    pub timestamp_inversions: Vec<(u64, u64)>,
    /// Entries already present in the main ledger, skipped during sync.
    pub duplicates: Vec<CompositeDigest>,
    /// Whether the recomputed root over current queue contents disagrees
    /// with the root recorded on the last entry. Blocks sync outright.
    pub merkle_mismatch: bool,
}

/// The result of a successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    /// Entries newly ingested into the main ledger.
    pub synced: usize,
    /// Entries skipped because the ledger already had them.
    pub duplicates_skipped: usize,
    /// Id of the synced batch (its Merkle root, as a string).
    pub batch_id: String,
    /// Root of the synced batch.
    pub root: CompositeDigest,
    /// Conflicts observed, informational ones included.
    pub conflicts: ConflictReport,
}

/// Everything that can go wrong enqueueing into, or syncing, an offline queue.
#[derive(Debug, Error)]
pub enum OfflineError {
    /// The receipt envelope rejected the stamp request.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// The Merkle engine could not build a root over the queue's contents.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    /// Ingesting a synced entry into the main ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Persistence (file I/O, (de)serialization) failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    /// The connectivity probe reported the main ledger unreachable.
    #[error("main ledger endpoint is not reachable")]
    Unreachable,
    /// The sync attempt ran past its configured deadline; the local queue is unchanged.
    #[error("sync timed out after {0:?}")]
    Timeout(Duration),
    /// The recomputed queue root disagreed with the recorded one; requires operator action.
    #[error("offline queue Merkle root mismatch; operator intervention required")]
    MerkleMismatch {
        /// The anomaly receipt recording the mismatch.
        anomaly: Receipt,
        /// The halt receipt that followed it.
        halt: Receipt,
    },
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A local, append-only receipt spool with its own Merkle root, synced into
/// a [`Ledger`] on reconnect.
pub struct OfflineQueue {
    dir: PathBuf,
    queue_path: PathBuf,
    state_path: PathBuf,
    file: Mutex<File>,
    records: RwLock<Vec<OfflineRecord>>,
    registry: RwLock<TypeRegistry>,
    probe: Box<dyn ConnectivityProbe + Send + Sync>,
    config: OfflineConfig,
}

impl OfflineQueue {
    /// Open (or create) an offline queue rooted at `dir`, recovering any
    /// entries from a prior session.
    pub fn open(
        dir: impl AsRef<Path>,
        probe: Box<dyn ConnectivityProbe + Send + Sync>,
        config: OfflineConfig,
    ) -> Result<Self, OfflineError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to create offline dir: {e}")))?;
        let queue_path = dir.join("offline_queue.jsonl");
        let state_path = dir.join("offline_state.json");

        let mut records = Vec::new();
        if queue_path.exists() {
            let file = File::open(&queue_path)
                .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to open offline queue: {e}")))?;
            for line in BufReader::new(file).lines() {
                let line = line
                    .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to read offline queue: {e}")))?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: OfflineRecord = serde_json::from_str(&line).map_err(|e| {
                    OfflineError::Storage(anyhow::anyhow!("failed to decode offline record: {e}"))
                })?;
                records.push(record);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&queue_path)
            .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to open offline queue: {e}")))?;

        info!(entries = records.len(), "offline queue recovered from disk");
        Ok(OfflineQueue {
            dir: dir.to_path_buf(),
            queue_path,
            state_path,
            file: Mutex::new(file),
            records: RwLock::new(records),
            registry: RwLock::new(TypeRegistry::new()),
            probe,
            config,
        })
    }

    /// Register a collaborator-defined receipt type tag.
    pub fn register_extension_type(&self, tag: impl Into<String>) {
        self.registry.write().register(tag);
    }

    fn state(&self) -> OfflineState {
        read_sidecar(&self.state_path).unwrap_or_default()
    }

    fn persist_state(&self, state: &OfflineState) -> Result<(), OfflineError> {
        write_sidecar_atomic(&self.state_path, state)
            .map_err(|e| OfflineError::Storage(anyhow::anyhow!(e)))
    }

    /// Stamp `payload` into a receipt of `receipt_type` and append it to the
    /// queue, attaching offline metadata. The returned receipt does not
    /// itself carry the offline metadata; call [`OfflineQueue::local_root`]
    /// or [`OfflineQueue::status`] for that.
    #[instrument(skip(self, payload), fields(receipt_type = receipt_type.as_str()))]
    pub fn enqueue(
        &self,
        receipt_type: ReceiptType,
        payload: Map<String, Value>,
        tenant: Option<Tenant>,
    ) -> Result<Receipt, OfflineError> {
        let receipt = emit(receipt_type, payload, tenant, &self.registry.read())?;

        let mut records = self.records.write();
        let mut state = self.state();
        let local_sequence = state.local_sequence_id;
        state.local_sequence_id += 1;

        let mut all_receipts: Vec<Receipt> = records.iter().map(|r| r.receipt.clone()).collect();
        all_receipts.push(receipt.clone());
        let local_root = merkle_root_of_receipts(&all_receipts)?;

        let record = OfflineRecord {
            receipt: receipt.clone(),
            local_sequence,
            local_root: local_root.clone(),
            sync_timestamp: None,
            sync_batch_id: None,
        };

        let line = serde_json::to_string(&record)
            .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to serialize offline record: {e}")))?;
        {
            let mut file = self.file.lock();
            writeln!(file, "{line}")
                .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to append offline queue: {e}")))?;
            file.sync_all()
                .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to fsync offline queue: {e}")))?;
        }

        state.local_merkle_root = Some(local_root.as_str().to_string());
        self.persist_state(&state)?;
        records.push(record);

        Ok(receipt)
    }

    /// Number of entries currently queued (synced or not).
    pub fn size(&self) -> usize {
        self.records.read().len()
    }

    /// The oldest `n` queued entries, oldest first.
    pub fn peek(&self, n: usize) -> Vec<OfflineRecord> {
        self.records.read().iter().take(n).cloned().collect()
    }

    /// The current local Merkle root: the root recorded on the most recent
    /// entry, or the empty sentinel if the queue is empty.
    pub fn local_root(&self) -> CompositeDigest {
        self.records
            .read()
            .last()
            .map(|r| r.local_root.clone())
            .unwrap_or_else(empty_sentinel_digest)
    }

    /// A snapshot of pending count, last sync time, local root, and sequence.
    pub fn status(&self) -> QueueStatus {
        let state = self.state();
        QueueStatus {
            pending: self.records.read().iter().filter(|r| r.sync_batch_id.is_none()).count(),
            last_sync_time: state.last_sync_time,
            local_root: self.local_root(),
            local_sequence: state.local_sequence_id,
        }
    }

    /// Scan the queue for sequence gaps, timestamp/sequence inversions,
    /// entries already present in `ledger` (duplicates), and a recomputed
    /// root that disagrees with the one recorded on the last entry.
    pub fn scan_conflicts(&self, ledger: &Ledger) -> Result<ConflictReport, OfflineError> {
        let records = self.records.read();
        let mut sequence_gaps = Vec::new();
        let mut timestamp_inversions = Vec::new();
        for pair in records.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.local_sequence != a.local_sequence + 1 {
                sequence_gaps.push(a.local_sequence + 1);
            }
            if b.receipt.ts < a.receipt.ts {
                timestamp_inversions.push((a.local_sequence, b.local_sequence));
            }
        }
        let duplicates: Vec<CompositeDigest> = records
            .iter()
            .filter(|r| ledger.get_by_digest(&r.receipt.payload_hash).is_some())
            .map(|r| r.receipt.payload_hash.clone())
            .collect();

        let all_receipts: Vec<Receipt> = records.iter().map(|r| r.receipt.clone()).collect();
        let recomputed = merkle_root_of_receipts(&all_receipts)?;
        let recorded = self.local_root();
        let merkle_mismatch = !records.is_empty() && recomputed != recorded;

        Ok(ConflictReport {
            sequence_gaps,
            timestamp_inversions,
            duplicates,
            merkle_mismatch,
        })
    }

    /// Attempt to sync the queue into `ledger`: probe reachability, scan for
    /// conflicts, ingest every non-duplicate entry, verify the main ledger's
    /// record of the batch against the pre-sync root, and — only if that
    /// verification succeeds — clear the queue.
    ///
    /// A Merkle mismatch, whether detected before sync (the queue's own
    /// recomputed root disagreeing with its recorded root) or after (the
    /// ledger's record of the synced batch disagreeing with it), blocks
    /// sync entirely and raises an anomaly plus halt through the StopRule
    /// controller, both ingested into `ledger`. In the post-sync case the
    /// already-ingested receipts stay on the ledger (append-only), but the
    /// local queue is left unchanged, requiring operator intervention
    /// before the queue can be retried.
    #[instrument(skip(self, ledger))]
    pub fn sync(&self, ledger: &Ledger) -> Result<SyncResult, OfflineError> {
        let deadline = Instant::now() + self.config.sync_timeout;

        if !self.probe.is_reachable() {
            return Err(OfflineError::Unreachable);
        }

        let conflicts = self.scan_conflicts(ledger)?;
        if conflicts.merkle_mismatch {
            let breach = Breach::new("offline_queue_merkle_consistency", 0.0, 1.0)
                .with_verdict(Classification::Violation, Action::Halt)
                .with_halt_reason(
                    "offline queue's recomputed Merkle root disagrees with its recorded root",
                );
            let halting = provenance_stoprule::raise(breach).expect_err("violation always halts");
            let _ = ledger.ingest(halting.anomaly.clone(), None);
            let _ = ledger.ingest(halting.halt.clone(), None);
            warn!("offline sync blocked on merkle mismatch");
            return Err(OfflineError::MerkleMismatch {
                anomaly: halting.anomaly,
                halt: halting.halt,
            });
        }

        let mut records = self.records.write();
        let pending_indices: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.sync_batch_id.is_none())
            .map(|(i, _)| i)
            .collect();
        let pending: Vec<Receipt> = pending_indices.iter().map(|&i| records[i].receipt.clone()).collect();
        let batch_root = merkle_root_of_receipts(&pending)?;
        let batch_id = batch_root.as_str().to_string();

        let mut synced = 0usize;
        let mut duplicates_skipped = 0usize;
        for &i in &pending_indices {
            if Instant::now() > deadline {
                return Err(OfflineError::Timeout(self.config.sync_timeout));
            }
            let digest = records[i].receipt.payload_hash.clone();
            if ledger.get_by_digest(&digest).is_some() {
                duplicates_skipped += 1;
                continue;
            }
            ledger.ingest(records[i].receipt.clone(), None)?;
            synced += 1;
        }

        let sync_payload: Map<String, Value> = [
            ("batch_id".to_string(), json!(batch_id)),
            ("synced".to_string(), json!(synced)),
            ("duplicates_skipped".to_string(), json!(duplicates_skipped)),
            ("root".to_string(), json!(batch_root.as_str())),
        ]
        .into_iter()
        .collect();
        ledger.emit_and_ingest(ReceiptType::OfflineSync, sync_payload, None, None)?;

        let conflict_payload: Map<String, Value> = [
            ("sequence_gaps".to_string(), json!(conflicts.sequence_gaps)),
            (
                "timestamp_inversions".to_string(),
                json!(conflicts.timestamp_inversions),
            ),
            (
                "duplicates".to_string(),
                json!(conflicts
                    .duplicates
                    .iter()
                    .map(|d| d.as_str().to_string())
                    .collect::<Vec<_>>()),
            ),
        ]
        .into_iter()
        .collect();
        ledger.emit_and_ingest(ReceiptType::Consistency, conflict_payload, None, None)?;

        // Spec §4.7 step 4: verify the main ledger's record of the batch
        // against the root computed before sync. The ledger is the source
        // of truth here — re-fetch each receipt by digest rather than trust
        // that ingestion succeeded silently.
        let ledger_view: Vec<Receipt> = pending_indices
            .iter()
            .filter_map(|&i| ledger.get_by_digest(&records[i].receipt.payload_hash).map(|e| e.receipt))
            .collect();
        let recomputed = merkle_root_of_receipts(&ledger_view)?;
        if ledger_view.len() != pending_indices.len() || recomputed != batch_root {
            let breach = Breach::new("offline_sync_batch_root_consistency", 0.0, 1.0)
                .with_verdict(Classification::Violation, Action::Halt)
                .with_halt_reason(
                    "main ledger's record of the synced batch does not match the pre-sync local root",
                );
            let halting = provenance_stoprule::raise(breach).expect_err("violation always halts");
            let _ = ledger.ingest(halting.anomaly.clone(), None);
            let _ = ledger.ingest(halting.halt.clone(), None);
            warn!("offline sync verification failed; local queue preserved for operator review");
            return Err(OfflineError::MerkleMismatch {
                anomaly: halting.anomaly,
                halt: halting.halt,
            });
        }

        // Spec §4.7 step 5: only now, with verification passed, mark the
        // synced entries and clear the queue.
        let sync_ts = now_iso8601();
        for &i in &pending_indices {
            records[i].sync_batch_id = Some(batch_id.clone());
            records[i].sync_timestamp = Some(sync_ts.clone());
        }
        records.clear();
        {
            let mut file = self.file.lock();
            *file = File::create(&self.queue_path)
                .map_err(|e| OfflineError::Storage(anyhow::anyhow!("failed to clear offline queue: {e}")))?;
        }
        let mut state = self.state();
        state.last_sync_time = Some(sync_ts);
        state.last_sync_batch_id = Some(batch_id.clone());
        self.persist_state(&state)?;

        info!(synced, duplicates_skipped, batch_id = %batch_id, "offline queue synced");
        Ok(SyncResult {
            synced,
            duplicates_skipped,
            batch_id,
            root: batch_root,
            conflicts,
        })
    }

    /// Directory this queue is rooted at.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(note: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("note".into(), json!(note));
        m
    }

    #[test]
    fn local_root_is_post_append_inclusive() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::open(
            dir.path(),
            Box::new(FixedConnectivityProbe(false)),
            OfflineConfig::default(),
        )
        .unwrap();
        queue.enqueue(ReceiptType::Ingest, payload("one"), None).unwrap();
        let after_one = queue.local_root();
        queue.enqueue(ReceiptType::Ingest, payload("two"), None).unwrap();
        let after_two = queue.local_root();
        assert_ne!(after_one, after_two);

        let receipts: Vec<Receipt> = queue.peek(2).into_iter().map(|r| r.receipt).collect();
        let recomputed = merkle_root_of_receipts(&receipts).unwrap();
        assert_eq!(recomputed, after_two);
    }

    #[test]
    fn sync_fails_when_probe_reports_unreachable() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::open(
            dir.path(),
            Box::new(FixedConnectivityProbe(false)),
            OfflineConfig::default(),
        )
        .unwrap();
        queue.enqueue(ReceiptType::Ingest, payload("one"), None).unwrap();
        let ledger = Ledger::in_memory(provenance_ledger::LedgerConfig::default());
        let err = queue.sync(&ledger).unwrap_err();
        assert!(matches!(err, OfflineError::Unreachable));
    }

    #[test]
    fn sync_ingests_every_entry_and_clears_the_queue() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::open(
            dir.path(),
            Box::new(FixedConnectivityProbe(true)),
            OfflineConfig::default(),
        )
        .unwrap();
        queue.enqueue(ReceiptType::Ingest, payload("one"), None).unwrap();
        queue.enqueue(ReceiptType::Ingest, payload("two"), None).unwrap();
        let ledger = Ledger::in_memory(provenance_ledger::LedgerConfig::default());
        let result = queue.sync(&ledger).unwrap();
        assert_eq!(result.synced, 2);
        assert_eq!(result.duplicates_skipped, 0);
        assert_eq!(queue.size(), 0);
        assert_eq!(ledger.query_by_type(&ReceiptType::Ingest).len(), 2);
        assert_eq!(ledger.query_by_type(&ReceiptType::OfflineSync).len(), 1);
    }

    #[test]
    fn recovered_queue_preserves_local_sequence_and_root() {
        let dir = tempdir().unwrap();
        let root_before = {
            let queue = OfflineQueue::open(
                dir.path(),
                Box::new(FixedConnectivityProbe(false)),
                OfflineConfig::default(),
            )
            .unwrap();
            queue.enqueue(ReceiptType::Ingest, payload("one"), None).unwrap();
            queue.local_root()
        };
        let queue = OfflineQueue::open(
            dir.path(),
            Box::new(FixedConnectivityProbe(false)),
            OfflineConfig::default(),
        )
        .unwrap();
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.local_root(), root_before);
        assert_eq!(queue.status().local_sequence, 1);
    }

    #[test]
    fn duplicate_already_in_ledger_is_skipped_not_re_ingested() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::open(
            dir.path(),
            Box::new(FixedConnectivityProbe(true)),
            OfflineConfig::default(),
        )
        .unwrap();
        let receipt = queue.enqueue(ReceiptType::Ingest, payload("dup"), None).unwrap();
        let ledger = Ledger::in_memory(provenance_ledger::LedgerConfig::default());
        ledger.ingest(receipt, None).unwrap();
        let result = queue.sync(&ledger).unwrap();
        assert_eq!(result.synced, 0);
        assert_eq!(result.duplicates_skipped, 1);
    }
}
