//! Append-only, tenant-scoped receipt ledger.
//!
//! A [`Ledger`] is a single-writer resource: concurrent `ingest` calls are
//! serialized on a write lock, while queries may proceed in parallel with
//! each other and with a writer, observing snapshot semantics. The ledger
//! owns its own [`LedgerConfig`], [`provenance_spec::TypeRegistry`], and
//! (optionally) a durable [`persistence::LedgerStore`]; there is no
//! module-level mutable state anywhere in this crate.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod persistence;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

pub use config::LedgerConfig;
pub use error::LedgerError;

use provenance_merkle::{leaf_digests, merkle_root};
use provenance_spec::{
    emit, CompositeDigest, EnvelopeError, InvariantViolation, Receipt, ReceiptType, Tenant,
    TypeRegistry, DEFAULT_TENANT, HASH_ALGORITHMS,
};
use provenance_stoprule::{Action, Classification};

use persistence::{read_sidecar, write_sidecar_atomic, LedgerStore, TenantState, WalRecord};

/// A receipt plus the ingestion metadata the ledger assigned to it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LedgerEntry {
    /// The receipt as emitted.
    pub receipt: Receipt,
    /// Strictly increasing, gap-free per-tenant sequence number (I2).
    pub sequence: u64,
    /// The `payload_hash` of the immediate antecedent in a causal chain, if any.
    pub parent_hash: Option<CompositeDigest>,
}

/// The result of a `lineage` walk: the ancestor chain (closest parent
/// first) and the child -> parent edges traversed to reach it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineageChain {
    /// Ancestor entries, ordered from the immediate parent outward.
    pub ancestors: Vec<LedgerEntry>,
    /// `(child, parent)` digest pairs traversed, in walk order.
    pub edges: Vec<(CompositeDigest, CompositeDigest)>,
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    timestamps: Vec<DateTime<Utc>>,
    by_digest: HashMap<String, usize>,
    by_type: HashMap<String, Vec<usize>>,
    by_hour: HashMap<String, Vec<usize>>,
    by_tenant: HashMap<String, Vec<usize>>,
    parent_to_children: HashMap<String, Vec<String>>,
    tenant_sequences: HashMap<String, u64>,
}

/// An append-only, tenant-scoped store of receipts with secondary indices,
/// lineage walks, and Merkle anchoring.
pub struct Ledger {
    config: LedgerConfig,
    registry: RwLock<TypeRegistry>,
    state: RwLock<LedgerState>,
    store: Option<Mutex<LedgerStore>>,
}

fn hour_bucket(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d-%H").to_string()
}

fn parse_ts(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Ledger {
    /// An in-memory ledger with no durable backing, useful for tests and
    /// short-lived collaborators that anchor into an external store.
    pub fn in_memory(config: LedgerConfig) -> Self {
        Ledger {
            config,
            registry: RwLock::new(TypeRegistry::new()),
            state: RwLock::new(LedgerState::default()),
            store: None,
        }
    }

    /// Open (or create) a durable ledger rooted at `dir`, replaying its WAL
    /// and segment file to recover prior entries and rebuild all indices.
    #[instrument(skip(config), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, config: LedgerConfig) -> Result<Self, LedgerError> {
        let (store, records) = LedgerStore::open(dir)?;
        let mut state = LedgerState::default();
        for record in records {
            index_record(&mut state, &record);
        }
        info!(entries = state.entries.len(), "ledger recovered from disk");
        Ok(Ledger {
            config,
            registry: RwLock::new(TypeRegistry::new()),
            state: RwLock::new(state),
            store: Some(Mutex::new(store)),
        })
    }

    /// Register a collaborator-defined receipt type tag so `emit_and_ingest`
    /// and `ingest` will accept it.
    pub fn register_extension_type(&self, tag: impl Into<String>) {
        self.registry.write().register(tag);
    }

    /// Stamp a `(type, payload, tenant)` into a receipt and ingest it in one step.
    pub fn emit_and_ingest(
        &self,
        receipt_type: ReceiptType,
        payload: Map<String, Value>,
        tenant: Option<Tenant>,
        parent_hash: Option<CompositeDigest>,
    ) -> Result<LedgerEntry, LedgerError> {
        let receipt = emit(receipt_type, payload, tenant, &self.registry.read())?;
        self.ingest(receipt, parent_hash)
    }

    /// Validate and append a receipt, assigning it the next per-tenant
    /// sequence number and updating every secondary index.
    ///
    /// Every invariant violation (I1-I3) is reported both as the typed
    /// [`LedgerError::Invariant`] this returns *and* as an `anomaly`
    /// (plus `halt`) receipt recorded on the ledger itself — the caller
    /// never silently loses the trail.
    #[instrument(skip(self, receipt), fields(tenant = %receipt.tenant_id, receipt_type = receipt.receipt_type.as_str()))]
    pub fn ingest(
        &self,
        receipt: Receipt,
        parent_hash: Option<CompositeDigest>,
    ) -> Result<LedgerEntry, LedgerError> {
        if !self.registry.read().is_registered(&receipt.receipt_type) {
            return Err(LedgerError::Envelope(EnvelopeError::UnknownReceiptType(
                receipt.receipt_type.as_str().to_string(),
            )));
        }

        let recomputed = receipt.recompute_payload_hash()?;
        if recomputed != receipt.payload_hash {
            let violation = InvariantViolation::PayloadHashMismatch {
                stamped: receipt.payload_hash.as_str().to_string(),
                recomputed: recomputed.as_str().to_string(),
            };
            return Err(self.fail_invariant(violation, &receipt.tenant_id));
        }

        // The whole mutation — sequence assignment, durable append, and
        // in-memory indexing — runs under a single write-lock acquisition so
        // concurrent ingests cannot interleave and desynchronize sequence
        // order from entry order. Readers never block on each other, only on
        // whichever single writer currently holds this lock.
        let mut state = self.state.write();

        if let Some(parent) = &parent_hash {
            if !state.by_digest.contains_key(parent.as_str()) {
                drop(state);
                let violation = InvariantViolation::ParentNotFound {
                    parent: parent.as_str().to_string(),
                    tenant: receipt.tenant_id.clone(),
                };
                return Err(self.fail_invariant(violation, &receipt.tenant_id));
            }
        }

        let next = state
            .tenant_sequences
            .entry(receipt.tenant_id.clone())
            .or_insert(0);
        let sequence = *next;
        *next += 1;

        let record = WalRecord {
            receipt: receipt.clone(),
            sequence,
            parent_hash: parent_hash.clone(),
        };

        if let Some(store) = &self.store {
            let mut store = store.lock();
            store.append(&record, self.config.segment_size)?;
            store.append_index_entry(
                "type",
                receipt.receipt_type.as_str(),
                receipt.payload_hash.as_str(),
            )?;
            let hour = hour_bucket(&parse_ts(&receipt.ts));
            store.append_index_entry("time", &hour, receipt.payload_hash.as_str())?;
            if let Some(parent) = &parent_hash {
                store.append_index_entry("parent", parent.as_str(), receipt.payload_hash.as_str())?;
            }
            self.persist_tenant_sidecar(&store, &receipt, sequence)?;
        }

        index_record(&mut state, &record);
        drop(state);
        debug!(sequence, "receipt ingested");
        Ok(LedgerEntry {
            receipt,
            sequence,
            parent_hash,
        })
    }

    fn persist_tenant_sidecar(
        &self,
        store: &LedgerStore,
        receipt: &Receipt,
        sequence: u64,
    ) -> Result<(), LedgerError> {
        let path = store.tenant_state_path(&receipt.tenant_id);
        let mut sidecar: TenantState = read_sidecar(&path).unwrap_or(TenantState {
            last_sequence: 0,
            last_anchor_root: None,
        });
        sidecar.last_sequence = sequence;
        if receipt.receipt_type == ReceiptType::Anchor {
            if let Some(root) = receipt.payload.get("root").and_then(|v| v.as_str()) {
                sidecar.last_anchor_root = Some(root.to_string());
            }
        }
        write_sidecar_atomic(&path, &sidecar)
    }

    fn invariant_breach_metrics(violation: &InvariantViolation) -> (&'static str, f64, f64) {
        match violation {
            InvariantViolation::PayloadHashMismatch { .. } => ("payload_hash_consistency", 0.0, 1.0),
            InvariantViolation::SequenceNotMonotone { expected, got, .. } => {
                ("sequence_monotonicity", *expected as f64, *got as f64)
            }
            InvariantViolation::ParentNotFound { .. } => ("parent_link_soundness", 1.0, 0.0),
            InvariantViolation::RootMismatch { .. } => ("merkle_root_reproducibility", 0.0, 1.0),
            InvariantViolation::CoverageBelowThreshold {
                match_rate,
                threshold,
            } => ("claim_coverage", *threshold, *match_rate),
        }
    }

    fn fail_invariant(&self, violation: InvariantViolation, tenant: &str) -> LedgerError {
        let (metric, baseline, observed) = Self::invariant_breach_metrics(&violation);
        let breach = provenance_stoprule::Breach::new(metric, baseline, observed)
            .with_tenant(tenant.to_string())
            .with_verdict(Classification::Violation, Action::Halt)
            .with_halt_reason(violation.to_string());
        let halting = provenance_stoprule::raise(breach).expect_err("violation always halts");
        let _ = self.ingest(halting.anomaly.clone(), None);
        let _ = self.ingest(halting.halt.clone(), None);
        error!(%violation, "invariant violation recorded on the ledger");
        LedgerError::Invariant(violation)
    }

    fn record_cap_deviation(&self, metric: &str, baseline: f64, observed: f64, tenant: &str) {
        let payload: Map<String, Value> = [
            ("metric".to_string(), json!(metric)),
            ("baseline".to_string(), json!(baseline)),
            ("delta".to_string(), json!(observed - baseline)),
            ("classification".to_string(), json!(Classification::Deviation)),
            ("action".to_string(), json!(Action::Alert)),
        ]
        .into_iter()
        .collect();
        warn!(metric, baseline, observed, "soft cap exceeded");
        let _ = self.emit_and_ingest(ReceiptType::Anomaly, payload, Some(tenant.to_string()), None);
    }

    /// Compute the Merkle root over `receipts` and emit an `anchor` receipt
    /// recording the root, batch size, leaf digests, and the hash algorithm
    /// names used, then ingest that receipt into the ledger.
    #[instrument(skip(self, receipts), fields(batch_size = receipts.len()))]
    pub fn anchor_batch(
        &self,
        receipts: &[Receipt],
        tenant: Option<Tenant>,
    ) -> Result<Receipt, LedgerError> {
        if receipts.len() > self.config.merkle_batch_cap {
            let tenant_str = tenant.unwrap_or_else(|| DEFAULT_TENANT.to_string());
            self.record_cap_deviation(
                "merkle_batch_size",
                self.config.merkle_batch_cap as f64,
                receipts.len() as f64,
                &tenant_str,
            );
            return Err(LedgerError::BatchCapExceeded {
                len: receipts.len(),
                cap: self.config.merkle_batch_cap,
            });
        }
        let leaves = leaf_digests(receipts)?;
        let root = merkle_root(&leaves);
        let payload: Map<String, Value> = [
            ("root".to_string(), json!(root.as_str())),
            ("batch_size".to_string(), json!(receipts.len())),
            (
                "leaf_digests".to_string(),
                json!(leaves.iter().map(|d| d.as_str().to_string()).collect::<Vec<_>>()),
            ),
            ("hash_algorithms".to_string(), json!(HASH_ALGORITHMS)),
        ]
        .into_iter()
        .collect();
        let entry = self.emit_and_ingest(ReceiptType::Anchor, payload, tenant, None)?;
        info!(root = %root, batch_size = receipts.len(), "batch anchored");
        Ok(entry.receipt)
    }

    /// O(1) lookup of a ledger entry by its `payload_hash`.
    pub fn get_by_digest(&self, digest: &CompositeDigest) -> Option<LedgerEntry> {
        let state = self.state.read();
        state
            .by_digest
            .get(digest.as_str())
            .map(|&i| state.entries[i].clone())
    }

    /// All entries of a given receipt type, in insertion order.
    pub fn query_by_type(&self, receipt_type: &ReceiptType) -> Vec<LedgerEntry> {
        let state = self.state.read();
        state
            .by_type
            .get(receipt_type.as_str())
            .map(|idxs| idxs.iter().map(|&i| state.entries[i].clone()).collect())
            .unwrap_or_default()
    }

    /// All entries for a tenant, in insertion order.
    pub fn query_by_tenant(&self, tenant: &str) -> Vec<LedgerEntry> {
        let state = self.state.read();
        state
            .by_tenant
            .get(tenant)
            .map(|idxs| idxs.iter().map(|&i| state.entries[i].clone()).collect())
            .unwrap_or_default()
    }

    /// All entries with timestamp in `[start, end]`, in insertion order.
    /// Candidates are narrowed through the hour-bucket index before the
    /// exact bound check, so a range spanning few hours stays cheap even
    /// in a ledger with many entries.
    pub fn query_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<LedgerEntry> {
        let state = self.state.read();
        let mut candidate_idxs: Vec<usize> = Vec::new();
        let mut seen_hours = HashSet::new();
        let mut cursor = start;
        while cursor <= end {
            let bucket = hour_bucket(&cursor);
            if seen_hours.insert(bucket.clone()) {
                if let Some(idxs) = state.by_hour.get(&bucket) {
                    candidate_idxs.extend(idxs.iter().copied());
                }
            }
            cursor += chrono::Duration::hours(1);
        }
        let end_bucket = hour_bucket(&end);
        if seen_hours.insert(end_bucket.clone()) {
            if let Some(idxs) = state.by_hour.get(&end_bucket) {
                candidate_idxs.extend(idxs.iter().copied());
            }
        }
        candidate_idxs.sort_unstable();
        candidate_idxs.dedup();
        candidate_idxs
            .into_iter()
            .filter(|&i| {
                let ts = state.timestamps[i];
                ts >= start && ts <= end
            })
            .map(|i| state.entries[i].clone())
            .collect()
    }

    /// Walk `parent_hash` pointers from `digest` up to `depth` levels,
    /// returning the ancestor chain and the edges traversed.
    ///
    /// Fails with `DepthCapExceeded` if `depth` exceeds the ledger's
    /// configured cap (raising a `deviation` anomaly first), or
    /// `CycleDetected` if a parent reference closes a cycle — which I3
    /// plus monotone sequencing should make impossible, but which this walk
    /// still guards against defensively.
    #[instrument(skip(self), fields(depth))]
    pub fn lineage(&self, digest: &CompositeDigest, depth: usize) -> Result<LineageChain, LedgerError> {
        if depth > self.config.lineage_depth_cap {
            self.record_cap_deviation(
                "lineage_depth",
                self.config.lineage_depth_cap as f64,
                depth as f64,
                DEFAULT_TENANT,
            );
            return Err(LedgerError::DepthCapExceeded {
                requested: depth,
                cap: self.config.lineage_depth_cap,
            });
        }
        let state = self.state.read();
        let mut chain = LineageChain::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = digest.as_str().to_string();
        visited.insert(current.clone());
        for _ in 0..depth {
            let idx = match state.by_digest.get(&current) {
                Some(&i) => i,
                None => break,
            };
            let parent = match &state.entries[idx].parent_hash {
                Some(p) => p.clone(),
                None => break,
            };
            let parent_str = parent.as_str().to_string();
            if !visited.insert(parent_str.clone()) {
                return Err(LedgerError::CycleDetected(parent_str));
            }
            chain
                .edges
                .push((CompositeDigest::from_raw(current.clone()), parent.clone()));
            let parent_idx = match state.by_digest.get(&parent_str) {
                Some(&i) => i,
                None => break,
            };
            chain.ancestors.push(state.entries[parent_idx].clone());
            current = parent_str;
        }
        Ok(chain)
    }

    /// Receipt digests that chain from `parent` as their immediate antecedent.
    pub fn children_of(&self, parent: &CompositeDigest) -> Vec<CompositeDigest> {
        let state = self.state.read();
        state
            .parent_to_children
            .get(parent.as_str())
            .map(|children| children.iter().map(|c| CompositeDigest::from_raw(c.clone())).collect())
            .unwrap_or_default()
    }

    /// Total number of entries ingested across all tenants.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Whether the ledger has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next sequence number that would be assigned to `tenant`.
    pub fn next_sequence(&self, tenant: &str) -> u64 {
        self.state
            .read()
            .tenant_sequences
            .get(tenant)
            .copied()
            .unwrap_or(0)
    }
}

fn index_record(state: &mut LedgerState, record: &WalRecord) {
    let idx = state.entries.len();
    let receipt = &record.receipt;
    state
        .by_digest
        .insert(receipt.payload_hash.as_str().to_string(), idx);
    state
        .by_type
        .entry(receipt.receipt_type.as_str().to_string())
        .or_default()
        .push(idx);
    state
        .by_tenant
        .entry(receipt.tenant_id.clone())
        .or_default()
        .push(idx);
    let timestamp = parse_ts(&receipt.ts);
    state
        .by_hour
        .entry(hour_bucket(&timestamp))
        .or_default()
        .push(idx);
    if let Some(parent) = &record.parent_hash {
        state
            .parent_to_children
            .entry(parent.as_str().to_string())
            .or_default()
            .push(receipt.payload_hash.as_str().to_string());
    }
    state
        .tenant_sequences
        .insert(receipt.tenant_id.clone(), record.sequence + 1);
    state.timestamps.push(timestamp);
    state.entries.push(LedgerEntry {
        receipt: receipt.clone(),
        sequence: record.sequence,
        parent_hash: record.parent_hash.clone(),
    });
}
