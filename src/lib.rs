//! `provenance`: an accountability substrate for governed pipelines.
//!
//! Every operation emits a cryptographically-anchored receipt; receipts
//! batch into Merkle trees whose roots are published; a decision is
//! admissible only if the receipts it cites verify against a published
//! root. This crate is a thin facade over the workspace members, each of
//! which can be depended on independently:
//!
//! - [`provenance_spec`] — composite digest, canonicalizer, receipt envelope.
//! - [`provenance_merkle`] — tree build, inclusion proof, verify.
//! - [`provenance_ledger`] — append-only store, indices, lineage, anchoring.
//! - [`provenance_packet`] — decision packet build/verify/audit.
//! - [`provenance_stoprule`] — anomaly/halt receipt construction.
//! - [`provenance_offline`] — offline queue, sync, conflict detection.

#![deny(missing_docs)]

pub use provenance_ledger::{Ledger, LedgerConfig, LedgerEntry, LedgerError, LineageChain};
pub use provenance_merkle::{
    merkle_root, merkle_root_of_receipts, prove, prove_receipt, validate_proof, verify,
    verify_receipt, InclusionProof, MerkleError, ProofStep, RawProofStep, Side,
};
pub use provenance_offline::{
    ConflictReport, ConnectivityProbe, FixedConnectivityProbe, OfflineConfig, OfflineError,
    OfflineQueue, OfflineRecord, QueueStatus, SyncResult, TcpConnectivityProbe,
};
pub use provenance_packet::{
    audit_packet_coverage, build_packet, verify_packet, Brief, ClaimAttachment, CoverageAudit,
    DecisionHealth, DialecticalRecord, PacketError, PACKET_COVERAGE_THRESHOLD,
};
pub use provenance_spec::{
    combine_digests, composite_digest, emit, empty_sentinel_digest, CompositeDigest,
    EncodingError, EnvelopeError, InvariantViolation, Receipt, ReceiptType, Tenant, TypeRegistry,
    DEFAULT_TENANT, HASH_ALGORITHMS,
};
pub use provenance_stoprule::{
    classify, default_escalation_window, raise, raise_from_envelope_error, Action, Breach,
    Classification, HaltingError, DEGRADATION_THRESHOLD, DEVIATION_THRESHOLD,
};

/// Exit codes a CLI collaborator should map engine outcomes to: `0` for a
/// clean result, `1` for a typed, non-halting error, `2` for a halting
/// error that produced a `halt` receipt. The engine itself never calls
/// `process::exit`; this mapping exists so collaborators agree on one
/// convention rather than inventing their own per binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// The operation completed without error.
    Ok = 0,
    /// A typed error was returned; no halt receipt was emitted.
    Error = 1,
    /// A halting error was returned; an anomaly and a halt receipt were emitted.
    Halted = 2,
}

impl ExitCode {
    /// Classify a [`LedgerError`] into the exit-code convention above.
    pub fn from_ledger_error(err: &LedgerError) -> Self {
        match err {
            LedgerError::Invariant(_) => ExitCode::Halted,
            _ => ExitCode::Error,
        }
    }

    /// Classify a [`HaltingError`] — always a halt, by construction.
    pub fn from_halting_error(_err: &HaltingError) -> Self {
        ExitCode::Halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingestion_api_round_trips_emit_anchor_and_verify() {
        let registry = TypeRegistry::new();
        let mut payload = serde_json::Map::new();
        payload.insert("note".into(), serde_json::json!("hello"));
        let receipt = emit(ReceiptType::Ingest, payload, None, &registry).unwrap();
        let root = merkle_root_of_receipts(std::slice::from_ref(&receipt)).unwrap();
        let proof = prove_receipt(std::slice::from_ref(&receipt), 0).unwrap();
        assert!(verify_receipt(&receipt, &proof, &root).unwrap());
    }

    #[test]
    fn exit_code_maps_invariant_violation_to_halted() {
        let err = LedgerError::Invariant(InvariantViolation::ParentNotFound {
            parent: "abc".into(),
            tenant: "default".into(),
        });
        assert_eq!(ExitCode::from_ledger_error(&err), ExitCode::Halted);
    }
}
