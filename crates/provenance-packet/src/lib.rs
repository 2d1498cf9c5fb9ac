//! Decision packet builder: binds an executive claim to the receipts that
//! support it, gated on claim-coverage, anchored with the Merkle engine.
//!
//! This crate has no ledger handle of its own. `build_packet` is pure with
//! respect to persistence: on a coverage failure it returns the `anomaly`
//! and `halt` receipts the StopRule controller raised so the caller (almost
//! always a [`provenance_ledger::Ledger`](../provenance_ledger/struct.Ledger.html))
//! can ingest them — the coverage gate is still enforced, the trail is still
//! recorded, but this crate never writes to disk itself.

#![deny(missing_docs)]

use std::collections::HashSet;

use serde_json::{json, Map, Value};
use thiserror::Error;

use provenance_merkle::{merkle_root_of_receipts, MerkleError};
use provenance_spec::{
    composite_digest, emit, CompositeDigest, EnvelopeError, InvariantViolation, Receipt,
    ReceiptType, Tenant, TypeRegistry, DEFAULT_TENANT,
};
use provenance_stoprule::{Action, Breach, Classification};

/// Minimum fraction of claims that must have at least one attached receipt
/// for `build_packet` to succeed.
pub const PACKET_COVERAGE_THRESHOLD: f64 = 0.999;

/// A collaborator-supplied, three-scalar decision-health vector. Each field
/// is expected in `[0, 1]`; the builder does not validate or interpret the
/// values, only carries them through to the packet payload.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DecisionHealth {
    /// How well-supported the claim is by the attached evidence.
    pub strength: f64,
    /// Fraction of the claim's sub-assertions that carry a supporting receipt.
    pub coverage: f64,
    /// How directly the attached receipts bear on the claim (vs. tangential).
    pub efficiency: f64,
}

/// An optional pro/con/gap breakdown accompanying a brief's claims.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DialecticalRecord {
    /// Points supporting the claim.
    pub pros: Vec<String>,
    /// Points against the claim.
    pub cons: Vec<String>,
    /// Known gaps in the supporting evidence.
    pub gaps: Vec<String>,
}

/// The executive brief a decision packet is built from: one or more claims,
/// a decision-health vector, and an optional dialectical record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Brief {
    /// The claim text, or claims, the packet attests to.
    pub claims: Vec<String>,
    /// Collaborator-supplied decision-health scalars.
    pub health: DecisionHealth,
    /// Optional pro/con/gap record.
    pub dialectic: Option<DialecticalRecord>,
}

/// A caller-supplied mapping from a claim (by index into `Brief::claims`) to
/// the receipt digests that support it. The builder never computes this
/// mapping itself — whatever hash-overlap or retrieval heuristic produced it
/// is a collaborator concern outside this crate.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClaimAttachment {
    /// Index into `Brief::claims`.
    pub claim_index: usize,
    /// Digests of the receipts attached to support this claim.
    pub receipt_digests: Vec<CompositeDigest>,
}

/// The result of a coverage audit: the fraction of claims with at least one
/// attached receipt, whether that clears [`PACKET_COVERAGE_THRESHOLD`], and
/// the count of orphaned receipts (attached to no claim) the caller passed in.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CoverageAudit {
    /// `attached / total_claims`, or `1.0` if there are no claims to cover.
    pub match_rate: f64,
    /// Whether `match_rate` clears [`PACKET_COVERAGE_THRESHOLD`].
    pub pass: bool,
    /// Receipts present in the candidate set but attached to no claim.
    pub orphans: usize,
}

/// Everything that can go wrong building or verifying a decision packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The receipt envelope rejected the packet-receipt stamp request.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// The Merkle engine could not build a root over the attached receipts.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    /// A packet receipt was missing a field `verify_packet` needs to check it.
    #[error("packet receipt is missing required field `{0}`")]
    MalformedPacket(&'static str),
    /// Claim coverage fell below [`PACKET_COVERAGE_THRESHOLD`] (I5). The
    /// `anomaly` and `halt` receipts the StopRule controller raised are
    /// carried here for the caller to ingest; this crate does not do it.
    #[error("claim coverage below the required threshold")]
    CoverageBelowThreshold {
        /// The typed I5 violation.
        violation: InvariantViolation,
        /// The anomaly receipt the StopRule controller emitted.
        anomaly: Receipt,
        /// The halt receipt that followed it.
        halt: Receipt,
    },
}

/// Pure coverage check: `attached / total_claims` compared against
/// [`PACKET_COVERAGE_THRESHOLD`]. Exposed standalone so a collaborator can
/// pre-flight a brief before spending a Merkle pass assembling the packet.
pub fn audit_packet_coverage(attached: usize, total_claims: usize, orphans: usize) -> CoverageAudit {
    let match_rate = if total_claims == 0 {
        1.0
    } else {
        attached as f64 / total_claims as f64
    };
    CoverageAudit {
        match_rate,
        pass: match_rate >= PACKET_COVERAGE_THRESHOLD,
        orphans,
    }
}

fn attached_digest_set(attachments: &[ClaimAttachment]) -> HashSet<&str> {
    attachments
        .iter()
        .flat_map(|a| a.receipt_digests.iter().map(|d| d.as_str()))
        .collect()
}

/// Bind `brief` to `receipts` via the caller-supplied `attachments`, audit
/// claim-coverage, anchor the attached receipts under a Merkle root, and
/// emit a `packet` receipt carrying the claims, decision-health vector,
/// attachment map, attached-receipt count, and root.
///
/// Fails with [`PacketError::CoverageBelowThreshold`] if coverage is below
/// [`PACKET_COVERAGE_THRESHOLD`]; the anomaly and halt receipts it carries
/// must still be ingested by the caller for the trail to be complete.
pub fn build_packet(
    brief: &Brief,
    attachments: &[ClaimAttachment],
    receipts: &[Receipt],
    tenant: Option<Tenant>,
) -> Result<Receipt, PacketError> {
    let total_claims = brief.claims.len();
    let attached: HashSet<usize> = attachments
        .iter()
        .filter(|a| !a.receipt_digests.is_empty())
        .map(|a| a.claim_index)
        .collect();

    let attached_digests = attached_digest_set(attachments);
    let orphans = receipts
        .iter()
        .filter(|r| !attached_digests.contains(r.payload_hash.as_str()))
        .count();

    let audit = audit_packet_coverage(attached.len(), total_claims, orphans);
    if !audit.pass {
        let breach = Breach::new("claim_coverage", PACKET_COVERAGE_THRESHOLD, audit.match_rate)
            .with_tenant(tenant.clone().unwrap_or_else(|| DEFAULT_TENANT.to_string()))
            .with_verdict(Classification::Violation, Action::Halt)
            .with_halt_reason(format!(
                "claim coverage {:.4} fell below the {:.4} gate",
                audit.match_rate, PACKET_COVERAGE_THRESHOLD
            ));
        let halting = provenance_stoprule::raise(breach).expect_err("coverage violation always halts");
        return Err(PacketError::CoverageBelowThreshold {
            violation: InvariantViolation::CoverageBelowThreshold {
                match_rate: audit.match_rate,
                threshold: PACKET_COVERAGE_THRESHOLD,
            },
            anomaly: halting.anomaly,
            halt: halting.halt,
        });
    }

    let attached_receipts: Vec<Receipt> = receipts
        .iter()
        .filter(|r| attached_digests.contains(r.payload_hash.as_str()))
        .cloned()
        .collect();
    let root = merkle_root_of_receipts(&attached_receipts)?;
    let packet_id = composite_digest(brief.claims.join("\u{1f}").as_bytes());

    let payload: Map<String, Value> = [
        ("packet_id".to_string(), json!(packet_id.as_str())),
        ("claims".to_string(), json!(brief.claims)),
        ("health".to_string(), json!(brief.health)),
        ("dialectic".to_string(), json!(brief.dialectic)),
        ("attachments".to_string(), json!(attachments)),
        ("attached_count".to_string(), json!(attached_receipts.len())),
        ("match_rate".to_string(), json!(audit.match_rate)),
        ("root".to_string(), json!(root.as_str())),
        ("signature".to_string(), Value::Null),
    ]
    .into_iter()
    .collect();

    let registry = TypeRegistry::new();
    let packet = emit(ReceiptType::Packet, payload, tenant, &registry)?;
    tracing::info!(root = %root, attached = attached_receipts.len(), total_claims, "decision packet built");
    Ok(packet)
}

/// Recompute the Merkle root over `receipt_set` and compare it to the root
/// recorded in `packet_receipt`. Returns true only on an exact match.
pub fn verify_packet(packet_receipt: &Receipt, receipt_set: &[Receipt]) -> Result<bool, PacketError> {
    let recorded_root = packet_receipt
        .payload
        .get("root")
        .and_then(|v| v.as_str())
        .ok_or(PacketError::MalformedPacket("root"))?;
    let recomputed = merkle_root_of_receipts(receipt_set)?;
    Ok(recomputed.as_str() == recorded_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use provenance_spec::ReceiptType as RT;
    use serde_json::Map as JMap;

    fn sample_receipt(note: &str) -> Receipt {
        let registry = TypeRegistry::new();
        let mut payload = JMap::new();
        payload.insert("note".into(), json!(note));
        emit(RT::Ingest, payload, None, &registry).unwrap()
    }

    #[test]
    fn coverage_below_threshold_is_rejected() {
        let audit = audit_packet_coverage(1, 2, 0);
        assert!(!audit.pass);
        assert!((audit.match_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn coverage_with_no_claims_trivially_passes() {
        let audit = audit_packet_coverage(0, 0, 0);
        assert!(audit.pass);
        assert_eq!(audit.match_rate, 1.0);
    }

    #[test]
    fn build_packet_succeeds_when_every_claim_is_attached() {
        let r1 = sample_receipt("a");
        let r2 = sample_receipt("b");
        let brief = Brief {
            claims: vec!["claim one".into()],
            health: DecisionHealth {
                strength: 0.9,
                coverage: 1.0,
                efficiency: 0.8,
            },
            dialectic: None,
        };
        let attachments = vec![ClaimAttachment {
            claim_index: 0,
            receipt_digests: vec![r1.payload_hash.clone(), r2.payload_hash.clone()],
        }];
        let packet = build_packet(&brief, &attachments, &[r1, r2], None).unwrap();
        assert_eq!(packet.receipt_type, ReceiptType::Packet);
        assert_eq!(packet.payload.get("attached_count").and_then(|v| v.as_u64()), Some(2));
    }

    #[test]
    fn build_packet_fails_closed_with_anomaly_and_halt_when_a_claim_is_unattached() {
        let r1 = sample_receipt("a");
        let brief = Brief {
            claims: vec!["claim one".into(), "claim two".into()],
            health: DecisionHealth {
                strength: 0.5,
                coverage: 0.5,
                efficiency: 0.5,
            },
            dialectic: None,
        };
        let attachments = vec![ClaimAttachment {
            claim_index: 0,
            receipt_digests: vec![r1.payload_hash.clone()],
        }];
        let err = build_packet(&brief, &attachments, &[r1], None).unwrap_err();
        match err {
            PacketError::CoverageBelowThreshold { anomaly, halt, .. } => {
                assert_eq!(anomaly.receipt_type, ReceiptType::Anomaly);
                assert_eq!(halt.receipt_type, ReceiptType::Halt);
            }
            other => panic!("expected CoverageBelowThreshold, got {other:?}"),
        }
    }

    #[test]
    fn verify_packet_detects_tampered_receipt_set() {
        let r1 = sample_receipt("a");
        let r2 = sample_receipt("b");
        let brief = Brief {
            claims: vec!["claim one".into()],
            health: DecisionHealth {
                strength: 1.0,
                coverage: 1.0,
                efficiency: 1.0,
            },
            dialectic: None,
        };
        let attachments = vec![ClaimAttachment {
            claim_index: 0,
            receipt_digests: vec![r1.payload_hash.clone(), r2.payload_hash.clone()],
        }];
        let packet = build_packet(&brief, &attachments, &[r1.clone(), r2], None).unwrap();
        let tampered = sample_receipt("tampered");
        assert!(!verify_packet(&packet, &[r1, tampered]).unwrap());
    }

    #[test]
    fn verify_packet_rejects_receipt_missing_root_field() {
        let bare = sample_receipt("not-a-packet");
        let err = verify_packet(&bare, &[]).unwrap_err();
        assert!(matches!(err, PacketError::MalformedPacket("root")));
    }

    #[test]
    fn orphan_receipts_are_counted_but_do_not_block_coverage() {
        let r1 = sample_receipt("attached");
        let orphan = sample_receipt("orphan");
        let brief = Brief {
            claims: vec!["claim one".into()],
            health: DecisionHealth {
                strength: 1.0,
                coverage: 1.0,
                efficiency: 1.0,
            },
            dialectic: None,
        };
        let attachments = vec![ClaimAttachment {
            claim_index: 0,
            receipt_digests: vec![r1.payload_hash.clone()],
        }];
        let digests = attached_digest_set(&attachments);
        let orphans = [&r1, &orphan]
            .iter()
            .filter(|r| !digests.contains(r.payload_hash.as_str()))
            .count();
        assert_eq!(orphans, 1);
        let packet = build_packet(&brief, &attachments, &[r1, orphan], None).unwrap();
        assert_eq!(packet.payload.get("attached_count").and_then(|v| v.as_u64()), Some(1));
    }

    proptest::proptest! {
        #[test]
        fn match_rate_is_always_in_unit_interval(attached in 0usize..50, total in 1usize..50) {
            let audit = audit_packet_coverage(attached.min(total), total, 0);
            proptest::prop_assert!(audit.match_rate >= 0.0 && audit.match_rate <= 1.0);
        }
    }
}
