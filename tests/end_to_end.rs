use std::net::TcpListener;

use serde_json::{json, Map, Value};

use provenance::*;
use provenance_ledger::LedgerConfig;
use provenance_offline::{FixedConnectivityProbe, OfflineConfig, OfflineQueue};
use provenance_packet::{Brief, ClaimAttachment, DecisionHealth};

fn payload(note: &str) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("note".into(), json!(note));
    m
}

#[test]
fn dual_hash_and_canonicalization_are_order_and_algorithm_stable() {
    // Two payloads that differ only in key insertion order canonicalize
    // identically, so their composite digests match.
    let registry = TypeRegistry::new();
    let mut a = Map::new();
    a.insert("alpha".into(), json!(1));
    a.insert("beta".into(), json!(2));
    let mut b = Map::new();
    b.insert("beta".into(), json!(2));
    b.insert("alpha".into(), json!(1));

    let receipt_a = emit(ReceiptType::Ingest, a, None, &registry).unwrap();
    let receipt_b = emit(ReceiptType::Ingest, b, None, &registry).unwrap();
    assert_eq!(receipt_a.payload_hash, receipt_b.payload_hash);

    // The empty-byte sentinel is itself a composite digest, not a literal
    // string of zeroes, and is the root an empty Merkle tree folds to.
    let sentinel = empty_sentinel_digest();
    assert_eq!(sentinel, composite_digest(b"empty"));
    assert_eq!(merkle_root_of_receipts(&[]).unwrap(), sentinel);
}

#[test]
fn three_leaf_tree_duplicates_the_last_leaf_and_proof_verifies() {
    let registry = TypeRegistry::new();
    let receipts: Vec<Receipt> = ["one", "two", "three"]
        .iter()
        .map(|note| emit(ReceiptType::Ingest, payload(note), None, &registry).unwrap())
        .collect();

    let root = merkle_root_of_receipts(&receipts).unwrap();

    // An odd leaf count duplicates the final leaf when pairing, so the root
    // must equal the root of the four-leaf tree with "three" repeated.
    let doubled: Vec<Receipt> = vec![
        receipts[0].clone(),
        receipts[1].clone(),
        receipts[2].clone(),
        receipts[2].clone(),
    ];
    assert_eq!(root, merkle_root_of_receipts(&doubled).unwrap());

    for index in 0..receipts.len() {
        let proof = prove_receipt(&receipts, index).unwrap();
        assert!(verify_receipt(&receipts[index], &proof, &root).unwrap());
    }

    // A proof folded against a tampered root must fail, not panic.
    let proof = prove_receipt(&receipts, 0).unwrap();
    let tampered = composite_digest(b"not the real root");
    assert!(!verify_receipt(&receipts[0], &proof, &tampered).unwrap());
}

#[test]
fn ledger_enforces_monotone_sequence_and_parent_linkage() {
    let ledger = Ledger::in_memory(LedgerConfig::default());

    let first = ledger
        .emit_and_ingest(ReceiptType::Ingest, payload("root"), None, None)
        .unwrap();
    assert_eq!(first.sequence, 0);

    let second = ledger
        .emit_and_ingest(
            ReceiptType::Ingest,
            payload("child"),
            None,
            Some(first.receipt.payload_hash.clone()),
        )
        .unwrap();
    assert_eq!(second.sequence, 1);
    assert_eq!(second.parent_hash, Some(first.receipt.payload_hash.clone()));

    // A parent digest the ledger has never seen must be rejected as an
    // invariant violation, and must also appear as an anomaly plus halt
    // receipt on the ledger's own stream rather than vanish silently.
    let bogus_parent = composite_digest(b"never ingested");
    let err = ledger
        .emit_and_ingest(ReceiptType::Ingest, payload("orphan"), None, Some(bogus_parent))
        .unwrap_err();
    assert!(matches!(err, LedgerError::Invariant(InvariantViolation::ParentNotFound { .. })));
    assert_eq!(ledger.query_by_type(&ReceiptType::Anomaly).len(), 1);
    assert_eq!(ledger.query_by_type(&ReceiptType::Halt).len(), 1);

    let lineage = ledger
        .lineage(&second.receipt.payload_hash, 10)
        .expect("lineage walk succeeds within the depth cap");
    assert_eq!(lineage.ancestors.len(), 1);
    assert_eq!(lineage.ancestors[0].receipt.payload_hash, first.receipt.payload_hash);
}

#[test]
fn packet_coverage_gate_passes_at_threshold_and_fails_just_below_it() {
    let ledger = Ledger::in_memory(LedgerConfig::default());
    let claims: Vec<String> = (0..1000).map(|i| format!("claim-{i}")).collect();
    let receipts: Vec<Receipt> = claims
        .iter()
        .map(|c| ledger.emit_and_ingest(ReceiptType::Ingest, payload(c), None, None).unwrap().receipt)
        .collect();

    let brief = Brief {
        claims: claims.clone(),
        health: DecisionHealth {
            strength: 0.9,
            coverage: 0.95,
            efficiency: 0.8,
        },
        dialectic: None,
    };

    // 999/1000 attached clears the 0.999 gate exactly.
    let full_attachments: Vec<ClaimAttachment> = (0..999)
        .map(|i| ClaimAttachment {
            claim_index: i,
            receipt_digests: vec![receipts[i].payload_hash.clone()],
        })
        .collect();
    let packet = build_packet(&brief, &full_attachments, &receipts, None)
        .expect("999/1000 attached clears the 0.999 threshold");
    // The packet's root is anchored over only the 999 attached receipts
    // (receipts[999] is an orphan); verify against that same subset.
    assert!(verify_packet(&packet, &receipts[..999]).unwrap());

    // 998/1000 attached (match_rate 0.998) must be rejected and must carry
    // an anomaly and halt receipt for the caller to ingest.
    let short_attachments: Vec<ClaimAttachment> = (0..998)
        .map(|i| ClaimAttachment {
            claim_index: i,
            receipt_digests: vec![receipts[i].payload_hash.clone()],
        })
        .collect();
    let err = build_packet(&brief, &short_attachments, &receipts, None).unwrap_err();
    match err {
        PacketError::CoverageBelowThreshold { violation, anomaly, halt } => {
            assert!(matches!(violation, InvariantViolation::CoverageBelowThreshold { .. }));
            assert_eq!(anomaly.receipt_type, ReceiptType::Anomaly);
            assert_eq!(halt.receipt_type, ReceiptType::Halt);
        }
        other => panic!("expected a coverage gate failure, got {other:?}"),
    }
}

#[test]
fn stoprule_classification_tracks_deviation_magnitude() {
    // Small relative deviation (5%): drift, auto-fix.
    let drift = classify(5.0, 100.0, false);
    assert_eq!(drift, (Classification::Drift, Action::AutoFix));

    // Mid-range deviation (30%): degradation, alert.
    let degraded = classify(30.0, 100.0, false);
    assert_eq!(degraded, (Classification::Degradation, Action::Alert));

    // Large deviation (60%): magnitude alone escalates as a deviation, it
    // never halts on its own. Halting only happens once a caller has
    // confirmed a rule breach and supplies an explicit verdict override,
    // and the halting error carries both the anomaly and the halt receipt
    // rather than discarding either.
    let large = classify(60.0, 100.0, false);
    assert_eq!(large, (Classification::Deviation, Action::Escalate));

    let breach = Breach::new("throughput", 100.0, 10.0).with_verdict(Classification::Violation, Action::Halt);
    let halting = raise(breach).expect_err("a Halt-classified breach always raises");
    assert_eq!(halting.anomaly.receipt_type, ReceiptType::Anomaly);
    assert_eq!(halting.halt.receipt_type, ReceiptType::Halt);
    assert!(halting.halt.payload.contains_key("escalation_deadline"));

    // An explicit anti-pattern flag overrides magnitude but still only
    // escalates; it is not itself a confirmed rule breach.
    let anti_pattern = classify(1.0, 100.0, true);
    assert_eq!(anti_pattern, (Classification::AntiPattern, Action::Escalate));
}

#[test]
fn offline_queue_round_trips_through_disconnect_and_reconnect() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let queue = OfflineQueue::open(dir.path(), Box::new(FixedConnectivityProbe(false)), OfflineConfig::default())?;

    // While disconnected, enqueue keeps accumulating and the local root
    // reflects every entry appended so far.
    queue.enqueue(ReceiptType::Ingest, payload("offline-one"), None)?;
    queue.enqueue(ReceiptType::Ingest, payload("offline-two"), None)?;
    assert_eq!(queue.size(), 2);
    let offline_root = queue.local_root();

    let ledger = Ledger::in_memory(LedgerConfig::default());
    assert!(matches!(queue.sync(&ledger).unwrap_err(), provenance_offline::OfflineError::Unreachable));
    assert_eq!(queue.size(), 2, "a failed sync leaves the local queue untouched");

    // Simulate reconnection: a probe that now reports reachable lets sync
    // proceed, draining the queue into the main ledger and recording the
    // sync plus any conflict observations.
    let reconnected = OfflineQueue::open(dir.path(), Box::new(FixedConnectivityProbe(true)), OfflineConfig::default())?;
    assert_eq!(reconnected.size(), 2, "recovery replays the spool from disk");
    assert_eq!(reconnected.local_root(), offline_root);

    let result = reconnected.sync(&ledger)?;
    assert_eq!(result.synced, 2);
    assert_eq!(result.duplicates_skipped, 0);
    assert_eq!(reconnected.size(), 0);
    assert_eq!(ledger.query_by_type(&ReceiptType::Ingest).len(), 2);
    assert_eq!(ledger.query_by_type(&ReceiptType::OfflineSync).len(), 1);
    assert_eq!(ledger.query_by_type(&ReceiptType::Consistency).len(), 1);

    Ok(())
}

#[test]
fn tcp_connectivity_probe_reflects_a_real_socket() {
    // A bound, listening loopback socket is reachable; an address nothing
    // is listening on is not. Exercises the production probe end to end
    // without any network dependency beyond localhost.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let reachable = TcpConnectivityProbe::new(addr.to_string(), std::time::Duration::from_millis(200));
    assert!(reachable.is_reachable());
    drop(listener);

    let unreachable = TcpConnectivityProbe::new("127.0.0.1:1", std::time::Duration::from_millis(200));
    assert!(!unreachable.is_reachable());
}
