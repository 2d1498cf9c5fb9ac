use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Map};

use provenance::*;

fn sample_payload(n: u64) -> Map<String, serde_json::Value> {
    let mut m = Map::new();
    m.insert("n".into(), json!(n));
    m
}

fn bench_composite_digest(c: &mut Criterion) {
    let blob = [0x77u8; 4096];
    c.bench_function("composite_digest", |b| {
        b.iter(|| composite_digest(black_box(&blob)));
    });
}

fn bench_emit(c: &mut Criterion) {
    let registry = TypeRegistry::new();
    c.bench_function("emit_receipt", |b| {
        b.iter(|| {
            emit(
                black_box(ReceiptType::Ingest),
                black_box(sample_payload(1)),
                None,
                &registry,
            )
            .expect("emit succeeds")
        });
    });
}

fn bench_merkle_root_of_receipts(c: &mut Criterion) {
    let registry = TypeRegistry::new();
    let receipts: Vec<Receipt> = (0..256u64)
        .map(|n| emit(ReceiptType::Ingest, sample_payload(n), None, &registry).unwrap())
        .collect();

    c.bench_function("merkle_root_of_256_receipts", |b| {
        b.iter(|| merkle_root_of_receipts(black_box(&receipts)).expect("root"));
    });
}

fn bench_prove_and_verify(c: &mut Criterion) {
    let registry = TypeRegistry::new();
    let receipts: Vec<Receipt> = (0..256u64)
        .map(|n| emit(ReceiptType::Ingest, sample_payload(n), None, &registry).unwrap())
        .collect();
    let root = merkle_root_of_receipts(&receipts).unwrap();
    let proof = prove_receipt(&receipts, 128).unwrap();

    c.bench_function("prove_receipt_of_256", |b| {
        b.iter(|| prove_receipt(black_box(&receipts), black_box(128)).expect("proof"));
    });

    c.bench_function("verify_receipt_of_256", |b| {
        b.iter(|| verify_receipt(black_box(&receipts[128]), black_box(&proof), black_box(&root)).expect("verify"));
    });
}

fn bench_ledger_ingest_latency(c: &mut Criterion) {
    let ledger = Ledger::in_memory(LedgerConfig::default());
    let mut n = 0u64;

    c.bench_function("ledger_ingest_in_memory", |b| {
        b.iter(|| {
            n += 1;
            ledger
                .emit_and_ingest(
                    black_box(ReceiptType::Ingest),
                    black_box(sample_payload(n)),
                    None,
                    None,
                )
                .expect("ingest succeeds")
        });
    });
}

fn bench_anchor_batch(c: &mut Criterion) {
    let ledger = Ledger::in_memory(LedgerConfig::default());
    let registry = TypeRegistry::new();
    let receipts: Vec<Receipt> = (0..64u64)
        .map(|n| emit(ReceiptType::Ingest, sample_payload(n), None, &registry).unwrap())
        .collect();

    c.bench_function("anchor_batch_of_64", |b| {
        b.iter(|| ledger.anchor_batch(black_box(&receipts), None).expect("anchor"));
    });
}

criterion_group!(
    benches,
    bench_composite_digest,
    bench_emit,
    bench_merkle_root_of_receipts,
    bench_prove_and_verify,
    bench_ledger_ingest_latency,
    bench_anchor_batch,
);
criterion_main!(benches);
