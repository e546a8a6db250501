use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use quill_collab::protocol::{decode_operation, encode_operation};
use quill_collab::storage::{DocumentStore, RocksStore, StoreConfig};
use quill_collab::{
    recover, Connection, ConnectionId, DocumentId, DocumentSession, HistoryWriter, MemoryStore,
    Operation, Replica,
};
use std::hint::black_box;
use std::sync::Arc;

fn sample_text(chars: usize) -> String {
    "The quick brown fox jumps over the lazy dog. "
        .chars()
        .cycle()
        .take(chars)
        .collect()
}

fn bench_replica_insert_middle_10k(c: &mut Criterion) {
    let doc = DocumentId::new("bench");
    let op = Operation::insert(doc.clone(), 5_000, "typed", "u");

    c.bench_function("replica_insert_middle_10k", |b| {
        b.iter_batched(
            || Replica::from_text(doc.clone(), &sample_text(10_000)),
            |replica| {
                replica.apply(black_box(&op));
                black_box(replica.len());
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_replica_delete_clamped(c: &mut Criterion) {
    let doc = DocumentId::new("bench");
    let op = Operation::delete(doc.clone(), 9_990, 100, "u");

    c.bench_function("replica_delete_overlong_10k", |b| {
        b.iter_batched(
            || Replica::from_text(doc.clone(), &sample_text(10_000)),
            |replica| replica.apply(black_box(&op)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let frame = r#"{"type":"insert","position":42,"value":"hello","operationId":"6f1c2f0e-8d4b-4a53-9a2e-0c6a4a1f7b11"}"#;

    c.bench_function("operation_decode", |b| {
        b.iter(|| black_box(decode_operation(black_box(frame)).unwrap()))
    });
}

fn bench_operation_encode(c: &mut Criterion) {
    let op = Operation::insert(DocumentId::new("bench"), 42, "hello", "alice");

    c.bench_function("operation_encode", |b| {
        b.iter(|| black_box(encode_operation(black_box(&op)).unwrap()))
    });
}

fn bench_session_fan_out_100(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let doc = DocumentId::new("bench");

    let (session, mut receivers) = runtime.block_on(async {
        let (sink, _writer) = HistoryWriter::spawn(Arc::new(MemoryStore::new()));
        let session = DocumentSession::new(doc.clone(), sink);
        let mut receivers = Vec::new();
        for i in 0..100 {
            let (conn, rx) = Connection::new(format!("peer-{i}"), 16);
            session.add_connection(conn).await;
            receivers.push(rx);
        }
        (session, receivers)
    });
    let sender = ConnectionId::next();

    c.bench_function("session_apply_fan_out_100_peers", |b| {
        b.iter(|| {
            let op = Operation::cursor(doc.clone(), 3, "#336699", "bench");
            black_box(runtime.block_on(session.apply_and_broadcast(op, sender)));
            // Drain so queues never fill between iterations
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_recover_1000_ops(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc = DocumentId::new("bench");
    store.insert_snapshot(&doc, 1, &sample_text(2_000)).unwrap();
    for i in 0..1_000u64 {
        let mut op = Operation::insert(doc.clone(), (i * 7 % 2_000) as i64, "x", "u");
        op.timestamp = 2 + i;
        store.insert_operation(&op).unwrap();
    }

    c.bench_function("recover_snapshot_plus_1000_ops", |b| {
        b.iter(|| black_box(recover(&store, &doc).unwrap().replica.len()))
    });
}

criterion_group!(
    benches,
    bench_replica_insert_middle_10k,
    bench_replica_delete_clamped,
    bench_operation_decode,
    bench_operation_encode,
    bench_session_fan_out_100,
    bench_recover_1000_ops,
);

criterion_main!(benches);
