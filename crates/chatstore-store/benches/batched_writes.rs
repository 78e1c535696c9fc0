//! Throughput of message writes through the batching worker versus one
//! transaction per write.

use bytes::Bytes;
use chatstore_core::{DialogId, MessageId, MessageRecord, PrefixedDateDecoder};
use chatstore_store::{
    BatchConfig, MessageDb, MessageDbAsync, MessageSchema, SchemaManager, SqliteDb, SyncStore, WorkerConnection,
};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

const WRITES: i64 = 500;

fn new_message_db() -> MessageDb {
    let db = SqliteDb::open_in_memory().unwrap();
    db.apply_session_pragmas().unwrap();
    SchemaManager::migrate::<MessageSchema>(&db, 0).unwrap();
    MessageDb::new(WorkerConnection::detached(db), Arc::new(PrefixedDateDecoder))
}

fn record(id: i64) -> MessageRecord {
    MessageRecord::new(DialogId::new(1), MessageId::new(id), Bytes::from(vec![0u8; 64]))
}

fn bench_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_writes");

    group.bench_function("transaction_per_write", |b| {
        b.iter_batched(
            new_message_db,
            |mut db| {
                for id in 1..=WRITES {
                    db.begin_write_transaction().unwrap();
                    db.add_message(&record(id)).unwrap();
                    db.commit_transaction().unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("batched_worker", |b| {
        b.iter_batched(
            || MessageDbAsync::spawn(new_message_db(), BatchConfig::default()).unwrap(),
            |store| {
                let pending: Vec<_> = (1..=WRITES).map(|id| store.add_message(record(id))).collect();
                store.force_flush().blocking_wait().unwrap();
                for write in pending {
                    write.blocking_wait().unwrap();
                }
                store.close().blocking_wait().unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_writes);
criterion_main!(benches);
