//! Memtable ingestion benchmarks: raw insert throughput and the cost of the
//! first ordered scan (which pays for any unsealed vectors).

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use silt_lsm::compare::{
    write_internal_key, InternalKeyComparator, ValueKind, INTERNAL_KEY_TRAILER,
};
use silt_lsm::config::MemtableConfig;
use silt_lsm::memtable::Memtable;
use std::sync::Arc;

const KEYS: u64 = 10_000;

fn bench_config() -> MemtableConfig {
    MemtableConfig {
        bucket_count: 64 * 1024,
        stripe_count: 1024,
        switch_vector_limit: 10_000,
        arena_block_bytes: 256 * 1024,
    }
}

fn fill(mt: &Memtable, keys: u64) {
    for i in 0..keys {
        let user = format!("key_{:08}", i.wrapping_mul(2654435761) % keys);
        let mut writer = mt.allocate(user.len() + INTERNAL_KEY_TRAILER).unwrap();
        write_internal_key(writer.buf_mut(), user.as_bytes(), i + 1, ValueKind::Value);
        let _ = mt.insert(writer);
    }
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("memtable_ingest");
    group.throughput(Throughput::Elements(KEYS));

    group.bench_function("insert_10k", |b| {
        b.iter_batched(
            || Memtable::new(&bench_config(), Arc::new(InternalKeyComparator::default())),
            |mt| {
                fill(&mt, KEYS);
                mt
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("insert_10k_then_scan", |b| {
        b.iter_batched(
            || Memtable::new(&bench_config(), Arc::new(InternalKeyComparator::default())),
            |mt| {
                fill(&mt, KEYS);
                let mut iter = mt.iter();
                iter.seek_to_first();
                let mut count = 0usize;
                while iter.valid() {
                    count += 1;
                    iter.next();
                }
                (mt, count)
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_insert);
criterion_main!(benches);
