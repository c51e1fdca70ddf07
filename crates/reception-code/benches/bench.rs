use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use chrono::{NaiveDate, NaiveDateTime};
use reception_code::{
    Allocation, AllocatorConfig, Category, CategoryRegistry, MaxScanSequencer, MemoryStore,
    MemoryStoreError, MemoryTransaction, ReceptionAllocator, ResetPeriod, SequenceCounterStore, SequenceSource,
};
use std::{
    sync::{Arc, Barrier},
    thread::scope,
    time::Instant,
};

const TOTAL_CODES: usize = 1024;

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 12, 11)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .unwrap()
}

fn registry() -> CategoryRegistry {
    [(
        "BENCH",
        Category::new("BENCH", 6, ResetPeriod::Monthly, false).unwrap(),
    )]
    .into_iter()
    .collect()
}

fn insert(tx: &mut MemoryTransaction, allocation: &Allocation) -> Result<(), MemoryStoreError> {
    tx.insert_reception(allocation.to_record("BENCH", now()))
}

/// Benchmarks one writer allocating [`TOTAL_CODES`] codes into a fresh store.
fn bench_sequential<S>(c: &mut Criterion, group_name: &str, sequencer: impl Fn() -> S)
where
    S: SequenceSource,
{
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(TOTAL_CODES as u64));
    group.bench_function(format!("elems/{TOTAL_CODES}"), |b| {
        b.iter_custom(|iters| {
            let mut elapsed = core::time::Duration::ZERO;
            for _ in 0..iters {
                let store = MemoryStore::new();
                let allocator = ReceptionAllocator::new(registry())
                    .with_config(AllocatorConfig::new().without_backoff())
                    .with_sequencer(sequencer());

                let start = Instant::now();
                for _ in 0..TOTAL_CODES {
                    let (allocation, ()) = allocator
                        .allocate_with_retry(&store, "BENCH", Some(now()), insert)
                        .unwrap();
                    black_box(allocation);
                }
                elapsed += start.elapsed();
            }
            elapsed
        });
    });
    group.finish();
}

/// Benchmarks several writers sharing one store and one counter key.
fn bench_contended<S>(c: &mut Criterion, group_name: &str, sequencer: impl Fn() -> S)
where
    S: SequenceSource + Sync,
{
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(TOTAL_CODES as u64));

    for thread_count in [1, 2, 4, 8] {
        let codes_per_thread = TOTAL_CODES / thread_count;
        group.bench_function(
            format!("elems/{TOTAL_CODES}/threads/{thread_count}"),
            |b| {
                b.iter_custom(|iters| {
                    let mut elapsed = core::time::Duration::ZERO;
                    for _ in 0..iters {
                        let store = MemoryStore::new();
                        let allocator = ReceptionAllocator::new(registry())
                            .with_config(AllocatorConfig::new().with_max_attempts(64))
                            .with_sequencer(sequencer());
                        let barrier = Arc::new(Barrier::new(thread_count + 1));

                        let start = Instant::now();
                        scope(|s| {
                            for _ in 0..thread_count {
                                let barrier = Arc::clone(&barrier);
                                let (store, allocator) = (&store, &allocator);
                                s.spawn(move || {
                                    barrier.wait();
                                    for _ in 0..codes_per_thread {
                                        let (allocation, ()) = allocator
                                            .allocate_with_retry(store, "BENCH", Some(now()), insert)
                                            .unwrap();
                                        black_box(allocation);
                                    }
                                });
                            }
                            barrier.wait();
                        });
                        elapsed += start.elapsed();
                    }
                    elapsed
                });
            },
        );
    }

    group.finish();
}

fn benchmark_counter_sequential(c: &mut Criterion) {
    bench_sequential(c, "counter/sequential", SequenceCounterStore::default);
}

fn benchmark_scan_sequential(c: &mut Criterion) {
    bench_sequential(c, "max_scan/sequential", || MaxScanSequencer);
}

fn benchmark_counter_contended(c: &mut Criterion) {
    bench_contended(c, "counter/contended", SequenceCounterStore::default);
}

fn benchmark_scan_contended(c: &mut Criterion) {
    bench_contended(c, "max_scan/contended", || MaxScanSequencer);
}

criterion_group!(
    benches,
    benchmark_counter_sequential,
    benchmark_scan_sequential,
    benchmark_counter_contended,
    benchmark_scan_contended,
);
criterion_main!(benches);
