//! Benchmark suite for softcache operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use softcache::{CacheTable, KeyOrder, LongKeyMap, MemoryAuthority, MemoryRegistry};
use std::sync::Arc;
use std::time::Duration;

fn new_cache(registry: &Arc<MemoryRegistry>) -> CacheTable<u64, String> {
    CacheTable::builder()
        .average_size(64)
        .memory_authority(Arc::clone(registry) as Arc<dyn MemoryAuthority>)
        .build()
        .expect("valid configuration")
}

/// Benchmark insertion of new entries into an empty cache.
///
/// Tests cache sizes: 100, 1,000, and 10,000 entries.
fn insert_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    let registry = Arc::new(MemoryRegistry::new());

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let cache = new_cache(&registry);
                for i in 0..size {
                    cache.insert(black_box(i), black_box(format!("value-{i}")));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark read operations on a pre-populated cache.
///
/// Every hit stamps the entry, so this also measures the access-window update.
fn get_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let registry = Arc::new(MemoryRegistry::new());

    for size in [100, 1000, 10000].iter() {
        let cache = new_cache(&registry);
        for i in 0..*size {
            cache.insert(i, format!("value-{i}"));
        }

        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    let _ = cache.get(&black_box(i));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark a partial eviction pass.
///
/// Fills a cache with 10,000 entries and releases the given share of it.
fn eviction_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction");
    let registry = Arc::new(MemoryRegistry::new());
    let size = 10_000;

    group.throughput(Throughput::Elements(size));
    for percent in [0.05, 0.5, 0.9].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(percent), percent, |b, &percent| {
            b.iter(|| {
                let cache = new_cache(&registry);
                for i in 0..size {
                    cache.insert(i, format!("value-{i}"));
                }
                cache.queued_free_memory(black_box(percent)).unwrap()
            });
        });
    }
    group.finish();
}

/// Benchmark bulk loads into a long key map, lazy and materialized.
fn long_map_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("long_map");
    let keys = Arc::new((0..10_000_i64).collect::<Vec<_>>());

    group.throughput(Throughput::Elements(keys.len() as u64));
    for (name, order) in [("lazy", KeyOrder::UniqueSorted), ("materialized", KeyOrder::Unknown)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut map = LongKeyMap::new();
                map.put_multi_rows(Arc::clone(&keys), 1_u32, order);
                black_box(map.sorted_key_array())
            });
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(100);
    targets = insert_benchmark, get_benchmark, eviction_benchmark, long_map_benchmark
}

criterion_main!(benches);
