//! Allocator and translation table benchmarks.
//!
//! Benchmarks for:
//! - malloc followed by free of the same block
//! - Random malloc/free churn over a fragmented heap
//! - multi_malloc against individual mallocs
//! - Table lookups with and without the leaf cache

use chunkstore_bench::utils::{bench_heap, generate_sizes};
use chunkstore_common::types::{ChunkId, NodeId};
use chunkstore_index::TranslationTable;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Benchmark a malloc/free pair on an otherwise empty heap.
fn bench_malloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap/malloc_free");

    for size in [16u64, 256, 4096, 65_536].iter() {
        let mut heap = bench_heap();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let entry = heap.malloc(black_box(size)).unwrap();
                heap.free(entry).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark random churn: free a random live block, allocate a new one.
fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap/churn");
    let sizes = generate_sizes(10_000, 256, 16_384);

    group.throughput(Throughput::Elements(sizes.len() as u64));
    group.bench_function("10k_ops", |b| {
        b.iter(|| {
            let mut heap = bench_heap();
            let mut rng = StdRng::seed_from_u64(7);
            let mut live = Vec::with_capacity(2048);
            for &size in &sizes {
                if live.len() > 1024 {
                    let index = rng.gen_range(0..live.len());
                    heap.free(live.swap_remove(index)).unwrap();
                }
                live.push(heap.malloc(size).unwrap());
            }
            black_box(heap.status())
        });
    });

    group.finish();
}

/// Benchmark multi_malloc against a loop of single mallocs.
fn bench_multi_malloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap/multi");

    for count in [8usize, 64, 256].iter() {
        let sizes = vec![128u64; *count];
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::new("multi_malloc", count), &sizes, |b, sizes| {
            let mut heap = bench_heap();
            b.iter(|| {
                let entries = heap.multi_malloc(sizes).unwrap();
                for entry in entries {
                    heap.free(entry).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("malloc_each", count), &sizes, |b, sizes| {
            let mut heap = bench_heap();
            b.iter(|| {
                let entries: Vec<_> = sizes.iter().map(|&size| heap.malloc(size).unwrap()).collect();
                for entry in entries {
                    heap.free(entry).unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark id translation over a populated table.
fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("table/translate");
    let owner = NodeId::new(1);
    let count = 50_000u64;

    for leaf_cache in [false, true] {
        let mut heap = bench_heap();
        let table = TranslationTable::create(&mut heap, 4, leaf_cache).unwrap();
        for lid in 0..count {
            table
                .translate_or_create(ChunkId::new(owner, lid), &mut heap)
                .unwrap();
        }

        let mut rng = StdRng::seed_from_u64(42);
        let probes: Vec<ChunkId> = (0..1000)
            .map(|_| ChunkId::new(owner, rng.gen_range(0..count)))
            .collect();

        let name = if leaf_cache { "leaf_cache" } else { "walk" };
        group.throughput(Throughput::Elements(probes.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                for &id in &probes {
                    black_box(table.translate(id).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_malloc_free,
    bench_churn,
    bench_multi_malloc,
    bench_translate,
);
criterion_main!(benches);
