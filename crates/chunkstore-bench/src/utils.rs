//! Benchmark utilities and helpers.

use std::sync::Arc;

use chunkstore_common::config::StoreConfig;
use chunkstore_engine::ChunkStore;
use chunkstore_memory::{Heap, HeapArena};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Arena size used by the benchmarks.
pub const BENCH_ARENA_SIZE: u64 = 64 * 1024 * 1024;

/// Largest payload the benchmarks request.
pub const BENCH_MAX_BLOCK: u64 = 1024 * 1024;

/// Generates payload sizes: mostly small, with an occasional large one.
pub fn generate_sizes(count: usize, small_max: u64, large_max: u64) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| {
            if rng.gen_ratio(9, 10) {
                rng.gen_range(1..=small_max)
            } else {
                rng.gen_range(small_max + 1..=large_max)
            }
        })
        .collect()
}

/// Generates random payloads of the given sizes.
pub fn generate_payloads(sizes: &[u64]) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(42);
    sizes
        .iter()
        .map(|&size| (0..size).map(|_| rng.gen()).collect())
        .collect()
}

/// Creates an empty heap over a fresh arena.
pub fn bench_heap() -> Heap {
    Heap::new(Arc::new(HeapArena::new(BENCH_ARENA_SIZE)), BENCH_MAX_BLOCK)
        .expect("benchmark heap geometry is valid")
}

/// Creates an empty store sized for the benchmarks.
pub fn bench_store() -> ChunkStore {
    let config = StoreConfig::new()
        .with_arena_size(BENCH_ARENA_SIZE)
        .with_max_block_size(BENCH_MAX_BLOCK);
    ChunkStore::open(config).expect("benchmark store config is valid")
}
