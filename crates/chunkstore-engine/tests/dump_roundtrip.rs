//! Randomized workloads checked against a model, then dumped, reloaded and
//! analyzed.

use std::collections::HashMap;

use chunkstore_common::config::StoreConfig;
use chunkstore_common::error::StoreError;
use chunkstore_common::types::{ChunkId, NodeId};
use chunkstore_engine::{analyze, ChunkStore, Dump};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Applies a seeded mix of operations and mirrors it in `model`.
fn random_workload(store: &ChunkStore, model: &mut HashMap<ChunkId, Vec<u8>>, seed: u64, ops: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ids: Vec<ChunkId> = model.keys().copied().collect();
    ids.sort_unstable();

    for _ in 0..ops {
        let choice = rng.gen_range(0..100);
        if ids.is_empty() || choice < 35 {
            let len = if rng.gen_bool(0.9) {
                rng.gen_range(1..=512)
            } else {
                rng.gen_range(1025..=20_000)
            };
            let id = store.create(len).unwrap();
            let byte = rng.gen::<u8>();
            let data = vec![byte; len as usize];
            store.put(id, &data).unwrap();
            model.insert(id, data);
            ids.push(id);
        } else if choice < 60 {
            let id = ids[rng.gen_range(0..ids.len())];
            let len = rng.gen_range(1..=4096);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            store.put(id, &data).unwrap();
            model.insert(id, data);
        } else if choice < 75 {
            let id = ids[rng.gen_range(0..ids.len())];
            let len = rng.gen_range(1..=3000usize);
            store.resize(id, len as u64).unwrap();
            let data = model.get_mut(&id).unwrap();
            data.resize(len, 0);
        } else {
            let index = rng.gen_range(0..ids.len());
            let id = ids.swap_remove(index);
            store.remove(id).unwrap();
            model.remove(&id);
        }
    }
}

fn verify(store: &ChunkStore, model: &HashMap<ChunkId, Vec<u8>>) {
    for (&id, expected) in model {
        assert_eq!(&store.get(id).unwrap()[..], &expected[..], "payload of {id}");
    }
}

#[test]
fn test_random_workload_matches_model() {
    let store = ChunkStore::open(StoreConfig::for_testing().with_owner(NodeId::new(4))).unwrap();
    let mut model = HashMap::new();
    random_workload(&store, &mut model, 42, 3000);
    verify(&store, &model);

    let report = store.analyze().unwrap();
    assert!(report.is_clean(), "{report}");
    assert_eq!(report.records, model.len() as u64);
    assert!(report.walk_complete);
}

#[test]
fn test_dump_reload_continue() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workload.dump");

    let store = ChunkStore::open(StoreConfig::for_testing().with_owner(NodeId::new(4))).unwrap();
    let mut model = HashMap::new();
    random_workload(&store, &mut model, 7, 1500);
    store.dump(&path).unwrap();

    let reloaded = ChunkStore::load(&path, StoreConfig::for_testing()).unwrap();
    assert_eq!(reloaded.owner(), NodeId::new(4));
    assert_eq!(reloaded.status(), store.status());
    verify(&reloaded, &model);

    // Both stores hand out the same ids from here on.
    assert_eq!(reloaded.create(10).unwrap(), store.create(10).unwrap());

    random_workload(&reloaded, &mut model, 8, 1500);
    let report = reloaded.analyze().unwrap();
    assert!(report.is_clean(), "{report}");
}

#[test]
fn test_offline_analysis_of_dump_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offline.dump");

    let store = ChunkStore::open(StoreConfig::for_testing()).unwrap();
    let mut model = HashMap::new();
    random_workload(&store, &mut model, 99, 800);
    store.dump(&path).unwrap();

    let dump = Dump::read_from(&path).unwrap();
    let (heap, table) = dump.attach().unwrap();
    let report = analyze(&heap, &table).unwrap();
    assert!(report.is_clean(), "{report}");
    assert_eq!(report.records, model.len() as u64);
    assert_eq!(report, store.analyze().unwrap());
}

#[test]
fn test_damaged_dump_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("damaged.dump");

    let store = ChunkStore::open(StoreConfig::for_testing()).unwrap();
    store.create(100).unwrap();
    store.dump(&path).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 10;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let err = ChunkStore::load(&path, StoreConfig::for_testing()).unwrap_err();
    assert!(matches!(err, StoreError::DumpCorrupted { .. }));
}
