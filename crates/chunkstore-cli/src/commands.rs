//! Subcommand implementations.
//!
//! Each command returns plain data; rendering lives in `formatter`.

use std::path::Path;

use anyhow::{Context, Result};
use chunkstore_common::config::StoreConfig;
use chunkstore_common::types::ChunkIdRange;
use chunkstore_engine::{analyze as analyze_heap, AnalysisReport, ChunkStore, Dump};
use chunkstore_memory::HeapStatus;
use serde::Serialize;
use tracing::info;

/// Summary of a dump header.
#[derive(Debug, Clone, Serialize)]
pub struct DumpInfo {
    pub path: String,
    pub file_bytes: u64,
    pub owner: u16,
    pub arena_size: u64,
    pub max_block_size: u64,
    pub pointer_width: usize,
    pub size_classes: usize,
    pub lid_levels: u32,
    pub next_local_id: u64,
    pub recycler_capacity: usize,
    pub recycler_ring: usize,
    pub recycler_available: u64,
    pub status: HeapStatus,
    pub utilization: f64,
    pub conserved: bool,
}

/// Live id ranges of one ownership class.
#[derive(Debug, Clone, Serialize)]
pub struct RangeListing {
    pub owner: u16,
    pub migrated: bool,
    pub ids: u64,
    pub ranges: Vec<ChunkIdRange>,
}

fn read_dump(path: &Path) -> Result<Dump> {
    Dump::read_from(path).with_context(|| format!("failed to read dump {}", path.display()))
}

/// Runs the consistency analyzer over a dump.
pub fn analyze(path: &Path) -> Result<AnalysisReport> {
    info!("Analyzing dump: {}", path.display());
    let dump = read_dump(path)?;
    let (heap, table) = dump
        .attach()
        .context("dump header does not describe its image")?;
    Ok(analyze_heap(&heap, &table)?)
}

pub fn info(path: &Path) -> Result<DumpInfo> {
    let file_bytes = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let dump = read_dump(path)?;
    let header = dump.header();

    Ok(DumpInfo {
        path: path.display().to_string(),
        file_bytes,
        owner: header.owner.as_u16(),
        arena_size: header.heap.arena_size,
        max_block_size: header.heap.max_block_size,
        pointer_width: header.heap.pointer_width,
        size_classes: header.heap.class_bounds.len(),
        lid_levels: header.table.lid_levels,
        next_local_id: header.next_local_id,
        recycler_capacity: header.recycler_capacity,
        recycler_ring: header.recycler_ring.len(),
        recycler_available: header.recycler_available,
        status: header.status,
        utilization: header.status.utilization(),
        conserved: header.status.is_conserved(),
    })
}

/// Rebuilds the store held in a dump and lists its ranges.
pub fn ranges(path: &Path, migrated: bool, config: Option<&Path>) -> Result<RangeListing> {
    let config = match config {
        Some(file) => StoreConfig::from_file(file)
            .with_context(|| format!("failed to load config {}", file.display()))?,
        None => StoreConfig::default(),
    };
    let dump = read_dump(path)?;
    let store = ChunkStore::restore(&dump, config).context("failed to restore store")?;

    let ranges = if migrated {
        store.migrated_ranges()?
    } else {
        store.local_ranges()?
    };
    Ok(RangeListing {
        owner: store.owner().as_u16(),
        migrated,
        ids: ranges.iter().map(ChunkIdRange::len).sum(),
        ranges,
    })
}

/// Writes a configuration file with every setting spelled out.
pub fn init_config(path: &Path, testing: bool) -> Result<()> {
    let config = if testing {
        StoreConfig::for_testing()
    } else {
        StoreConfig::default()
    };
    config
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}
