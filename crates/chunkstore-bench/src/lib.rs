//! ChunkStore benchmarks
//!
//! This crate contains benchmarks for:
//! - The heap allocator (malloc/free churn, multi-allocation)
//! - Translation table lookups
//! - Record store create/get/put paths, single and multi-threaded
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p chunkstore-bench
//! ```

pub mod utils;
