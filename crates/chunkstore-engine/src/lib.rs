//! # chunkstore-engine
//!
//! The record store of ChunkStore.
//!
//! [`ChunkStore`] ties the arena, heap, translation table, id recycler and
//! record locks together behind record-level operations:
//!
//! - **Records**: create, read, write, resize and remove variable-sized
//!   records addressed by 64-bit [`ChunkId`]s
//! - **Locks**: explicit per-record read/write locks with timeouts
//! - **Objects**: typed access through the [`Encode`]/[`Decode`] traits
//! - **Diagnostics**: arena dumps and an offline consistency analyzer
//!
//! # Example
//!
//! ```rust
//! use chunkstore_common::config::StoreConfig;
//! use chunkstore_engine::ChunkStore;
//!
//! let store = ChunkStore::open(StoreConfig::for_testing()).unwrap();
//! let id = store.create(5).unwrap();
//! store.put(id, b"hello").unwrap();
//! assert_eq!(&store.get(id).unwrap()[..], b"hello");
//! store.remove(id).unwrap();
//! assert!(!store.exists(id).unwrap());
//! ```
//!
//! [`ChunkId`]: chunkstore_common::types::ChunkId

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Offline consistency checks
pub mod analyzer;

/// Arena dump file format
pub mod dump;

/// Typed record encoding
pub mod serializer;

/// Store statistics
pub mod stats;

/// The record store
pub mod store;

pub use analyzer::{analyze, AnalysisReport, Issue};
pub use dump::{Dump, DumpHeader};
pub use serializer::{Decode, Encode, RecordReader, RecordWriter};
pub use stats::{StoreStats, StoreStatsSnapshot};
pub use store::{ChunkStore, RecordMut, RecordRef};
