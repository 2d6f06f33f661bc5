//! # chunkstore-index
//!
//! Record id translation for ChunkStore.
//!
//! - **Table**: a fixed-depth radix trie mapping 64-bit record ids to entry
//!   slots inside the arena, with a per-thread leaf cache
//! - **Recycler**: a bounded pool of reusable local ids, refilled by
//!   sweeping zombie slots out of the table
//! - **Lock**: reader/writer exclusion implemented with CAS directly on the
//!   entry bits of a slot
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chunkstore_common::types::{ChunkId, NodeId};
//! use chunkstore_index::TranslationTable;
//! use chunkstore_memory::{Heap, HeapArena};
//!
//! let arena = Arc::new(HeapArena::new(4 * 1024 * 1024));
//! let mut heap = Heap::new(Arc::clone(&arena), 64 * 1024).unwrap();
//! let table = TranslationTable::create(&mut heap, 4, true).unwrap();
//!
//! let id = ChunkId::new(NodeId::new(1), 42);
//! assert!(table.translate(id).unwrap().is_none());
//! let slot = table.translate_or_create(id, &mut heap).unwrap();
//! assert_eq!(table.translate(id).unwrap(), Some(slot));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Per-record lock protocol
pub mod lock;

/// Local id recycling
pub mod recycler;

/// Multi-level translation table
pub mod table;

pub use lock::{LockProtocol, LockResult, LockStats};
pub use recycler::IdRecycler;
pub use table::{Ownership, TableLayout, TableScan, TranslationTable};
