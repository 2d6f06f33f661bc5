//! # chunkstore-memory
//!
//! Memory management for ChunkStore.
//!
//! This crate implements the bottom layers of the store:
//!
//! - **Arena**: byte-addressable backing storage with word-atomic access
//! - **Entry**: the packed 64-bit descriptor of a record (address, length,
//!   lock bits, protection flags)
//! - **Heap**: a segregated free-list allocator with boundary-tag
//!   coalescing that hands out entries
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chunkstore_memory::{Heap, HeapArena};
//!
//! let arena = Arc::new(HeapArena::new(1024 * 1024));
//! let mut heap = Heap::new(arena, 64 * 1024).unwrap();
//!
//! let entry = heap.malloc(100).unwrap();
//! assert_eq!(heap.payload_len(entry).unwrap(), 100);
//! heap.free(entry).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Backing storage
pub mod arena;

/// Packed index entries
pub mod entry;

/// Segregated free-list allocator
pub mod heap;

pub use arena::{Address, Arena, HeapArena};
pub use entry::{Entry, LengthLayout};
pub use heap::{Heap, HeapLayout, HeapStatus};
