//! System-wide constants for ChunkStore.
//!
//! This module defines the identifier layout and the default limits used
//! when no explicit configuration is given.

// =============================================================================
// Identifier Layout
// =============================================================================

/// Number of high-order bits of a record id that name the owning node.
pub const OWNER_BITS: u32 = 16;

/// Number of low-order bits of a record id holding the local id.
pub const LOCAL_ID_BITS: u32 = 48;

/// Mask selecting the local id from a record id.
pub const LOCAL_ID_MASK: u64 = (1 << LOCAL_ID_BITS) - 1;

/// Largest local id that can be minted.
pub const MAX_LOCAL_ID: u64 = LOCAL_ID_MASK;

/// Number of slots in the owner-level root table.
pub const OWNER_TABLE_ENTRIES: u64 = 1 << OWNER_BITS;

/// Local-id level counts that split 48 bits into equal groups of a
/// reasonable table size.
pub const SUPPORTED_LID_LEVELS: [u32; 4] = [3, 4, 6, 8];

/// Default number of translation levels below the owner table.
///
/// Four levels of 12 bits each give 4096-slot (32 KB) tables.
pub const DEFAULT_LID_LEVELS: u32 = 4;

// =============================================================================
// Arena Limits
// =============================================================================

/// Smallest arena the store accepts (1 MB).
///
/// The owner-level root table alone occupies 512 KB.
pub const MIN_ARENA_SIZE: u64 = 1024 * 1024;

/// Arena addresses must fit into the 43-bit address field of an entry.
pub const MAX_ARENA_SIZE: u64 = 1 << 43;

/// Default arena size (64 MB).
pub const DEFAULT_ARENA_SIZE: u64 = 64 * 1024 * 1024;

/// Default maximum size of a single allocation (16 MB).
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// Largest block size the entry length encoding can describe (1 TB).
pub const MAX_BLOCK_SIZE_LIMIT: u64 = 1 << 40;

// =============================================================================
// Recycling and Locking
// =============================================================================

/// Default capacity of the id recycler ring.
pub const DEFAULT_RECYCLER_CAPACITY: usize = 64 * 1024;

/// Default lock acquisition timeout in milliseconds.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1000;

/// Number of slots in the per-thread leaf table cache.
pub const LEAF_CACHE_SLOTS: usize = 64;
