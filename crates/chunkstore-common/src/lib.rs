//! # chunkstore-common
//!
//! Common types, errors, and utilities for ChunkStore.
//!
//! This crate provides the foundational types shared by the allocator, the
//! translation table and the record store:
//!
//! - **Types**: Record identifiers (`ChunkId`, `NodeId`) and id ranges
//! - **Errors**: Unified error handling with `StoreError`
//! - **Config**: Store configuration (`StoreConfig`)
//! - **Sync**: Backoff strategies and lock timeouts for spin loops
//! - **Constants**: System-wide constants and limits
//!
//! ## Example
//!
//! ```rust
//! use chunkstore_common::types::{ChunkId, NodeId};
//! use chunkstore_common::error::StoreResult;
//!
//! fn example() -> StoreResult<()> {
//!     let id = ChunkId::new(NodeId::new(1), 5);
//!     assert_eq!(id.as_u64(), 0x0001_0000_0000_0005);
//!     assert_eq!(id.local_id(), 5);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod sync;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::StoreConfig;
pub use constants::*;
pub use error::{ErrorCode, StoreError, StoreResult};
pub use sync::{Backoff, Deadline, LockTimeout};
pub use types::{ChunkId, ChunkIdRange, NodeId};
