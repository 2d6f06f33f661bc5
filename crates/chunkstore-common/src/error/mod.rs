//! Error handling for ChunkStore.
//!
//! This module provides a unified error type and result alias used
//! across all ChunkStore components.

mod store;

pub use store::{ErrorCode, StoreError};

/// Result type alias for ChunkStore operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
