//! Store error types.
//!
//! Expected outcomes (missing records, exhausted memory, lock timeouts) and
//! fatal faults (bounds violations, corrupted heap metadata) share one enum;
//! callers tell them apart with [`StoreError::is_fatal`] and
//! [`StoreError::is_retryable`].

use std::fmt;
use std::io;
use thiserror::Error;

use crate::types::ChunkId;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Internal error (bug).
    Internal = 0x0000,
    /// Operation not supported.
    NotSupported = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0002,
    /// Invalid configuration.
    Config = 0x0003,

    // Memory errors (0x0100 - 0x01FF)
    /// No free block large enough.
    NoSpace = 0x0100,
    /// Requested size is zero or exceeds the maximum block size.
    InvalidSize = 0x0101,
    /// Access outside the arena.
    OutOfBounds = 0x0102,
    /// Heap metadata is corrupted.
    Corruption = 0x0103,

    // Index errors (0x0200 - 0x02FF)
    /// Record not found.
    NotFound = 0x0200,
    /// Record is protected against removal.
    NotRemovable = 0x0201,
    /// Record is pinned and cannot move.
    Pinned = 0x0202,
    /// Record id is already in use.
    AlreadyExists = 0x0203,
    /// No more local ids can be minted.
    IdSpaceExhausted = 0x0204,

    // Lock errors (0x0300 - 0x03FF)
    /// Lock acquisition timed out.
    LockTimeout = 0x0300,
    /// Lock release without holding the lock.
    LockNotHeld = 0x0301,

    // Persistence errors (0x0400 - 0x04FF)
    /// General I/O error.
    Io = 0x0400,
    /// Dump file is malformed.
    DumpCorrupted = 0x0401,
    /// Header encoding or decoding failed.
    Encoding = 0x0402,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Memory",
            0x02 => "Index",
            0x03 => "Lock",
            0x04 => "Persistence",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The main error type for ChunkStore.
///
/// # Example
///
/// ```rust
/// use chunkstore_common::error::{StoreError, StoreResult};
/// use chunkstore_common::types::ChunkId;
///
/// fn lookup(id: ChunkId) -> StoreResult<u64> {
///     Err(StoreError::NotFound { id })
/// }
///
/// assert!(lookup(ChunkId::from_raw(1)).unwrap_err().is_not_found());
/// ```
#[derive(Debug, Error)]
pub enum StoreError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Operation not supported.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    // ==========================================================================
    // Memory Errors
    // ==========================================================================
    /// No free block can hold the request.
    #[error("out of memory: no free block for {requested} bytes")]
    NoSpace {
        /// Requested size in bytes.
        requested: u64,
    },

    /// Allocation size is zero or larger than the maximum block size.
    #[error("invalid allocation size {size} (maximum {max})")]
    InvalidSize {
        /// Requested size.
        size: u64,
        /// Maximum block size.
        max: u64,
    },

    /// Access outside of the arena.
    #[error("access of {len} bytes at {address:#x} outside arena of {arena_size} bytes")]
    OutOfBounds {
        /// Start address of the access.
        address: u64,
        /// Length of the access.
        len: u64,
        /// Arena size.
        arena_size: u64,
    },

    /// Heap or table metadata is inconsistent.
    #[error("corruption at {address:#x}: {reason}")]
    Corruption {
        /// Address where the inconsistency was detected.
        address: u64,
        /// Description of the inconsistency.
        reason: String,
    },

    // ==========================================================================
    // Index Errors
    // ==========================================================================
    /// Record does not exist (or was deleted concurrently).
    #[error("record {id} not found")]
    NotFound {
        /// The record id.
        id: ChunkId,
    },

    /// Record carries the not-removable flag.
    #[error("record {id} is protected against removal")]
    NotRemovable {
        /// The record id.
        id: ChunkId,
    },

    /// Record is pinned and its block cannot move.
    #[error("record {id} is pinned")]
    Pinned {
        /// The record id.
        id: ChunkId,
    },

    /// Record id is already in use.
    #[error("record {id} already exists")]
    AlreadyExists {
        /// The record id.
        id: ChunkId,
    },

    /// The 48-bit local id space is used up.
    #[error("local id space exhausted")]
    IdSpaceExhausted,

    // ==========================================================================
    // Lock Errors
    // ==========================================================================
    /// Lock acquisition timed out.
    #[error("lock on record {id} timed out after {waited_ms}ms")]
    LockTimeout {
        /// The record id.
        id: ChunkId,
        /// Time spent waiting in milliseconds.
        waited_ms: u64,
    },

    /// Unlock of a lock that is not held.
    #[error("lock on record {id} is not held")]
    LockNotHeld {
        /// The record id.
        id: ChunkId,
    },

    // ==========================================================================
    // Persistence Errors
    // ==========================================================================
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// Dump file is malformed.
    #[error("dump corrupted: {reason}")]
    DumpCorrupted {
        /// Description of the problem.
        reason: String,
    },

    /// Header encoding or decoding failed.
    #[error("encoding error: {message}")]
    Encoding {
        /// Error message.
        message: String,
    },
}

impl StoreError {
    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a not-supported error.
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(address: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            address,
            reason: reason.into(),
        }
    }

    /// Creates a dump-corrupted error.
    pub fn dump_corrupted(reason: impl Into<String>) -> Self {
        Self::DumpCorrupted {
            reason: reason.into(),
        }
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Returns the error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Config { .. } => ErrorCode::Config,
            Self::NoSpace { .. } => ErrorCode::NoSpace,
            Self::InvalidSize { .. } => ErrorCode::InvalidSize,
            Self::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::NotRemovable { .. } => ErrorCode::NotRemovable,
            Self::Pinned { .. } => ErrorCode::Pinned,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::IdSpaceExhausted => ErrorCode::IdSpaceExhausted,
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::LockNotHeld { .. } => ErrorCode::LockNotHeld,
            Self::Io { .. } => ErrorCode::Io,
            Self::DumpCorrupted { .. } => ErrorCode::DumpCorrupted,
            Self::Encoding { .. } => ErrorCode::Encoding,
        }
    }

    /// Returns true if this error signals memory corruption or a logic bug.
    ///
    /// Continuing after a fatal error risks further damage to the arena.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfBounds { .. } | Self::Corruption { .. } | Self::Internal { .. }
        )
    }

    /// Returns true if this is a transient outcome that can be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoSpace { .. } | Self::LockTimeout { .. })
    }

    /// Returns true if the record does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::NoSpace.as_u16(), 0x0100);
        assert_eq!(ErrorCode::NoSpace.category(), "Memory");
        assert_eq!(ErrorCode::LockTimeout.category(), "Lock");
        assert_eq!(ErrorCode::DumpCorrupted.category(), "Persistence");
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NoSpace { requested: 64 };
        assert_eq!(err.to_string(), "out of memory: no free block for 64 bytes");

        let err = StoreError::NotFound {
            id: ChunkId::from_raw(0x0001_0000_0000_0005),
        };
        assert_eq!(err.to_string(), "record 0x0001000000000005 not found");
    }

    #[test]
    fn test_timeout_is_not_not_found() {
        let id = ChunkId::from_raw(9);
        let timeout = StoreError::LockTimeout { id, waited_ms: 10 };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_not_found());
        assert_eq!(timeout.code(), ErrorCode::LockTimeout);
    }

    #[test]
    fn test_is_fatal() {
        assert!(StoreError::corruption(16, "marker mismatch").is_fatal());
        assert!(StoreError::OutOfBounds {
            address: 10,
            len: 8,
            arena_size: 12
        }
        .is_fatal());
        assert!(!StoreError::NoSpace { requested: 1 }.is_fatal());
        assert!(!StoreError::NotFound {
            id: ChunkId::from_raw(1)
        }
        .is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: StoreError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.code(), ErrorCode::Io);
    }
}
