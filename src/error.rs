//! Error taxonomy shared by every layer of the storage core.

use std::io;
use thiserror::Error;

use crate::types::RecordId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the storage core.
///
/// Fatal classes (`Io`, `CorruptPointer`, `Corruption`) are never retried by
/// this crate. `VersionConflict` is the one retryable class; retrying is the
/// caller's responsibility.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Page-level I/O failure. Fatal; propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A collection pointer resolved to missing or invalid pages.
    #[error("corrupt collection pointer: file {file_id}, root page {root_index}")]
    CorruptPointer {
        /// File component of the failing pointer.
        file_id: i64,
        /// Root page component of the failing pointer.
        root_index: i64,
    },
    /// Commit-time optimistic check failed for a record.
    #[error("version conflict on {rid}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The contended record.
        rid: RecordId,
        /// Version the transaction loaded.
        expected: i32,
        /// Version currently persisted.
        actual: i32,
    },
    /// A PUT replayed at commit would duplicate a key in a unique index.
    #[error("uniqueness violation on index '{index}'")]
    UniquenessViolation {
        /// Name of the violated index.
        index: String,
    },
    /// A key did not match the structural shape the index definition declares.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(&'static str),
    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// On-disk state failed a structural validation.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// The caller misused the API.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// `true` for errors a caller may retry after reloading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}
