use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the cache engine.
///
/// Corruption detected while restoring individual blocks is reported per
/// block so the caller can count occurrences and decide whether to abort
/// the mount. Contract violations (using an unbound request context,
/// double-binding a buffer) are programming errors and panic instead of
/// returning a variant here.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A read or write against the cache device failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A bounded buffer pool is exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// The caller passed an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Neither superblock copy validated, or the surviving copy is
    /// inconsistent with the opened device. Fatal to the mount.
    #[error("header corrupt: {0}")]
    HeaderCorrupt(&'static str),
    /// A block's metadata record is structurally bad.
    #[error("corrupt metadata for block {block_id}: {reason}")]
    CorruptMetadata {
        /// Slot that failed validation.
        block_id: u32,
        /// What failed.
        reason: &'static str,
    },
    /// A block's metadata record hashes to a different value than stored.
    #[error("metadata hash mismatch for block {block_id}")]
    HashCorruptMetadata {
        /// Slot that failed validation.
        block_id: u32,
    },
    /// A block's data page hashes to a different value than its metadata
    /// records.
    #[error("data hash mismatch for block {block_id}")]
    HashCorruptData {
        /// Slot that failed validation.
        block_id: u32,
    },
}

impl CacheError {
    /// Error reported by every engine call once the engine has entered the
    /// fail-all state.
    pub(crate) fn fail_all() -> Self {
        CacheError::Io(io::Error::new(
            io::ErrorKind::Other,
            "engine is failing all requests",
        ))
    }

    /// Error reported for operations submitted after provider teardown.
    pub(crate) fn stopped() -> Self {
        CacheError::Io(io::Error::new(
            io::ErrorKind::Other,
            "provider submission queue stopped",
        ))
    }
}
