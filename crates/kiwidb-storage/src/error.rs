//! Storage error types.

use thiserror::Error;

/// Errors produced by the storage layer and the replicated write path.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying sled error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A batch encoded larger than the configured entry limit.
    #[error("log entry too large: {size} bytes exceeds limit of {limit} bytes")]
    EntryTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The replicated commit did not complete in time. The entry may still commit.
    #[error("incomplete: write not confirmed within {0:?}")]
    Timeout(std::time::Duration),

    /// The consensus node has not been initialized.
    #[error("consensus node not initialized")]
    NotInitialized,

    /// This node is not the leader; carries the leader's client address if known.
    #[error("wrong leader {0}")]
    WrongLeader(String),

    /// The consensus layer refused or dropped the submission.
    #[error("submit failed: {0}")]
    SubmitFailed(String),

    /// Applying a committed entry to storage failed.
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// Shard index out of range.
    #[error("no such shard: {0}")]
    NoSuchShard(usize),

    /// The apply queue or storage has been shut down.
    #[error("storage closed")]
    Closed,
}

impl Error {
    /// Whether the outcome of the operation is unknown rather than failed.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
