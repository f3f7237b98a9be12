//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] kiwidb_storage::Error),

    /// Consensus error.
    #[error("raft error: {0}")]
    Raft(#[from] kiwidb_raft::RaftError),

    /// Malformed or unexpected RESP traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task failed.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis_protocol::error::RedisProtocolError> for Error {
    fn from(err: redis_protocol::error::RedisProtocolError) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// Result alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;
