//! Error types for kiwidb-raft.

use thiserror::Error;

/// Errors that can occur in the Raft subsystem.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The consensus node has not been initialized.
    #[error("Raft node not initialized")]
    NotInitialized,

    /// The consensus node is already running.
    #[error("Raft node already initialized")]
    AlreadyInitialized,

    /// Group id is not a 32-character identifier.
    #[error("invalid group id {0:?}: must be 32 characters")]
    InvalidGroupId(String),

    /// Error during Raft initialization.
    #[error("Raft initialization failed: {0}")]
    Initialization(String),

    /// Error during storage operations.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error during network operations.
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during write operations.
    #[error("Write error: {0}")]
    Write(String),

    /// Error during membership changes.
    #[error("Membership change error: {0}")]
    MembershipChange(String),

    /// No leader available for write operations.
    #[error("No leader available")]
    NoLeader,

    /// This node is not the leader; carries the leader's client address.
    #[error("wrong leader {0}")]
    WrongLeader(String),

    /// Error during snapshot operations.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Error during shutdown.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sled::Error> for RaftError {
    fn from(err: sled::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<kiwidb_storage::Error> for RaftError {
    fn from(err: kiwidb_storage::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}
