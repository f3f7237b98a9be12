//! Storage implementations for Raft.
//!
//! This module provides:
//! - [`SledRaftLogStorage`] - Persistent log storage using sled
//! - [`KiwiStateMachine`] - State machine feeding the storage apply queue
//! - Snapshot support for efficient state transfer

pub mod log_storage;
pub mod snapshot;
pub mod state_machine;

pub use log_storage::SledRaftLogStorage;
pub use snapshot::SnapshotBuilder;
pub use state_machine::KiwiStateMachine;
