//! Consensus node lifecycle.
//!
//! This module provides:
//! - [`ConsensusNode`] - Initialization, peer changes and log submission
//! - [`StateMachineEvents`] - Lifecycle callbacks driven by Raft metrics

pub mod events;
pub mod node;

pub use events::{spawn_role_watcher, RoleObserver, StateMachineEvents};
pub use node::{ConsensusNode, NodeInfo};
