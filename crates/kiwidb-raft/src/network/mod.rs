//! Network transport implementations for Raft.
//!
//! This module provides:
//! - [`NngRaftNetwork`] - Network client for sending Raft RPCs
//! - [`NngNetworkFactory`] - Factory for creating network connections
//! - [`RaftTransport`] - Server for receiving Raft RPCs
//! - Raft message types for wire protocol

pub mod factory;
pub mod messages;
pub mod server;
pub mod transport;

pub use factory::NngNetworkFactory;
pub use messages::RaftMessage;
pub use server::{spawn_transport, RaftTransport};
pub use transport::NngRaftNetwork;
