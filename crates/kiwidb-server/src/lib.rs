//! KiwiDB Server library.
//!
//! A Redis-protocol server over sharded storage. In replicated mode every
//! write batch is committed through a Raft group; the `RAFT.CLUSTER` and
//! `RAFT.NODE` commands form, grow and shrink that group.

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod handler;
pub mod info;
pub mod instance;
pub mod server;

pub use client::PeerConnection;
pub use cluster::{
    ClusterMembershipCoordinator, ClusterMembershipRequest, CoordinatorError, DataLayout,
    JoinLimits, RequestKind,
};
pub use config::{Args, ServerConfig};
pub use error::{Error, Result};
pub use handler::{parse_command, Command, RequestHandler};
pub use instance::ServerInstance;
pub use server::RespServer;
