//! KiwiDB Raft - replicated write path for KiwiDB using openraft.
//!
//! A [`ConsensusNode`] owns one openraft instance. Replicated write batches
//! reach it through the storage crate's `LogSubmitter` seam; committed
//! entries flow back into the storage apply queue in log order.
//!
//! # Architecture
//!
//! The crate implements openraft's traits:
//! - [`SledRaftLogStorage`] - Persistent log storage using sled
//! - [`KiwiStateMachine`] - State machine feeding the storage apply queue
//! - [`NngRaftNetwork`] - Network transport using NNG
//!
//! # Usage
//!
//! ```ignore
//! use kiwidb_raft::{ConsensusNode, RaftConfig, generate_group_id};
//!
//! let config = RaftConfig::for_client_endpoint("0.0.0.0", "10.0.0.1", 9221)
//!     .with_data_dir("./data/raft");
//! let node = ConsensusNode::new(config, storage.clone());
//!
//! // Form a new group on the first node.
//! node.initialize(&generate_group_id(), true).await?;
//!
//! // On the leader, admit another node by its raft address.
//! node.add_peer("10.0.0.2:9231").await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod storage;
pub mod types;

pub use cluster::{ConsensusNode, NodeInfo, StateMachineEvents};
pub use config::{
    client_address_of, generate_group_id, raft_address_of, validate_group_id, RaftConfig,
    GROUP_ID_LEN, RAFT_PORT_OFFSET,
};
pub use error::RaftError;
pub use network::NngRaftNetwork;
pub use storage::{KiwiStateMachine, SledRaftLogStorage};
pub use types::{node_id_for, ClientRequest, ClientResponse, NodeId, TypeConfig};

pub use openraft::{BasicNode, Raft, RaftMetrics};
