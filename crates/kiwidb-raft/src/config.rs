//! Configuration types for the Raft node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::RaftError;
use crate::types::{node_id_for, NodeId};

/// Distance between a node's client port and its raft port.
pub const RAFT_PORT_OFFSET: u16 = 10;

/// Length of a group id.
pub const GROUP_ID_LEN: usize = 32;

/// Configuration for a Raft node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Address this node listens on for Raft RPCs.
    pub raft_listen_addr: String,

    /// Address other nodes use to reach this node; also its identity.
    pub raft_advertise_addr: String,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds.
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    pub election_timeout_max_ms: u64,

    /// Number of log entries between snapshots.
    pub snapshot_threshold: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,

    /// Timeout of a single Raft RPC in milliseconds.
    pub rpc_timeout_ms: u64,

    /// Raft root directory (`<data>/raft`).
    pub data_dir: PathBuf,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            raft_listen_addr: "0.0.0.0:9231".to_string(),
            raft_advertise_addr: "127.0.0.1:9231".to_string(),
            heartbeat_interval_ms: 150,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 500,
            snapshot_threshold: 10000,
            max_entries_per_append: 100,
            rpc_timeout_ms: 5000,
            data_dir: PathBuf::from("./kiwidb_data/raft"),
        }
    }
}

impl RaftConfig {
    /// Configuration for a node whose clients connect to `host:client_port`.
    pub fn for_client_endpoint(listen_host: &str, advertise_host: &str, client_port: u16) -> Self {
        let raft_port = client_port.saturating_add(RAFT_PORT_OFFSET);
        Self {
            raft_listen_addr: format!("{listen_host}:{raft_port}"),
            raft_advertise_addr: format!("{advertise_host}:{raft_port}"),
            ..Default::default()
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        node_id_for(&self.raft_advertise_addr)
    }

    /// Set the Raft listen address.
    pub fn with_raft_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_listen_addr = addr.into();
        self
    }

    /// Set the Raft advertise address.
    pub fn with_raft_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_advertise_addr = addr.into();
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set the election timeout range.
    pub fn with_election_timeout_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set the snapshot threshold.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Directory of the replicated log.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    /// Directory of the state-machine metadata and group identity.
    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("raft_meta")
    }

    /// Directory of snapshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshot")
    }

    /// Build the validated openraft configuration.
    pub fn to_openraft(&self) -> Result<Arc<openraft::Config>, RaftError> {
        let config = openraft::Config {
            cluster_name: "kiwidb".to_string(),
            heartbeat_interval: self.heartbeat_interval_ms,
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            max_payload_entries: self.max_entries_per_append,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
        .validate()
        .map_err(|e| RaftError::Initialization(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

/// Raft address of the node serving clients at `client_addr`.
pub fn raft_address_of(client_addr: &str) -> Option<String> {
    shift_port(client_addr, i32::from(RAFT_PORT_OFFSET))
}

/// Client address of the node whose raft address is `raft_addr`.
pub fn client_address_of(raft_addr: &str) -> Option<String> {
    shift_port(raft_addr, -i32::from(RAFT_PORT_OFFSET))
}

fn shift_port(addr: &str, delta: i32) -> Option<String> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let shifted = u16::try_from(i32::from(port) + delta).ok()?;
    Some(format!("{host}:{shifted}"))
}

/// Check that `group_id` has the required length.
pub fn validate_group_id(group_id: &str) -> Result<(), RaftError> {
    if group_id.chars().count() == GROUP_ID_LEN {
        Ok(())
    } else {
        Err(RaftError::InvalidGroupId(group_id.to_string()))
    }
}

/// Fresh random group id of 32 hex characters.
pub fn generate_group_id() -> String {
    hex::encode(rand::random::<[u8; GROUP_ID_LEN / 2]>())
}
