//! Core type definitions for openraft integration.

use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Node identifier type.
///
/// Derived from the node's raft address, see [`node_id_for`].
pub type NodeId = u64;

/// Type alias for the openraft Raft instance with our configuration.
pub type KiwiRaft = openraft::Raft<TypeConfig>;

/// Type alias for a replicated-log entry.
pub type RaftEntry = openraft::Entry<TypeConfig>;

/// Type alias for log ID.
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for vote.
pub type Vote = openraft::Vote<NodeId>;

/// Type alias for membership - uses NodeId and BasicNode directly.
pub type Membership = openraft::Membership<NodeId, BasicNode>;

/// Type alias for stored membership.
pub type StoredMembership = openraft::StoredMembership<NodeId, BasicNode>;

/// Type alias for snapshot metadata.
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

openraft::declare_raft_types!(
    /// KiwiDB Raft type configuration.
    pub TypeConfig:
        D = ClientRequest,
        R = ClientResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Client request replicated through Raft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// One encoded storage log entry.
    Apply(#[serde(with = "hex_bytes")] Vec<u8>),

    /// No-op for leadership confirmation.
    Noop,
}

/// Response after applying a client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResponse {
    /// Entry written; carries the last storage sequence number.
    Applied { sequence: u64 },

    /// Result of a no-op or configuration entry.
    NoopResult,

    /// Storage failed to apply the entry.
    Error(String),
}

impl ClientResponse {
    /// Create an error response.
    pub fn error(msg: impl Into<String>) -> Self {
        ClientResponse::Error(msg.into())
    }

    /// Check if this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, ClientResponse::Error(_))
    }

    /// Get the error message if this is an error response.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ClientResponse::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Stable node id of the node reachable at `raft_addr`.
pub fn node_id_for(raft_addr: &str) -> NodeId {
    let hash = blake3::hash(raft_addr.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Log payloads travel as hex inside the JSON log and RPC encodings.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
