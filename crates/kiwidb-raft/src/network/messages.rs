//! Raft RPC message types.
//!
//! openraft's request and response types are serde-enabled, so they travel
//! as they are. Snapshots are the exception: they are streamed in chunks
//! that the receiver reassembles.

use openraft::raft::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use serde::{Deserialize, Serialize};

use crate::types::{LogId, NodeId, SnapshotMeta, StoredMembership, TypeConfig, Vote};

/// Raft RPC message wrapper.
///
/// All Raft communication between nodes uses this message format.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Vote request (RequestVote RPC).
    VoteRequest(VoteRequest<NodeId>),
    /// Vote response.
    VoteResponse(VoteResponse<NodeId>),
    /// AppendEntries request.
    AppendEntriesRequest(AppendEntriesRequest<TypeConfig>),
    /// AppendEntries response.
    AppendEntriesResponse(AppendEntriesResponse<NodeId>),
    /// One chunk of a snapshot.
    InstallSnapshotRequest(InstallSnapshotRequest),
    /// InstallSnapshot response.
    InstallSnapshotResponse(InstallSnapshotResponse),
    /// The receiver could not handle the request.
    Error(String),
}

impl RaftMessage {
    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest(_) => "VoteRequest",
            RaftMessage::VoteResponse(_) => "VoteResponse",
            RaftMessage::AppendEntriesRequest(_) => "AppendEntriesRequest",
            RaftMessage::AppendEntriesResponse(_) => "AppendEntriesResponse",
            RaftMessage::InstallSnapshotRequest(_) => "InstallSnapshotRequest",
            RaftMessage::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
            RaftMessage::Error(_) => "Error",
        }
    }
}

/// InstallSnapshot request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The vote of the leader.
    pub vote: Vote,
    /// Snapshot metadata.
    pub meta: NetworkSnapshotMeta,
    /// Byte offset of this chunk.
    pub offset: u64,
    /// Snapshot data chunk.
    #[serde(with = "hex_chunk")]
    pub data: Vec<u8>,
    /// Whether this is the last chunk.
    pub done: bool,
}

impl InstallSnapshotRequest {
    /// Create a new InstallSnapshot request.
    pub fn new(
        vote: Vote,
        meta: NetworkSnapshotMeta,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Self {
        Self {
            vote,
            meta,
            offset,
            data,
            done,
        }
    }
}

/// Snapshot metadata for network transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSnapshotMeta {
    /// Last log ID included in the snapshot.
    pub last_log_id: Option<LogId>,
    /// Membership configuration at snapshot time.
    pub last_membership: StoredMembership,
    /// Unique snapshot identifier.
    pub snapshot_id: String,
}

impl From<&SnapshotMeta> for NetworkSnapshotMeta {
    fn from(meta: &SnapshotMeta) -> Self {
        Self {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        }
    }
}

impl From<NetworkSnapshotMeta> for SnapshotMeta {
    fn from(meta: NetworkSnapshotMeta) -> Self {
        SnapshotMeta {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership,
            snapshot_id: meta.snapshot_id,
        }
    }
}

/// InstallSnapshot response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The vote of the responder.
    pub vote: Vote,
}

impl InstallSnapshotResponse {
    /// Create a new InstallSnapshot response.
    pub fn new(vote: Vote) -> Self {
        Self { vote }
    }
}

mod hex_chunk {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientRequest, Membership, RaftEntry};
    use openraft::{CommittedLeaderId, EntryPayload};
    use std::collections::BTreeSet;

    fn log_id(term: u64, index: u64) -> LogId {
        LogId::new(CommittedLeaderId::new(term, 1), index)
    }

    fn roundtrip(msg: &RaftMessage) -> RaftMessage {
        let json = serde_json::to_vec(msg).unwrap();
        serde_json::from_slice(&json).unwrap()
    }

    #[test]
    fn test_vote_request_serialization() {
        let vote = Vote::new(1, 5);
        let request = VoteRequest::new(vote, Some(log_id(1, 10)));

        match roundtrip(&RaftMessage::VoteRequest(request)) {
            RaftMessage::VoteRequest(req) => {
                assert_eq!(req.vote, vote);
                assert_eq!(req.last_log_id, Some(log_id(1, 10)));
            }
            other => panic!("Expected VoteRequest, got {}", other.kind()),
        }
    }

    #[test]
    fn test_append_entries_carries_payload() {
        let request = AppendEntriesRequest::<TypeConfig> {
            vote: Vote::new(2, 5),
            prev_log_id: Some(log_id(2, 3)),
            entries: vec![RaftEntry {
                log_id: log_id(2, 4),
                payload: EntryPayload::Normal(ClientRequest::Apply(vec![9, 8, 7])),
            }],
            leader_commit: Some(log_id(2, 3)),
        };

        match roundtrip(&RaftMessage::AppendEntriesRequest(request)) {
            RaftMessage::AppendEntriesRequest(req) => {
                assert_eq!(req.entries.len(), 1);
                assert!(matches!(
                    &req.entries[0].payload,
                    EntryPayload::Normal(ClientRequest::Apply(bytes)) if bytes == &vec![9, 8, 7]
                ));
            }
            other => panic!("Expected AppendEntriesRequest, got {}", other.kind()),
        }
    }

    #[test]
    fn test_append_response_keeps_variant() {
        // AppendEntriesResponse is not Clone, so build each case twice.
        let cases = || {
            vec![
                AppendEntriesResponse::Success,
                AppendEntriesResponse::PartialSuccess(Some(log_id(3, 7))),
                AppendEntriesResponse::Conflict,
                AppendEntriesResponse::HigherVote(Vote::new(9, 2)),
            ]
        };
        for (sent, response) in cases().into_iter().zip(cases()) {
            match roundtrip(&RaftMessage::AppendEntriesResponse(sent)) {
                RaftMessage::AppendEntriesResponse(back) => assert_eq!(back, response),
                other => panic!("Expected AppendEntriesResponse, got {}", other.kind()),
            }
        }
    }

    #[test]
    fn test_snapshot_meta_conversion() {
        let membership = Membership::new(vec![BTreeSet::from([1, 2, 3])], None);
        let meta = SnapshotMeta {
            last_log_id: Some(log_id(1, 100)),
            last_membership: StoredMembership::new(None, membership),
            snapshot_id: "snap-100-12345".to_string(),
        };

        let network = NetworkSnapshotMeta::from(&meta);
        assert_eq!(network.snapshot_id, "snap-100-12345");

        let back: SnapshotMeta = network.into();
        assert_eq!(back, meta);
    }
}
