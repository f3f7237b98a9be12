//! NNG-based Raft network transport.

use std::future::Future;
use std::time::Duration;

use nng::options::{Options, RecvTimeout, SendTimeout};
use nng::{Protocol, Socket};
use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, ReplicationClosed,
    StreamingError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotResponse as OpenraftSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::BasicNode;

use crate::error::RaftError as KiwiRaftError;
use crate::network::messages::{InstallSnapshotRequest, NetworkSnapshotMeta, RaftMessage};
use crate::types::{NodeId, TypeConfig, Vote};

/// Size of one streamed snapshot chunk.
const SNAPSHOT_CHUNK_SIZE: usize = 1024 * 1024;

/// NNG-based Raft network transport.
///
/// This implements openraft's `RaftNetwork` trait using NNG sockets
/// for communication between cluster nodes.
pub struct NngRaftNetwork {
    /// Target node information.
    target: BasicNode,
    /// Target node ID.
    pub target_id: NodeId,
    /// Request timeout.
    timeout: Duration,
}

impl NngRaftNetwork {
    /// Create a new NNG network connection to the target node.
    pub fn new(target_id: NodeId, target: BasicNode) -> Self {
        Self {
            target,
            target_id,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the target's Raft address.
    fn raft_addr(&self) -> String {
        format!("tcp://{}", self.target.addr)
    }

    /// Send a message and receive response synchronously.
    fn send_message_sync(
        addr: &str,
        timeout: Duration,
        msg: &RaftMessage,
    ) -> Result<RaftMessage, KiwiRaftError> {
        let socket = Socket::new(Protocol::Req0)
            .map_err(|e| KiwiRaftError::Network(format!("Failed to create socket: {}", e)))?;

        socket
            .set_opt::<SendTimeout>(Some(timeout))
            .map_err(|e| KiwiRaftError::Network(format!("Failed to set send timeout: {}", e)))?;
        socket
            .set_opt::<RecvTimeout>(Some(timeout))
            .map_err(|e| KiwiRaftError::Network(format!("Failed to set recv timeout: {}", e)))?;

        socket
            .dial(addr)
            .map_err(|e| KiwiRaftError::Network(format!("Failed to connect to {}: {}", addr, e)))?;

        let payload =
            serde_json::to_vec(msg).map_err(|e| KiwiRaftError::Serialization(e.to_string()))?;

        socket
            .send(nng::Message::from(payload.as_slice()))
            .map_err(|(_, e)| KiwiRaftError::Network(format!("Send failed: {}", e)))?;

        let response = socket
            .recv()
            .map_err(|e| KiwiRaftError::Network(format!("Recv failed: {}", e)))?;

        serde_json::from_slice(response.as_slice())
            .map_err(|e| KiwiRaftError::Serialization(e.to_string()))
    }

    /// Send a message on the blocking pool.
    async fn send_message(&self, msg: RaftMessage) -> Result<RaftMessage, KiwiRaftError> {
        let addr = self.raft_addr();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || Self::send_message_sync(&addr, timeout, &msg))
            .await
            .map_err(|e| KiwiRaftError::Network(format!("Task join failed: {}", e)))?
    }

    /// Send one snapshot chunk and return the receiver's vote.
    async fn send_chunk(&self, request: InstallSnapshotRequest) -> Result<Vote, ChunkError> {
        match self.send_message(RaftMessage::InstallSnapshotRequest(request)).await {
            Ok(RaftMessage::InstallSnapshotResponse(resp)) => Ok(resp.vote),
            Ok(other) => Err(ChunkError::Rejected(unexpected(&other))),
            Err(e) => Err(ChunkError::Unreachable(e)),
        }
    }
}

enum ChunkError {
    Rejected(NetworkError),
    Unreachable(KiwiRaftError),
}

/// Error for a reply of the wrong kind, or a remote failure.
fn unexpected(msg: &RaftMessage) -> NetworkError {
    let text = match msg {
        RaftMessage::Error(e) => format!("remote error: {e}"),
        other => format!("unexpected response type {}", other.kind()),
    };
    NetworkError::new(&std::io::Error::new(std::io::ErrorKind::InvalidData, text))
}

impl RaftNetwork<TypeConfig> for NngRaftNetwork {
    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.send_message(RaftMessage::VoteRequest(rpc)).await {
            Ok(RaftMessage::VoteResponse(resp)) => Ok(resp),
            Ok(other) => Err(RPCError::Network(unexpected(&other))),
            Err(e) => {
                tracing::warn!(target = self.target_id, error = %e, "vote RPC failed");
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
        }
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.send_message(RaftMessage::AppendEntriesRequest(rpc)).await {
            Ok(RaftMessage::AppendEntriesResponse(resp)) => Ok(resp),
            Ok(other) => Err(RPCError::Network(unexpected(&other))),
            Err(e) => {
                tracing::debug!(target = self.target_id, error = %e, "append entries RPC failed");
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: openraft::raft::InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        OpenraftSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let request = InstallSnapshotRequest::new(
            rpc.vote,
            NetworkSnapshotMeta::from(&rpc.meta),
            rpc.offset,
            rpc.data,
            rpc.done,
        );

        match self.send_chunk(request).await {
            Ok(vote) => Ok(OpenraftSnapshotResponse { vote }),
            Err(ChunkError::Rejected(e)) => Err(RPCError::Network(e)),
            Err(ChunkError::Unreachable(e)) => {
                tracing::warn!(target = self.target_id, error = %e, "install snapshot RPC failed");
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
        }
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let meta = NetworkSnapshotMeta::from(&snapshot.meta);
        let data = snapshot.snapshot.into_inner();
        let total = data.len();

        tracing::info!(
            target = self.target_id,
            snapshot_id = %meta.snapshot_id,
            bytes = total,
            "streaming snapshot"
        );

        let mut offset = 0usize;
        loop {
            let end = (offset + SNAPSHOT_CHUNK_SIZE).min(total);
            let done = end == total;
            let request = InstallSnapshotRequest::new(
                vote,
                meta.clone(),
                offset as u64,
                data[offset..end].to_vec(),
                done,
            );

            let remote_vote = match self.send_chunk(request).await {
                Ok(remote_vote) => remote_vote,
                Err(ChunkError::Rejected(e)) => return Err(StreamingError::Network(e)),
                Err(ChunkError::Unreachable(e)) => {
                    tracing::warn!(target = self.target_id, error = %e, "snapshot chunk failed");
                    return Err(StreamingError::Unreachable(Unreachable::new(&e)));
                }
            };

            if done {
                return Ok(SnapshotResponse { vote: remote_vote });
            }
            offset = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raft_addr() {
        let network = NngRaftNetwork::new(
            1,
            BasicNode {
                addr: "192.168.1.10:9231".to_string(),
            },
        );
        assert_eq!(network.raft_addr(), "tcp://192.168.1.10:9231");
    }

    #[test]
    fn test_timeout_configuration() {
        let network = NngRaftNetwork::new(
            1,
            BasicNode {
                addr: "localhost:9231".to_string(),
            },
        )
        .with_timeout(Duration::from_secs(10));

        assert_eq!(network.timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let mut network = NngRaftNetwork::new(
            1,
            BasicNode {
                addr: "127.0.0.1:1".to_string(),
            },
        )
        .with_timeout(Duration::from_millis(200));

        let rpc = VoteRequest::new(Vote::new(1, 2), None);
        let result = network
            .vote(rpc, RPCOption::new(Duration::from_millis(200)))
            .await;
        assert!(matches!(result, Err(RPCError::Unreachable(_))));
    }
}
