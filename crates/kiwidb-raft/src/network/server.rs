//! Raft RPC server for handling incoming requests.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use nng::options::{Options, RecvTimeout};
use nng::{Protocol, Socket};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::network::messages::{InstallSnapshotRequest, InstallSnapshotResponse, RaftMessage};
use crate::types::{KiwiRaft, NodeId, SnapshotMeta};

/// How often the receive loop wakes up to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Raft RPC server that handles incoming Raft protocol messages.
///
/// This server listens on an NNG REP socket and dispatches incoming
/// Raft RPCs to the local Raft instance.
pub struct RaftTransport {
    /// This node's ID.
    node_id: NodeId,
    /// Listen address.
    listen_addr: String,
    /// The Raft instance to dispatch to.
    raft: Arc<KiwiRaft>,
    /// Snapshot being received.
    incoming: Option<IncomingSnapshot>,
}

/// Chunks of a snapshot received so far.
struct IncomingSnapshot {
    snapshot_id: String,
    data: Vec<u8>,
}

impl RaftTransport {
    /// Create a new Raft transport server.
    pub fn new(node_id: NodeId, listen_addr: impl Into<String>, raft: Arc<KiwiRaft>) -> Self {
        Self {
            node_id,
            listen_addr: listen_addr.into(),
            raft,
            incoming: None,
        }
    }

    /// Bind the listening socket.
    pub fn bind(&self) -> Result<Socket, RaftError> {
        let socket = Socket::new(Protocol::Rep0)
            .map_err(|e| RaftError::Network(format!("Failed to create socket: {}", e)))?;
        socket
            .set_opt::<RecvTimeout>(Some(POLL_INTERVAL))
            .map_err(|e| RaftError::Network(format!("Failed to set recv timeout: {}", e)))?;

        let addr = format!("tcp://{}", self.listen_addr);
        socket
            .listen(&addr)
            .map_err(|e| RaftError::Network(format!("Failed to listen on {}: {}", addr, e)))?;
        Ok(socket)
    }

    /// Run the transport server on `socket`.
    ///
    /// This blocks the calling thread; async Raft calls are driven through
    /// `runtime`. Use [`spawn_transport`] for async usage.
    pub fn run_sync(
        mut self,
        socket: Socket,
        runtime: Handle,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), RaftError> {
        tracing::info!(
            node_id = self.node_id,
            addr = %self.listen_addr,
            "raft transport started"
        );

        loop {
            match shutdown_rx.try_recv() {
                Ok(_) | Err(oneshot::error::TryRecvError::Closed) => {
                    tracing::info!(node_id = self.node_id, "raft transport shutting down");
                    break;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            let request = match socket.recv() {
                Ok(msg) => msg,
                Err(nng::Error::TimedOut) => continue,
                Err(nng::Error::Closed) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to receive raft message");
                    continue;
                }
            };

            let response = match serde_json::from_slice::<RaftMessage>(request.as_slice()) {
                Ok(msg) => runtime.block_on(self.handle_message(msg)),
                Err(e) => {
                    tracing::error!(error = %e, "failed to parse raft message");
                    RaftMessage::Error(format!("malformed message: {e}"))
                }
            };

            let response_bytes = match serde_json::to_vec(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize raft response");
                    continue;
                }
            };

            if let Err((_, e)) = socket.send(nng::Message::from(response_bytes.as_slice())) {
                tracing::error!(error = %e, "failed to send raft response");
            }
        }

        Ok(())
    }

    /// Handle a Raft message and return the response.
    async fn handle_message(&mut self, msg: RaftMessage) -> RaftMessage {
        match msg {
            RaftMessage::VoteRequest(req) => match self.raft.vote(req).await {
                Ok(resp) => RaftMessage::VoteResponse(resp),
                Err(e) => {
                    tracing::error!(error = %e, "vote request failed");
                    RaftMessage::Error(e.to_string())
                }
            },
            RaftMessage::AppendEntriesRequest(req) => match self.raft.append_entries(req).await {
                Ok(resp) => RaftMessage::AppendEntriesResponse(resp),
                Err(e) => {
                    tracing::error!(error = %e, "append entries request failed");
                    RaftMessage::Error(e.to_string())
                }
            },
            RaftMessage::InstallSnapshotRequest(req) => self.handle_snapshot_chunk(req).await,
            other => {
                tracing::warn!(kind = other.kind(), "unexpected raft message");
                RaftMessage::Error(format!("unexpected message {}", other.kind()))
            }
        }
    }

    /// Buffer a snapshot chunk; install the snapshot once the last one arrives.
    async fn handle_snapshot_chunk(&mut self, req: InstallSnapshotRequest) -> RaftMessage {
        tracing::debug!(
            snapshot_id = %req.meta.snapshot_id,
            offset = req.offset,
            size = req.data.len(),
            done = req.done,
            "received snapshot chunk"
        );

        if let Err(message) = accept_chunk(&mut self.incoming, &req) {
            tracing::warn!(snapshot_id = %req.meta.snapshot_id, %message, "rejected snapshot chunk");
            return RaftMessage::Error(message);
        }

        if !req.done {
            let vote = self.raft.metrics().borrow().vote;
            return RaftMessage::InstallSnapshotResponse(InstallSnapshotResponse::new(vote));
        }

        let data = self.incoming.take().map(|s| s.data).unwrap_or_default();
        let meta: SnapshotMeta = req.meta.into();
        let snapshot = openraft::storage::Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        };

        match self.raft.install_full_snapshot(req.vote, snapshot).await {
            Ok(resp) => {
                RaftMessage::InstallSnapshotResponse(InstallSnapshotResponse::new(resp.vote))
            }
            Err(e) => {
                tracing::error!(error = %e, "snapshot installation failed");
                RaftMessage::Error(e.to_string())
            }
        }
    }
}

/// Append `req` to the snapshot being reassembled.
///
/// A chunk at offset zero starts a new snapshot; any other chunk must
/// continue the current one exactly where it ended.
fn accept_chunk(
    incoming: &mut Option<IncomingSnapshot>,
    req: &InstallSnapshotRequest,
) -> Result<(), String> {
    if req.offset == 0 {
        *incoming = Some(IncomingSnapshot {
            snapshot_id: req.meta.snapshot_id.clone(),
            data: Vec::new(),
        });
    }

    let Some(current) = incoming.as_mut() else {
        return Err(format!("chunk at offset {} without a snapshot start", req.offset));
    };
    if current.snapshot_id != req.meta.snapshot_id {
        *incoming = None;
        return Err("chunk belongs to a different snapshot".to_string());
    }
    if current.data.len() as u64 != req.offset {
        let expected = current.data.len();
        *incoming = None;
        return Err(format!("expected offset {expected}, got {}", req.offset));
    }

    current.data.extend_from_slice(&req.data);
    Ok(())
}

/// Spawn the Raft transport server on the blocking pool.
///
/// The socket is bound before returning, so a busy port is reported to the
/// caller.
pub fn spawn_transport(
    node_id: NodeId,
    listen_addr: impl Into<String>,
    raft: Arc<KiwiRaft>,
) -> Result<
    (
        tokio::task::JoinHandle<Result<(), RaftError>>,
        oneshot::Sender<()>,
    ),
    RaftError,
> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let transport = RaftTransport::new(node_id, listen_addr, raft);
    let socket = transport.bind()?;
    let runtime = Handle::current();

    let handle =
        tokio::task::spawn_blocking(move || transport.run_sync(socket, runtime, shutdown_rx));

    Ok((handle, shutdown_tx))
}
