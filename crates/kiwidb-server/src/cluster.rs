//! Cluster membership handshakes.
//!
//! Joining a group is driven over ordinary client connections: the joiner
//! asks the target for its data layout (`INFO DATA`) and group identity
//! (`INFO RAFT`), starts its own consensus node as a joining member, then
//! asks the leader to admit it with `RAFT.NODE ADD`. A non-leader answers any
//! step with a wrong-leader error; the handshake then starts over against the
//! leader it named, a bounded number of times and within a deadline.

use std::sync::Arc;
use std::time::Duration;

use kiwidb_raft::{client_address_of, ConsensusNode, RaftError};
use kiwidb_storage::Storage;
use parking_lot::Mutex;
use redis_protocol::resp2::types::BytesFrame;
use thiserror::Error;

use crate::client::{frame_text, info_field, wrong_leader_target, PeerConnection};
use crate::config::ServerConfig;

/// Membership handshake failures.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Another join or remove is already in progress on this node.
    #[error("other clients have joined")]
    PendingRequestConflict,

    /// This node already belongs to a group.
    #[error("Already cluster member")]
    AlreadyMember,

    /// The target's data layout differs from ours.
    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    /// No connection to the peer could be opened.
    #[error("cannot connect to {0}")]
    ConnectFailed(String),

    /// The peer dropped the connection during a handshake step.
    #[error("{step} failed: connection dropped. {addr}")]
    ConnectionDropped {
        /// Command that was in flight.
        step: &'static str,
        /// Peer client address.
        addr: String,
    },

    /// Redirects exceeded the configured hop limit.
    #[error("too many redirects, last leader {0}")]
    TooManyRedirects(String),

    /// The handshake did not finish before its deadline.
    #[error("join timed out after {0:?}")]
    Timeout(Duration),

    /// The deadline expired while the leader was still admitting this node.
    #[error("join timed out while {0} was adding this node; check its membership")]
    AddTimedOut(String),

    /// A peer replied with something the handshake does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A peer refused the request; carries its error reply.
    #[error("{0}")]
    Rejected(String),

    /// The local consensus node failed.
    #[error(transparent)]
    Node(#[from] RaftError),
}

impl CoordinatorError {
    /// Error reply sent to the requesting client.
    pub fn reply_message(&self) -> String {
        match self {
            CoordinatorError::Rejected(message) => message.clone(),
            other => format!("ERR {other}"),
        }
    }
}

/// Kind of membership request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// This node is joining a group.
    Join,
    /// A member is being removed through the leader.
    Remove,
}

/// The membership request currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Request kind.
    pub kind: RequestKind,
    /// Client address of the peer being talked to.
    pub peer_address: String,
    /// Raft address of the node joining or leaving.
    pub node_id: String,
}

/// Slot holding at most one membership request per node.
#[derive(Debug, Default)]
pub struct ClusterMembershipRequest {
    slot: Mutex<Option<PendingRequest>>,
}

impl ClusterMembershipRequest {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. Returns false if a request is already set.
    pub fn set(
        &self,
        kind: RequestKind,
        peer_address: impl Into<String>,
        node_id: impl Into<String>,
    ) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(PendingRequest {
            kind,
            peer_address: peer_address.into(),
            node_id: node_id.into(),
        });
        true
    }

    /// Release the slot.
    pub fn clear(&self) {
        self.slot.lock().take();
    }

    /// Whether a request is in flight.
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The request in flight, if any.
    pub fn current(&self) -> Option<PendingRequest> {
        self.slot.lock().clone()
    }

    /// Point the request in flight at another peer.
    pub fn retarget(&self, peer_address: &str) {
        if let Some(request) = self.slot.lock().as_mut() {
            request.peer_address = peer_address.to_string();
        }
    }

    fn claim(
        &self,
        kind: RequestKind,
        peer_address: &str,
        node_id: &str,
    ) -> Result<PendingGuard<'_>, CoordinatorError> {
        if self.set(kind, peer_address, node_id) {
            Ok(PendingGuard(self))
        } else {
            Err(CoordinatorError::PendingRequestConflict)
        }
    }
}

/// Clears the request slot when the handshake ends, however it ends.
struct PendingGuard<'a>(&'a ClusterMembershipRequest);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Data layout two members of one group must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    /// Logical database count (`databases_num`).
    pub databases: usize,
    /// Storage shard count (`rocksdb_num`).
    pub shards: usize,
    /// Storage engine version (`rockdb_version`).
    pub engine_version: String,
}

impl DataLayout {
    /// Layout of the local storage.
    pub fn of(storage: &Storage) -> Self {
        Self {
            databases: storage.databases(),
            shards: storage.shard_count(),
            engine_version: storage.engine_version().to_string(),
        }
    }

    /// Compare with the layout described by an `INFO DATA` reply.
    pub fn check_remote(&self, info: &str) -> Result<(), CoordinatorError> {
        let field = |name: &str| {
            info_field(info, name)
                .ok_or_else(|| CoordinatorError::Protocol(format!("INFO DATA without {name}")))
        };

        let databases = field("databases_num")?;
        if databases != self.databases.to_string() {
            return Err(CoordinatorError::ConfigMismatch(format!(
                "databases_num local {} remote {databases}",
                self.databases
            )));
        }
        let shards = field("rocksdb_num")?;
        if shards != self.shards.to_string() {
            return Err(CoordinatorError::ConfigMismatch(format!(
                "rocksdb_num local {} remote {shards}",
                self.shards
            )));
        }
        let version = field("rockdb_version")?;
        if version != self.engine_version {
            return Err(CoordinatorError::ConfigMismatch(format!(
                "rockdb_version local {} remote {version}",
                self.engine_version
            )));
        }
        Ok(())
    }
}

/// Bounds of a join handshake.
#[derive(Debug, Clone, Copy)]
pub struct JoinLimits {
    /// Redirects followed before giving up.
    pub max_redirects: usize,
    /// Deadline of the whole handshake.
    pub deadline: Duration,
    /// Timeout of each outbound connect.
    pub connect_timeout: Duration,
}

impl JoinLimits {
    /// Limits configured for the server.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_redirects: config.join_max_redirects,
            deadline: config.join_deadline,
            connect_timeout: config.connect_timeout,
        }
    }
}

impl Default for JoinLimits {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// A reply that either redirects or carries text.
enum Reply {
    Text(String),
    Redirect(String),
}

enum Round {
    Joined(String),
    Redirect(String),
}

/// What a join attempt has done so far.
#[derive(Default)]
struct JoinProgress {
    /// Group the local node was started for.
    initialized: Option<String>,
    /// Leader with a `RAFT.NODE ADD` in flight.
    adding: Option<String>,
}

/// Drives join and remove handshakes for one node.
pub struct ClusterMembershipCoordinator {
    request: ClusterMembershipRequest,
    node: Arc<ConsensusNode>,
    layout: DataLayout,
    limits: JoinLimits,
}

impl ClusterMembershipCoordinator {
    /// Create a coordinator for `node`, whose storage has `layout`.
    pub fn new(node: Arc<ConsensusNode>, layout: DataLayout, limits: JoinLimits) -> Self {
        Self {
            request: ClusterMembershipRequest::new(),
            node,
            layout,
            limits,
        }
    }

    /// The pending request slot.
    pub fn request(&self) -> &ClusterMembershipRequest {
        &self.request
    }

    /// Join the group `target` belongs to. Returns the group id.
    ///
    /// If the local node was started during this handshake and the
    /// handshake then fails, the node is stopped and its group forgotten.
    pub async fn request_join(&self, target: &str) -> Result<String, CoordinatorError> {
        let _guard = self
            .request
            .claim(RequestKind::Join, target, self.node.raft_address())?;
        if self.node.is_member() {
            return Err(CoordinatorError::AlreadyMember);
        }

        tracing::info!(target, node = self.node.raft_address(), "joining raft cluster");

        let mut progress = JoinProgress::default();
        let outcome =
            tokio::time::timeout(self.limits.deadline, self.join_rounds(target, &mut progress)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => match progress.adding.take() {
                Some(leader) => {
                    tracing::warn!(
                        leader = %leader,
                        node = self.node.raft_address(),
                        "join deadline expired during RAFT.NODE ADD; the leader may keep this node \
                         as a learner until it is removed with RAFT.NODE REMOVE"
                    );
                    Err(CoordinatorError::AddTimedOut(leader))
                }
                None => Err(CoordinatorError::Timeout(self.limits.deadline)),
            },
        };

        match &result {
            Ok(group_id) => {
                tracing::info!(group_id = %group_id, node = self.node.raft_address(), "joined raft cluster");
            }
            Err(e) => {
                tracing::warn!(target, error = %e, "join failed");
                if progress.initialized.is_some() {
                    if let Err(e) = self.node.discard().await {
                        tracing::error!(error = %e, "failed to stop node after failed join");
                    }
                }
            }
        }
        result
    }

    async fn join_rounds(
        &self,
        target: &str,
        progress: &mut JoinProgress,
    ) -> Result<String, CoordinatorError> {
        let mut target = target.to_string();
        let mut hops = 0usize;
        loop {
            match self.join_round(&target, progress).await? {
                Round::Joined(group_id) => return Ok(group_id),
                Round::Redirect(leader) => {
                    hops += 1;
                    if hops > self.limits.max_redirects {
                        return Err(CoordinatorError::TooManyRedirects(leader));
                    }
                    tracing::info!(from = %target, to = %leader, hops, "join redirected");
                    self.request.retarget(&leader);
                    target = leader;
                }
            }
        }
    }

    async fn join_round(
        &self,
        target: &str,
        progress: &mut JoinProgress,
    ) -> Result<Round, CoordinatorError> {
        let mut conn = self.connect(target).await?;

        let data = match round_trip(&mut conn, "INFO DATA", &[b"INFO", b"DATA"]).await? {
            Reply::Redirect(leader) => return Ok(Round::Redirect(leader)),
            Reply::Text(body) => body,
        };
        self.layout.check_remote(&data)?;

        let raft = match round_trip(&mut conn, "INFO RAFT", &[b"INFO", b"RAFT"]).await? {
            Reply::Redirect(leader) => return Ok(Round::Redirect(leader)),
            Reply::Text(body) => body,
        };
        let group_id = info_field(&raft, "raft_group_id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CoordinatorError::Protocol(format!("{target} is not a cluster member")))?
            .to_string();

        if progress.initialized.as_deref() != Some(group_id.as_str()) {
            if progress.initialized.take().is_some() {
                self.node.discard().await?;
            }
            self.node.initialize(&group_id, false).await?;
            progress.initialized = Some(group_id.clone());
        }

        let raft_addr = self.node.raft_address().to_string();
        let add = [b"RAFT.NODE".as_slice(), b"ADD", b"0", raft_addr.as_bytes()];
        progress.adding = Some(target.to_string());
        let reply = round_trip(&mut conn, "RAFT.NODE ADD", &add).await;
        progress.adding = None;
        match reply? {
            Reply::Redirect(leader) => Ok(Round::Redirect(leader)),
            Reply::Text(text) => {
                let admitted = text.strip_prefix("OK").map(str::trim).unwrap_or_default();
                if !admitted.is_empty() && admitted != group_id {
                    return Err(CoordinatorError::Protocol(format!(
                        "admitted to group {admitted}, expected {group_id}"
                    )));
                }
                Ok(Round::Joined(group_id))
            }
        }
    }

    /// Ask the leader to remove `node_id` and return its reply unchanged.
    pub async fn request_remove(&self, node_id: &str) -> Result<BytesFrame, CoordinatorError> {
        let _guard = self.request.claim(RequestKind::Remove, "", node_id)?;
        if !self.node.is_member() {
            return Err(RaftError::NotInitialized.into());
        }
        let leader = self.node.info().leader.ok_or(RaftError::NoLeader)?;
        let target = client_address_of(&leader).unwrap_or(leader);
        self.request.retarget(&target);

        tracing::info!(node_id, leader = %target, "forwarding node removal");
        let mut conn = self.connect(&target).await?;
        conn.command(&[b"RAFT.NODE", b"REMOVE", node_id.as_bytes()])
            .await
            .map_err(|e| {
                tracing::warn!(peer = %target, error = %e, "remove request dropped");
                CoordinatorError::ConnectionDropped {
                    step: "RAFT.NODE REMOVE",
                    addr: target.clone(),
                }
            })
    }

    async fn connect(&self, target: &str) -> Result<PeerConnection, CoordinatorError> {
        PeerConnection::connect(target, self.limits.connect_timeout)
            .await
            .map_err(|e| {
                tracing::warn!(peer = target, error = %e, "failed to connect to peer");
                CoordinatorError::ConnectFailed(target.to_string())
            })
    }
}

/// Send one handshake command and classify its reply.
async fn round_trip(
    conn: &mut PeerConnection,
    step: &'static str,
    args: &[&[u8]],
) -> Result<Reply, CoordinatorError> {
    let frame = conn.command(args).await.map_err(|e| {
        tracing::warn!(peer = conn.addr(), step, error = %e, "handshake connection dropped");
        CoordinatorError::ConnectionDropped {
            step,
            addr: conn.addr().to_string(),
        }
    })?;

    if let Some(leader) = wrong_leader_target(&frame) {
        return Ok(Reply::Redirect(leader));
    }
    match &frame {
        BytesFrame::Error(message) => Err(CoordinatorError::Rejected(message.to_string())),
        other => frame_text(other).map(Reply::Text).ok_or_else(|| {
            CoordinatorError::Protocol(format!("unexpected reply {other:?} from {}", conn.addr()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_request_is_exclusive() {
        let request = ClusterMembershipRequest::new();
        assert!(request.set(RequestKind::Join, "10.0.0.1:9221", "10.0.0.2:9231"));
        assert!(!request.set(RequestKind::Remove, "10.0.0.3:9221", "10.0.0.4:9231"));
        assert!(request.is_set());

        request.clear();
        assert!(!request.is_set());
        assert!(request.set(RequestKind::Remove, "10.0.0.3:9221", "10.0.0.4:9231"));
    }

    #[test]
    fn test_retarget_keeps_request() {
        let request = ClusterMembershipRequest::new();
        request.set(RequestKind::Join, "10.0.0.1:9221", "10.0.0.2:9231");
        request.retarget("10.0.0.9:9221");

        let current = request.current().unwrap();
        assert_eq!(current.kind, RequestKind::Join);
        assert_eq!(current.peer_address, "10.0.0.9:9221");
        assert_eq!(current.node_id, "10.0.0.2:9231");
    }

    #[test]
    fn test_guard_clears_slot() {
        let request = ClusterMembershipRequest::new();
        {
            let _guard = request.claim(RequestKind::Join, "a:1", "b:2").unwrap();
            assert!(matches!(
                request.claim(RequestKind::Join, "a:1", "b:2"),
                Err(CoordinatorError::PendingRequestConflict)
            ));
        }
        assert!(!request.is_set());
    }

    #[test]
    fn test_layout_check() {
        let layout = DataLayout {
            databases: 16,
            shards: 3,
            engine_version: "0.1.0".to_string(),
        };
        let matching = "databases_num:16\r\nrocksdb_num:3\r\nrockdb_version:0.1.0\r\n";
        assert!(layout.check_remote(matching).is_ok());

        let shards = "databases_num:16\r\nrocksdb_num:5\r\nrockdb_version:0.1.0\r\n";
        assert!(matches!(
            layout.check_remote(shards),
            Err(CoordinatorError::ConfigMismatch(_))
        ));

        let missing = "databases_num:16\r\n";
        assert!(matches!(
            layout.check_remote(missing),
            Err(CoordinatorError::Protocol(_))
        ));
    }

    #[test]
    fn test_reply_messages() {
        assert_eq!(
            CoordinatorError::PendingRequestConflict.reply_message(),
            "ERR other clients have joined"
        );
        assert_eq!(
            CoordinatorError::ConnectFailed("10.0.0.1:9221".into()).reply_message(),
            "ERR cannot connect to 10.0.0.1:9221"
        );
        assert_eq!(
            CoordinatorError::ConnectionDropped {
                step: "RAFT.NODE ADD",
                addr: "10.0.0.1:9221".into(),
            }
            .reply_message(),
            "ERR RAFT.NODE ADD failed: connection dropped. 10.0.0.1:9221"
        );
        assert_eq!(
            CoordinatorError::Rejected("ERR no such peer".into()).reply_message(),
            "ERR no such peer"
        );
    }
}
