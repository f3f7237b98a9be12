//! The consensus node of a KiwiDB server.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use openraft::error::ClientWriteError;
use openraft::{BasicNode, ChangeMembers, Raft, RaftMetrics, ServerState};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use kiwidb_storage::{LogEntry, LogSubmitter, Storage};

use crate::cluster::events::{spawn_role_watcher, StateMachineEvents};
use crate::config::{client_address_of, validate_group_id, RaftConfig};
use crate::error::RaftError;
use crate::network::factory::NngNetworkFactory;
use crate::network::server::spawn_transport;
use crate::storage::log_storage::SledRaftLogStorage;
use crate::storage::state_machine::KiwiStateMachine;
use crate::types::{node_id_for, ClientRequest, KiwiRaft, NodeId};

/// File under the raft root holding the group id.
const GROUP_ID_FILE: &str = "group_id";

/// Error type of openraft write-path calls.
type WriteError = openraft::error::RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>;

/// Parts that exist only while the node is initialized.
struct RunningNode {
    group_id: String,
    raft: Arc<KiwiRaft>,
    transport: Mutex<Option<(JoinHandle<Result<(), RaftError>>, oneshot::Sender<()>)>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    _log_db: sled::Db,
    _meta_db: sled::Db,
}

/// Status of the node as reported by `INFO RAFT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Group id, empty when not initialized.
    pub group_id: String,
    /// This node's raft address.
    pub node_id: String,
    /// Whether the consensus core is running.
    pub up: bool,
    /// Current role name.
    pub role: &'static str,
    /// Raft address of the leader, if known.
    pub leader: Option<String>,
    /// Current term.
    pub term: u64,
    /// Raft addresses of the other members; filled only on the leader.
    pub peers: Vec<String>,
}

/// One member of a consensus group.
///
/// Created empty by the composition root; [`ConsensusNode::initialize`]
/// starts the consensus core, [`ConsensusNode::shutdown`] stops it again.
/// While running it is the [`LogSubmitter`] of the storage it was given, and
/// it receives the lifecycle events of its Raft instance.
pub struct ConsensusNode {
    config: RaftConfig,
    node_id: NodeId,
    storage: Arc<Storage>,
    /// Term while leader, -1 otherwise.
    leader_term: AtomicI64,
    running: RwLock<Option<Arc<RunningNode>>>,
    lifecycle: tokio::sync::Mutex<()>,
    runtime: Handle,
    this: Weak<ConsensusNode>,
}

impl ConsensusNode {
    /// Create an uninitialized node.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RaftConfig, storage: Arc<Storage>) -> Arc<Self> {
        let node_id = config.node_id();
        let runtime = Handle::current();
        Arc::new_cyclic(|this| Self {
            config,
            node_id,
            storage,
            leader_term: AtomicI64::new(-1),
            running: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            runtime,
            this: this.clone(),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Address other nodes reach this node's raft service on.
    pub fn raft_address(&self) -> &str {
        &self.config.raft_advertise_addr
    }

    /// Configuration of this node.
    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Whether this node has been initialized into a group.
    pub fn is_member(&self) -> bool {
        self.running.read().is_some()
    }

    /// Group id, if initialized.
    pub fn group_id(&self) -> Option<String> {
        self.running.read().as_ref().map(|r| r.group_id.clone())
    }

    /// Term while this node leads, -1 otherwise.
    pub fn leader_term(&self) -> i64 {
        self.leader_term.load(Ordering::Acquire)
    }

    /// Whether this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.leader_term() >= 0
    }

    /// The Raft handle, if initialized.
    pub fn raft(&self) -> Option<Arc<KiwiRaft>> {
        self.running.read().as_ref().map(|r| r.raft.clone())
    }

    fn running_node(&self) -> Result<Arc<RunningNode>, RaftError> {
        self.running.read().clone().ok_or_else(|| {
            tracing::error!("consensus node used before initialization");
            RaftError::NotInitialized
        })
    }

    fn group_id_path(&self) -> PathBuf {
        self.config.data_dir.join(GROUP_ID_FILE)
    }

    /// Group id recorded by an earlier initialization.
    pub fn stored_group_id(&self) -> Result<Option<String>, RaftError> {
        let path = self.group_id_path();
        if !path.exists() {
            return Ok(None);
        }
        let id = std::fs::read_to_string(&path)?;
        let id = id.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    /// Start the consensus core for `group_id`.
    ///
    /// With `bootstrap` the node forms a new group with itself as the only
    /// voter; otherwise it waits, with an empty configuration, to be added by
    /// the group's leader.
    pub async fn initialize(&self, group_id: &str, bootstrap: bool) -> Result<(), RaftError> {
        let _guard = self.lifecycle.lock().await;
        if self.running.read().is_some() {
            tracing::error!(group_id, "consensus node already initialized");
            return Err(RaftError::AlreadyInitialized);
        }
        validate_group_id(group_id)?;

        if let Some(stored) = self.stored_group_id()? {
            if stored != group_id {
                return Err(RaftError::Initialization(format!(
                    "node already belongs to group {stored}"
                )));
            }
        }

        let running = self.start(group_id, bootstrap).await?;

        if let Err(e) = std::fs::write(self.group_id_path(), group_id) {
            let _ = self.stop(&running).await;
            return Err(RaftError::Initialization(format!(
                "failed to record group id: {e}"
            )));
        }

        *self.running.write() = Some(running);
        let submitter: Weak<dyn LogSubmitter> = self.this.clone();
        self.storage.bind_log_submitter(submitter);

        tracing::info!(
            group_id,
            node_id = self.node_id,
            addr = %self.config.raft_advertise_addr,
            bootstrap,
            "consensus node initialized"
        );
        Ok(())
    }

    /// Rejoin the group recorded on disk, if any. Never bootstraps.
    pub async fn recover(&self) -> Result<bool, RaftError> {
        match self.stored_group_id()? {
            Some(group_id) => {
                tracing::info!(group_id = %group_id, "recovering consensus node");
                self.initialize(&group_id, false).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn start(&self, group_id: &str, bootstrap: bool) -> Result<Arc<RunningNode>, RaftError> {
        let init_error = |what: &str, e: &dyn std::fmt::Display| {
            RaftError::Initialization(format!("{what}: {e}"))
        };

        for dir in [
            self.config.log_dir(),
            self.config.meta_dir(),
            self.config.snapshot_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| init_error(&format!("failed to create {}", dir.display()), &e))?;
        }

        let log_db = sled::open(self.config.log_dir())
            .map_err(|e| init_error("failed to open raft log", &e))?;
        let meta_db = sled::open(self.config.meta_dir())
            .map_err(|e| init_error("failed to open raft metadata", &e))?;

        let log_store = SledRaftLogStorage::open(&log_db)?;
        let state_machine =
            KiwiStateMachine::new(self.storage.clone(), &meta_db, self.config.snapshot_dir())?;
        state_machine.rewind_to_durable(self.storage.durable_applied_index(), &log_store)?;

        let network = NngNetworkFactory::new(
            self.node_id,
            Duration::from_millis(self.config.rpc_timeout_ms),
        );
        let raft = Raft::new(
            self.node_id,
            self.config.to_openraft()?,
            network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| init_error("failed to start raft", &e))?;
        let raft = Arc::new(raft);

        let transport = match spawn_transport(
            self.node_id,
            self.config.raft_listen_addr.clone(),
            raft.clone(),
        ) {
            Ok(transport) => transport,
            Err(e) => {
                let _ = raft.shutdown().await;
                return Err(init_error("failed to start raft transport", &e));
            }
        };

        let events: Weak<dyn StateMachineEvents> = self.this.clone();
        let watcher = spawn_role_watcher(self.node_id, raft.metrics(), events);

        let running = Arc::new(RunningNode {
            group_id: group_id.to_string(),
            raft,
            transport: Mutex::new(Some(transport)),
            watcher: Mutex::new(Some(watcher)),
            _log_db: log_db,
            _meta_db: meta_db,
        });

        if bootstrap {
            let members = BTreeMap::from([(
                self.node_id,
                BasicNode {
                    addr: self.config.raft_advertise_addr.clone(),
                },
            )]);
            if let Err(e) = running.raft.initialize(members).await {
                let _ = self.stop(&running).await;
                return Err(init_error("failed to bootstrap group", &e));
            }
        }

        Ok(running)
    }

    /// Stop the consensus core.
    ///
    /// Safe to call on an uninitialized node.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        let _guard = self.lifecycle.lock().await;
        let Some(running) = self.running.write().take() else {
            return Ok(());
        };
        self.storage.unbind_log_submitter();

        let result = self.stop(&running).await;
        tracing::info!(node_id = self.node_id, "consensus node shut down");
        result
    }

    /// Stop the node and forget its group, for a join that was never
    /// completed.
    pub async fn discard(&self) -> Result<(), RaftError> {
        self.shutdown().await?;
        let path = self.group_id_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        tracing::info!(node_id = self.node_id, "discarded group membership");
        Ok(())
    }

    async fn stop(&self, running: &RunningNode) -> Result<(), RaftError> {
        let result = running
            .raft
            .shutdown()
            .await
            .map_err(|e| RaftError::Shutdown(e.to_string()));

        let transport = running.transport.lock().take();
        if let Some((handle, shutdown_tx)) = transport {
            let _ = shutdown_tx.send(());
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "raft transport stopped with error"),
                Err(e) => tracing::warn!(error = %e, "raft transport task failed"),
            }
        }

        let watcher = running.watcher.lock().take();
        if let Some(mut watcher) = watcher {
            if tokio::time::timeout(Duration::from_secs(1), &mut watcher)
                .await
                .is_err()
            {
                watcher.abort();
            }
        }

        self.leader_term.store(-1, Ordering::Release);
        result
    }

    /// Add the node at `raft_addr` as a voter.
    ///
    /// The new node first catches up as a learner.
    pub async fn add_peer(&self, raft_addr: &str) -> Result<(), RaftError> {
        let running = self.running_node()?;
        let id = node_id_for(raft_addr);

        running
            .raft
            .add_learner(
                id,
                BasicNode {
                    addr: raft_addr.to_string(),
                },
                true,
            )
            .await
            .map_err(|e| write_error(e, RaftError::MembershipChange))?;

        running
            .raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(|e| write_error(e, RaftError::MembershipChange))?;

        tracing::info!(peer = raft_addr, peer_id = id, "added peer");
        Ok(())
    }

    /// Remove the node at `raft_addr` from the group.
    pub async fn remove_peer(&self, raft_addr: &str) -> Result<(), RaftError> {
        let running = self.running_node()?;
        let id = node_id_for(raft_addr);
        let ids = BTreeSet::from([id]);

        let is_voter = running
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .any(|voter| voter == id);
        if is_voter {
            running
                .raft
                .change_membership(ChangeMembers::RemoveVoters(ids.clone()), false)
                .await
                .map_err(|e| write_error(e, RaftError::MembershipChange))?;
        }

        running
            .raft
            .change_membership(ChangeMembers::RemoveNodes(ids), false)
            .await
            .map_err(|e| write_error(e, RaftError::MembershipChange))?;

        tracing::info!(peer = raft_addr, peer_id = id, "removed peer");
        Ok(())
    }

    /// Take a snapshot of the state machine now.
    pub async fn snapshot(&self) -> Result<(), RaftError> {
        let running = self.running_node()?;
        running
            .raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| RaftError::Snapshot(e.to_string()))
    }

    /// Current status.
    pub fn info(&self) -> NodeInfo {
        let running = self.running.read().clone();
        let Some(running) = running else {
            return NodeInfo {
                group_id: String::new(),
                node_id: self.config.raft_advertise_addr.clone(),
                up: false,
                role: "none",
                leader: None,
                term: 0,
                peers: Vec::new(),
            };
        };

        let metrics = running.raft.metrics().borrow().clone();
        let is_leader = metrics.state == ServerState::Leader;
        let peers = if is_leader {
            metrics
                .membership_config
                .membership()
                .nodes()
                .filter(|(id, _)| **id != self.node_id)
                .map(|(_, node)| node.addr.clone())
                .collect()
        } else {
            Vec::new()
        };

        NodeInfo {
            group_id: running.group_id.clone(),
            node_id: self.config.raft_advertise_addr.clone(),
            up: metrics.running_state.is_ok() && metrics.state != ServerState::Shutdown,
            role: role_name(metrics.state),
            leader: leader_raft_address(&metrics),
            term: metrics.current_term,
            peers,
        }
    }
}

fn role_name(state: ServerState) -> &'static str {
    match state {
        ServerState::Leader => "leader",
        ServerState::Follower => "follower",
        ServerState::Candidate => "candidate",
        ServerState::Learner => "learner",
        ServerState::Shutdown => "shutdown",
    }
}

/// Raft address of the current leader, if known.
fn leader_raft_address(metrics: &RaftMetrics<NodeId, BasicNode>) -> Option<String> {
    let leader = metrics.current_leader?;
    metrics
        .membership_config
        .membership()
        .get_node(&leader)
        .map(|node| node.addr.clone())
}

/// Client address clients should be redirected to for `raft_addr`.
fn redirect_address(raft_addr: &str) -> String {
    client_address_of(raft_addr).unwrap_or_else(|| raft_addr.to_string())
}

/// Map a write-path error, turning leader forwards into redirects.
fn write_error(e: WriteError, other: fn(String) -> RaftError) -> RaftError {
    if let Some(forward) = e.forward_to_leader::<BasicNode>() {
        return match &forward.leader_node {
            Some(node) => RaftError::WrongLeader(redirect_address(&node.addr)),
            None => RaftError::NoLeader,
        };
    }
    other(e.to_string())
}

impl LogSubmitter for ConsensusNode {
    fn submit(&self, entry: Vec<u8>) -> kiwidb_storage::Result<()> {
        let running = self
            .running
            .read()
            .clone()
            .ok_or(kiwidb_storage::Error::NotInitialized)?;

        let redirect = {
            let metrics = running.raft.metrics();
            let metrics = metrics.borrow();
            if metrics.current_leader == Some(self.node_id) {
                None
            } else {
                Some(leader_raft_address(&metrics))
            }
        };
        if let Some(leader) = redirect {
            return Err(match leader {
                Some(addr) => kiwidb_storage::Error::WrongLeader(redirect_address(&addr)),
                None => kiwidb_storage::Error::SubmitFailed("no leader elected".to_string()),
            });
        }

        let proposal = LogEntry::decode(&entry).ok().and_then(|e| e.proposal);
        let proposals = self.storage.proposals().clone();
        let raft = running.raft.clone();

        self.runtime.spawn(async move {
            if let Err(e) = raft.client_write(ClientRequest::Apply(entry)).await {
                tracing::warn!(error = %e, "replicated write rejected");
                if let Some(id) = proposal {
                    let error = match write_error(e, RaftError::Write) {
                        RaftError::WrongLeader(addr) => kiwidb_storage::Error::WrongLeader(addr),
                        other => kiwidb_storage::Error::SubmitFailed(other.to_string()),
                    };
                    proposals.resolve(id, Err(error));
                }
            }
        });
        Ok(())
    }
}

impl StateMachineEvents for ConsensusNode {
    fn on_leader_start(&self, term: u64) {
        self.leader_term
            .store(i64::try_from(term).unwrap_or(i64::MAX), Ordering::Release);
        tracing::info!(term, node_id = self.node_id, "became leader");
    }

    fn on_leader_stop(&self) {
        self.leader_term.store(-1, Ordering::Release);
        tracing::info!(node_id = self.node_id, "stepped down as leader");
    }

    fn on_start_following(&self, leader: NodeId) {
        tracing::info!(leader, "started following");
    }

    fn on_stop_following(&self) {
        tracing::info!("stopped following");
    }

    fn on_configuration_committed(&self, voters: &BTreeSet<NodeId>) {
        tracing::info!(voters = ?voters, "configuration committed");
    }

    fn on_shutdown(&self) {
        self.leader_term.store(-1, Ordering::Release);
        tracing::info!(node_id = self.node_id, "consensus core stopped");
    }

    fn on_error(&self, message: &str) {
        self.leader_term.store(-1, Ordering::Release);
        tracing::error!(error = message, "consensus core failed");
    }
}
