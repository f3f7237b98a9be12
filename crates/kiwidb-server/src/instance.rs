//! Composition root of a server process.

use std::net::SocketAddr;
use std::sync::Arc;

use kiwidb_raft::ConsensusNode;
use kiwidb_storage::Storage;
use tokio::sync::broadcast;

use crate::cluster::{ClusterMembershipCoordinator, DataLayout, JoinLimits};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::RequestHandler;
use crate::server::RespServer;

/// Storage, consensus node, coordinator and listener of one server.
pub struct ServerInstance {
    storage: Arc<Storage>,
    node: Arc<ConsensusNode>,
    coordinator: Arc<ClusterMembershipCoordinator>,
    server: RespServer,
}

impl ServerInstance {
    /// Open storage, rejoin a stored group if any, and bind the listener.
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(Storage::open(config.storage_config())?);
        tracing::info!(
            shards = storage.shard_count(),
            databases = storage.databases(),
            replicated = storage.is_replicated(),
            durable_index = storage.durable_applied_index(),
            "storage opened"
        );

        let node = ConsensusNode::new(config.raft_config(), storage.clone());
        if node.recover().await? {
            tracing::info!(group_id = ?node.group_id(), "rejoined stored raft group");
        }

        let coordinator = Arc::new(ClusterMembershipCoordinator::new(
            node.clone(),
            DataLayout::of(&storage),
            JoinLimits::from_config(config),
        ));
        let handler = Arc::new(RequestHandler::new(
            storage.clone(),
            node.clone(),
            coordinator.clone(),
        ));
        let server = RespServer::bind(&config.listen_address(), handler).await?;

        Ok(Self {
            storage,
            node,
            coordinator,
            server,
        })
    }

    /// Address of the client listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// The sharded storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The consensus node.
    pub fn node(&self) -> &Arc<ConsensusNode> {
        &self.node
    }

    /// The membership coordinator.
    pub fn coordinator(&self) -> &Arc<ClusterMembershipCoordinator> {
        &self.coordinator
    }

    /// Serve clients until `shutdown` fires, then stop the node and storage.
    pub async fn run_until_shutdown(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let served = self.server.run_until_shutdown(shutdown).await;

        if let Err(e) = self.node.shutdown().await {
            tracing::error!(error = %e, "consensus node shutdown failed");
        }
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.shutdown())
            .await
            .map_err(|e| Error::Internal(format!("storage shutdown task failed: {e}")))??;
        tracing::info!("storage closed");

        served
    }
}
