//! Factory for creating Raft network connections.

use std::time::Duration;

use openraft::network::RaftNetworkFactory;
use openraft::BasicNode;

use crate::network::transport::NngRaftNetwork;
use crate::types::{NodeId, TypeConfig};

/// Factory for creating NNG network connections.
///
/// This implements openraft's `RaftNetworkFactory` trait to create
/// network connections to other cluster nodes on demand.
pub struct NngNetworkFactory {
    /// This node's ID.
    node_id: NodeId,
    /// Timeout of each RPC.
    rpc_timeout: Duration,
}

impl NngNetworkFactory {
    /// Create a new network factory.
    pub fn new(node_id: NodeId, rpc_timeout: Duration) -> Self {
        Self {
            node_id,
            rpc_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for NngNetworkFactory {
    type Network = NngRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        tracing::debug!(
            from = self.node_id,
            to = target,
            addr = %node.addr,
            "creating raft network client"
        );
        NngRaftNetwork::new(target, node.clone()).with_timeout(self.rpc_timeout)
    }
}
