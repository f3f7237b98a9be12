//! INFO sections.

use std::fmt;

use kiwidb_raft::NodeInfo;

use crate::cluster::DataLayout;

/// Render the `INFO DATA` section.
pub fn data_section(layout: &DataLayout) -> String {
    format!(
        "# Data\r\ndatabases_num:{}\r\nrocksdb_num:{}\r\nrockdb_version:{}\r\n",
        layout.databases, layout.shards, layout.engine_version
    )
}

/// Render the `INFO RAFT` section.
pub fn raft_section(info: &NodeInfo) -> String {
    RaftSection(info).to_string()
}

struct RaftSection<'a>(&'a NodeInfo);

impl fmt::Display for RaftSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.0;
        write!(f, "# Raft\r\n")?;
        write!(f, "raft_group_id:{}\r\n", info.group_id)?;
        write!(f, "raft_node_id:{}\r\n", info.node_id)?;
        write!(f, "raft_state:{}\r\n", if info.up { "up" } else { "down" })?;
        write!(f, "raft_role:{}\r\n", info.role)?;
        write!(f, "raft_leader_id:{}\r\n", info.leader.as_deref().unwrap_or_default())?;
        write!(f, "raft_current_term:{}\r\n", info.term)?;

        for (i, peer) in info.peers.iter().enumerate() {
            let (host, port) = peer.rsplit_once(':').unwrap_or((peer.as_str(), ""));
            write!(f, "raft_node{}:addr={},port={}\r\n", i + 1, host, port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_section() {
        let layout = DataLayout {
            databases: 16,
            shards: 3,
            engine_version: "0.1.0".into(),
        };
        assert_eq!(
            data_section(&layout),
            "# Data\r\ndatabases_num:16\r\nrocksdb_num:3\r\nrockdb_version:0.1.0\r\n"
        );
    }

    #[test]
    fn test_raft_section_leader_lists_peers() {
        let info = NodeInfo {
            group_id: "g".repeat(32),
            node_id: "10.0.0.1:9231".into(),
            up: true,
            role: "leader",
            leader: Some("10.0.0.1:9231".into()),
            term: 4,
            peers: vec!["10.0.0.2:9231".into(), "10.0.0.3:9231".into()],
        };
        let text = raft_section(&info);
        assert!(text.contains("raft_state:up\r\n"));
        assert!(text.contains("raft_role:leader\r\n"));
        assert!(text.contains("raft_leader_id:10.0.0.1:9231\r\n"));
        assert!(text.contains("raft_current_term:4\r\n"));
        assert!(text.contains("raft_node1:addr=10.0.0.2,port=9231\r\n"));
        assert!(text.contains("raft_node2:addr=10.0.0.3,port=9231\r\n"));
    }

    #[test]
    fn test_raft_section_uninitialized() {
        let info = NodeInfo {
            group_id: String::new(),
            node_id: "10.0.0.1:9231".into(),
            up: false,
            role: "none",
            leader: None,
            term: 0,
            peers: Vec::new(),
        };
        assert_eq!(
            raft_section(&info),
            "# Raft\r\nraft_group_id:\r\nraft_node_id:10.0.0.1:9231\r\nraft_state:down\r\n\
             raft_role:none\r\nraft_leader_id:\r\nraft_current_term:0\r\n"
        );
    }
}
