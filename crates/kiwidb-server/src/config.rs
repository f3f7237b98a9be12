//! Server configuration.

use clap::Parser;
use kiwidb_raft::{RaftConfig, RAFT_PORT_OFFSET};
use kiwidb_storage::{StorageConfig, WriteMode};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default client port.
pub const DEFAULT_PORT: u16 = 9221;

/// Default bind address for the client listener.
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Default address advertised to peers.
pub const DEFAULT_ADVERTISE_IP: &str = "127.0.0.1";

/// Default number of redirects a join follows before giving up.
pub const DEFAULT_JOIN_MAX_REDIRECTS: usize = 5;

/// Default overall deadline of a join handshake in seconds.
pub const DEFAULT_JOIN_DEADLINE_SECS: u64 = 30;

/// Default timeout of a replicated commit in seconds.
pub const DEFAULT_APPLY_TIMEOUT_SECS: u64 = 10;

/// KiwiDB server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the client listener binds to.
    pub bind: String,

    /// Client port. The raft transport listens on `port + 10`.
    pub port: u16,

    /// IP this node advertises to the rest of its group.
    pub advertise_ip: String,

    /// Data root; shards live under `<data>/db`, raft state under `<data>/raft`.
    pub data_dir: PathBuf,

    /// Number of logical databases.
    pub databases: usize,

    /// Number of storage shards.
    pub shard_count: usize,

    /// Route writes through the replicated log.
    pub replicated: bool,

    /// How long a replicated commit waits for its entry to apply.
    pub apply_timeout: Duration,

    /// Largest encoded log entry accepted.
    pub max_entry_size: usize,

    /// Record an applied-index sample every this many commits.
    pub tracker_step: u64,

    /// Interval of the background shard flusher. None disables it.
    pub flush_interval: Option<Duration>,

    /// Redirects a join follows before failing.
    pub join_max_redirects: usize,

    /// Overall deadline of a join handshake.
    pub join_deadline: Duration,

    /// Timeout for connecting to a peer's client port.
    pub connect_timeout: Duration,

    /// Raft heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Raft election timeout range in milliseconds.
    pub election_timeout_ms: (u64, u64),

    /// Applied entries between automatic raft snapshots.
    pub snapshot_threshold: u64,
}

impl ServerConfig {
    /// Create a configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            advertise_ip: DEFAULT_ADVERTISE_IP.to_string(),
            data_dir: data_dir.into(),
            databases: kiwidb_storage::config::DEFAULT_DATABASES,
            shard_count: kiwidb_storage::config::DEFAULT_SHARD_COUNT,
            replicated: true,
            apply_timeout: Duration::from_secs(DEFAULT_APPLY_TIMEOUT_SECS),
            max_entry_size: kiwidb_storage::config::DEFAULT_MAX_ENTRY_SIZE,
            tracker_step: 1,
            flush_interval: Some(Duration::from_secs(1)),
            join_max_redirects: DEFAULT_JOIN_MAX_REDIRECTS,
            join_deadline: Duration::from_secs(DEFAULT_JOIN_DEADLINE_SECS),
            connect_timeout: Duration::from_secs(3),
            heartbeat_interval_ms: 150,
            election_timeout_ms: (300, 500),
            snapshot_threshold: 10_000,
        }
    }

    /// Set the bind address and client port.
    pub fn with_listen(mut self, bind: impl Into<String>, port: u16) -> Self {
        self.bind = bind.into();
        self.port = port;
        self
    }

    /// Set the advertised IP.
    pub fn with_advertise_ip(mut self, ip: impl Into<String>) -> Self {
        self.advertise_ip = ip.into();
        self
    }

    /// Set the number of logical databases.
    pub fn with_databases(mut self, databases: usize) -> Self {
        self.databases = databases;
        self
    }

    /// Set the number of storage shards.
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count.max(1);
        self
    }

    /// Commit writes locally instead of through the replicated log.
    pub fn without_replication(mut self) -> Self {
        self.replicated = false;
        self
    }

    /// Set the replicated commit timeout.
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Bound the join handshake.
    pub fn with_join_limits(mut self, max_redirects: usize, deadline: Duration) -> Self {
        self.join_max_redirects = max_redirects;
        self.join_deadline = deadline;
        self
    }

    /// Set the peer connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set raft timings.
    pub fn with_raft_timings(mut self, heartbeat_ms: u64, election_min_ms: u64, election_max_ms: u64) -> Self {
        self.heartbeat_interval_ms = heartbeat_ms;
        self.election_timeout_ms = (election_min_ms, election_max_ms);
        self
    }

    /// Disable the background shard flusher.
    pub fn without_background_flush(mut self) -> Self {
        self.flush_interval = None;
        self
    }

    /// Address peers use to reach this node's client port.
    pub fn client_address(&self) -> String {
        format!("{}:{}", self.advertise_ip, self.port)
    }

    /// Address the client listener binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Storage configuration derived from this one.
    pub fn storage_config(&self) -> StorageConfig {
        let mode = if self.replicated {
            WriteMode::Replicated
        } else {
            WriteMode::Direct
        };
        let config = StorageConfig::new(self.data_dir.join("db"))
            .with_shard_count(self.shard_count)
            .with_databases(self.databases)
            .with_write_mode(mode)
            .with_apply_timeout(self.apply_timeout)
            .with_max_entry_size(self.max_entry_size)
            .with_log_index_step(self.tracker_step);
        match self.flush_interval {
            Some(interval) => config.with_flush_interval(interval),
            None => config.without_background_flush(),
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port > u16::MAX - RAFT_PORT_OFFSET {
            return Err(Error::Config(format!(
                "port {} leaves no room for the raft port (+{RAFT_PORT_OFFSET})",
                self.port
            )));
        }
        if self.databases == 0 {
            return Err(Error::Config("databases must be at least 1".to_string()));
        }
        let (election_min, election_max) = self.election_timeout_ms;
        if election_min >= election_max {
            return Err(Error::Config(format!(
                "election timeout range {election_min}..{election_max} ms is empty"
            )));
        }
        if self.heartbeat_interval_ms >= election_min {
            return Err(Error::Config(format!(
                "heartbeat interval {} ms must be below the election timeout {election_min} ms",
                self.heartbeat_interval_ms
            )));
        }
        if self.join_deadline <= self.connect_timeout {
            return Err(Error::Config(format!(
                "join deadline {:?} must exceed the connect timeout {:?}",
                self.join_deadline, self.connect_timeout
            )));
        }
        Ok(())
    }

    /// Raft configuration derived from this one.
    pub fn raft_config(&self) -> RaftConfig {
        let (election_min, election_max) = self.election_timeout_ms;
        RaftConfig::for_client_endpoint(&self.bind, &self.advertise_ip, self.port)
            .with_heartbeat_interval_ms(self.heartbeat_interval_ms)
            .with_election_timeout_ms(election_min, election_max)
            .with_snapshot_threshold(self.snapshot_threshold)
            .with_data_dir(self.data_dir.join("raft"))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("./kiwidb_data")
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "kiwidb-server")]
#[command(version, about = "KiwiDB Server", long_about = None)]
pub struct Args {
    /// Data directory.
    #[arg(short, long, default_value = "./kiwidb_data")]
    pub data_dir: PathBuf,

    /// Address to bind the client listener to.
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Client port; the raft transport uses port + 10.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// IP advertised to other members.
    #[arg(long, default_value = DEFAULT_ADVERTISE_IP)]
    pub advertise_ip: String,

    /// Number of logical databases.
    #[arg(long, default_value_t = kiwidb_storage::config::DEFAULT_DATABASES)]
    pub databases: usize,

    /// Number of storage shards.
    #[arg(long, default_value_t = kiwidb_storage::config::DEFAULT_SHARD_COUNT)]
    pub shards: usize,

    /// Commit writes locally without consensus.
    #[arg(long)]
    pub no_replication: bool,

    /// Replicated commit timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_APPLY_TIMEOUT_SECS)]
    pub apply_timeout: u64,

    /// Maximum log entry size in megabytes.
    #[arg(long, default_value_t = 8)]
    pub max_entry_mb: usize,

    /// Record an applied-index sample every N commits.
    #[arg(long, default_value_t = 1)]
    pub tracker_step: u64,

    /// Background flush interval in milliseconds. Set to 0 to disable.
    #[arg(long, default_value_t = 1000)]
    pub flush_interval_ms: u64,

    /// Redirects a join follows before failing.
    #[arg(long, default_value_t = DEFAULT_JOIN_MAX_REDIRECTS)]
    pub join_max_redirects: usize,

    /// Join handshake deadline in seconds.
    #[arg(long, default_value_t = DEFAULT_JOIN_DEADLINE_SECS)]
    pub join_deadline: u64,

    /// Raft heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 150)]
    pub heartbeat_ms: u64,

    /// Minimum raft election timeout in milliseconds.
    #[arg(long, default_value_t = 300)]
    pub election_min_ms: u64,

    /// Maximum raft election timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub election_max_ms: u64,

    /// Applied entries between automatic snapshots.
    #[arg(long, default_value_t = 10_000)]
    pub snapshot_threshold: u64,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        let flush_interval = if self.flush_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.flush_interval_ms))
        };

        ServerConfig {
            bind: self.bind,
            port: self.port,
            advertise_ip: self.advertise_ip,
            data_dir: self.data_dir,
            databases: self.databases,
            shard_count: self.shards.max(1),
            replicated: !self.no_replication,
            apply_timeout: Duration::from_secs(self.apply_timeout),
            max_entry_size: self.max_entry_mb * 1024 * 1024,
            tracker_step: self.tracker_step.max(1),
            flush_interval,
            join_max_redirects: self.join_max_redirects,
            join_deadline: Duration::from_secs(self.join_deadline),
            connect_timeout: Duration::from_secs(3),
            heartbeat_interval_ms: self.heartbeat_ms,
            election_timeout_ms: (self.election_min_ms, self.election_max_ms),
            snapshot_threshold: self.snapshot_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.replicated);
        assert_eq!(config.apply_timeout, Duration::from_secs(10));
        assert_eq!(config.client_address(), "127.0.0.1:9221");
    }

    #[test]
    fn test_derived_storage_config() {
        let config = ServerConfig::new("/tmp/kiwi")
            .with_shard_count(2)
            .with_databases(4)
            .without_replication();
        let storage = config.storage_config();
        assert_eq!(storage.path, PathBuf::from("/tmp/kiwi/db"));
        assert_eq!(storage.shard_count, 2);
        assert_eq!(storage.databases, 4);
        assert_eq!(storage.write_mode, WriteMode::Direct);
    }

    #[test]
    fn test_derived_raft_config() {
        let config = ServerConfig::new("/tmp/kiwi")
            .with_listen("0.0.0.0", 7000)
            .with_advertise_ip("10.0.0.5");
        let raft = config.raft_config();
        assert_eq!(raft.raft_listen_addr, "0.0.0.0:7010");
        assert_eq!(raft.raft_advertise_addr, "10.0.0.5:7010");
        assert_eq!(raft.data_dir, PathBuf::from("/tmp/kiwi/raft"));
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());

        let bad = [
            ServerConfig::default().with_listen("0.0.0.0", 65530),
            ServerConfig::default().with_databases(0),
            ServerConfig::default().with_raft_timings(100, 500, 500),
            ServerConfig::default().with_raft_timings(300, 300, 500),
            ServerConfig::default().with_join_limits(5, Duration::from_secs(3)),
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "kiwidb-server",
            "--port",
            "7100",
            "--flush-interval-ms",
            "0",
            "--no-replication",
            "--join-max-redirects",
            "2",
        ]);
        let config = args.into_config();
        assert_eq!(config.port, 7100);
        assert!(config.flush_interval.is_none());
        assert!(!config.replicated);
        assert_eq!(config.join_max_redirects, 2);
    }
}
