//! End-to-end tests against running servers.

mod common;

use std::path::Path;
use std::time::Duration;

use redis_protocol::resp2::types::BytesFrame;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use kiwidb_server::{PeerConnection, ServerConfig, ServerInstance};

use common::{cmd, free_port_pair, test_config, text, wait_for_raft_field, wait_for_value};

struct Running {
    addr: String,
    raft_addr: String,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<kiwidb_server::Result<()>>,
}

impl Running {
    async fn connect(&self) -> PeerConnection {
        PeerConnection::connect(&self.addr, Duration::from_secs(2))
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

async fn start(config: ServerConfig) -> Running {
    let instance = ServerInstance::open(&config).await.unwrap();
    let addr = instance.local_addr().unwrap().to_string();
    let raft_addr = instance.node().raft_address().to_string();
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(instance.run_until_shutdown(rx));
    Running {
        addr,
        raft_addr,
        shutdown,
        task,
    }
}

async fn start_at(dir: &Path, port: u16) -> Running {
    start(test_config(dir, port)).await
}

fn is_error(frame: &BytesFrame, prefix: &str) -> bool {
    matches!(frame, BytesFrame::Error(message) if message.starts_with(prefix))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_data_commands_direct_mode() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(test_config(dir.path(), free_port_pair()).without_replication()).await;
    let mut conn = server.connect().await;

    assert_eq!(text(&cmd(&mut conn, &["PING"]).await), "PONG");
    assert_eq!(text(&cmd(&mut conn, &["SET", "k", "v"]).await), "OK");
    assert_eq!(text(&cmd(&mut conn, &["GET", "k"]).await), "v");

    assert_eq!(text(&cmd(&mut conn, &["HSET", "h", "f1", "a", "f2", "b"]).await), "2");
    assert_eq!(text(&cmd(&mut conn, &["HSET", "h", "f1", "c"]).await), "0");
    assert_eq!(text(&cmd(&mut conn, &["HGET", "h", "f1"]).await), "c");
    assert_eq!(text(&cmd(&mut conn, &["HLEN", "h"]).await), "2");
    assert_eq!(text(&cmd(&mut conn, &["HDEL", "h", "f1", "nope"]).await), "1");
    assert_eq!(text(&cmd(&mut conn, &["HLEN", "h"]).await), "1");

    assert_eq!(text(&cmd(&mut conn, &["DEL", "k", "missing"]).await), "1");
    assert_eq!(cmd(&mut conn, &["GET", "k"]).await, BytesFrame::Null);

    let data = text(&cmd(&mut conn, &["INFO", "DATA"]).await);
    assert!(data.contains("rocksdb_num:1\r\n"), "{data}");
    assert!(is_error(&cmd(&mut conn, &["NOSUCH"]).await, "ERR unknown command"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_cluster_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port_pair();
    let server = start_at(dir.path(), port).await;
    let mut conn = server.connect().await;

    let early = cmd(&mut conn, &["SET", "k", "v"]).await;
    assert!(is_error(&early, "ERR consensus node not initialized"), "{early:?}");

    let bad = cmd(&mut conn, &["RAFT.CLUSTER", "INIT", "abc"]).await;
    assert_eq!(text(&bad), "ERR cluster id must be 32 characters");

    let init = text(&cmd(&mut conn, &["RAFT.CLUSTER", "INIT"]).await);
    let group_id = init.strip_prefix("OK ").unwrap().to_string();
    assert_eq!(group_id.len(), 32);
    assert!(group_id.chars().all(|c| c.is_ascii_hexdigit()));

    wait_for_raft_field(&mut conn, "raft_role", |role| role == "leader").await;
    assert_eq!(
        wait_for_raft_field(&mut conn, "raft_group_id", |_| true).await,
        group_id
    );
    assert_eq!(
        wait_for_raft_field(&mut conn, "raft_state", |_| true).await,
        "up"
    );

    assert_eq!(text(&cmd(&mut conn, &["SET", "k", "v"]).await), "OK");
    assert_eq!(text(&cmd(&mut conn, &["HSET", "h", "f", "x"]).await), "1");
    assert_eq!(text(&cmd(&mut conn, &["GET", "k"]).await), "v");

    let again = cmd(&mut conn, &["RAFT.CLUSTER", "INIT"]).await;
    assert_eq!(text(&again), "ERR Already cluster member");
    let join = cmd(&mut conn, &["RAFT.CLUSTER", "JOIN", "127.0.0.1:1"]).await;
    assert_eq!(text(&join), "ERR Already cluster member");

    assert_eq!(text(&cmd(&mut conn, &["RAFT.NODE", "SNAPSHOT"]).await), "OK");

    drop(conn);
    server.stop().await;

    // The group is rejoined on restart and the data is still there.
    let server = start_at(dir.path(), port).await;
    let mut conn = server.connect().await;
    wait_for_raft_field(&mut conn, "raft_role", |role| role == "leader").await;
    assert_eq!(
        wait_for_raft_field(&mut conn, "raft_group_id", |_| true).await,
        group_id
    );
    assert_eq!(text(&cmd(&mut conn, &["GET", "k"]).await), "v");
    assert_eq!(text(&cmd(&mut conn, &["HGET", "h", "f"]).await), "x");
    assert_eq!(text(&cmd(&mut conn, &["SET", "k", "w"]).await), "OK");

    drop(conn);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_two_node_join_replicate_and_remove() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_at(dir_a.path(), free_port_pair()).await;
    let b = start_at(dir_b.path(), free_port_pair()).await;
    let mut conn_a = a.connect().await;
    let mut conn_b = b.connect().await;

    let init = text(&cmd(&mut conn_a, &["RAFT.CLUSTER", "INIT"]).await);
    let group_id = init.strip_prefix("OK ").unwrap().to_string();
    wait_for_raft_field(&mut conn_a, "raft_role", |role| role == "leader").await;

    let joined = cmd(&mut conn_b, &["RAFT.CLUSTER", "JOIN", &a.addr]).await;
    assert_eq!(text(&joined), "OK");
    assert_eq!(
        wait_for_raft_field(&mut conn_b, "raft_group_id", |_| true).await,
        group_id
    );

    let (b_host, b_port) = b.raft_addr.rsplit_once(':').unwrap();
    let peer_line = format!("addr={b_host},port={b_port}");
    wait_for_raft_field(&mut conn_a, "raft_node1", |line| line == peer_line).await;

    // Writes on the leader reach the follower.
    assert_eq!(text(&cmd(&mut conn_a, &["SET", "shared", "1"]).await), "OK");
    wait_for_value(&mut conn_b, "shared", "1").await;

    // Writes on the follower are redirected to the leader's client port.
    wait_for_raft_field(&mut conn_b, "raft_leader_id", |leader| leader == a.raft_addr).await;
    let redirected = cmd(&mut conn_b, &["SET", "shared", "2"]).await;
    assert_eq!(text(&redirected), format!("ERR wrong leader {}", a.addr));

    // Removal requested on the follower is forwarded to the leader.
    let removed = cmd(&mut conn_b, &["RAFT.NODE", "REMOVE", &b.raft_addr]).await;
    assert_eq!(text(&removed), "OK");
    wait_for_raft_field(&mut conn_a, "raft_node1", str::is_empty).await;

    drop(conn_a);
    drop(conn_b);
    b.stop().await;
    a.stop().await;
}
