//! Helpers shared by the server integration tests.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};

use kiwidb_server::client::{frame_text, info_field};
use kiwidb_server::{PeerConnection, ServerConfig};
use redis_protocol::resp2::types::BytesFrame;

/// A client port whose raft port (port + 10) is free as well.
pub fn free_port_pair() -> u16 {
    loop {
        let client = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = client.local_addr().unwrap().port();
        let Some(raft_port) = port.checked_add(10) else {
            continue;
        };
        if TcpListener::bind(("127.0.0.1", raft_port)).is_ok() {
            return port;
        }
    }
}

/// Fast-electing single-shard configuration rooted at `dir`.
pub fn test_config(dir: &Path, port: u16) -> ServerConfig {
    ServerConfig::new(dir)
        .with_listen("127.0.0.1", port)
        .with_advertise_ip("127.0.0.1")
        .with_shard_count(1)
        .with_apply_timeout(Duration::from_secs(5))
        .with_raft_timings(50, 150, 300)
        .without_background_flush()
}

/// Send a command given as strings.
pub async fn cmd(conn: &mut PeerConnection, args: &[&str]) -> BytesFrame {
    let args: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
    conn.command(&args).await.unwrap()
}

/// Text of a reply, panicking on non-text replies.
pub fn text(frame: &BytesFrame) -> String {
    frame_text(frame).unwrap_or_else(|| panic!("no text in {frame:?}"))
}

/// Field of an `INFO RAFT` reply.
pub async fn raft_field(conn: &mut PeerConnection, field: &str) -> String {
    let reply = cmd(conn, &["INFO", "RAFT"]).await;
    info_field(&text(&reply), field).unwrap_or_default().to_string()
}

/// Poll an `INFO RAFT` field until `accept` holds or ten seconds pass.
pub async fn wait_for_raft_field(
    conn: &mut PeerConnection,
    field: &str,
    accept: impl Fn(&str) -> bool,
) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let value = raft_field(conn, field).await;
        if accept(&value) {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {field}, last {value:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll `GET key` until it returns `expected` or ten seconds pass.
pub async fn wait_for_value(conn: &mut PeerConnection, key: &str, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let reply = cmd(conn, &["GET", key]).await;
        if frame_text(&reply).as_deref() == Some(expected) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {key}, last {reply:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
