//! Command parsing and dispatch.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use kiwidb_raft::{generate_group_id, ConsensusNode, GROUP_ID_LEN};
use kiwidb_storage::{hash_field_key, ColumnFamily, DataType, Storage};
use redis_protocol::resp2::types::BytesFrame;

use crate::cluster::{ClusterMembershipCoordinator, DataLayout};
use crate::info;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes },
    Del { keys: Vec<Bytes> },
    HSet { key: Bytes, pairs: Vec<(Bytes, Bytes)> },
    HGet { key: Bytes, field: Bytes },
    HDel { key: Bytes, fields: Vec<Bytes> },
    HLen { key: Bytes },
    Info(Option<String>),
    ClusterInit(Option<String>),
    ClusterJoin(String),
    NodeAdd(String),
    NodeRemove(String),
    NodeSnapshot,
}

/// Parse a request frame. Empty arrays yield `None`.
pub fn parse_command(frame: BytesFrame) -> Result<Option<Command>, String> {
    let BytesFrame::Array(parts) = frame else {
        return Err("expected array frame".to_string());
    };
    if parts.is_empty() {
        return Ok(None);
    }

    let mut args = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => args.push(b),
            _ => return Err("invalid argument".to_string()),
        }
    }

    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let arity = || {
        format!(
            "wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        )
    };
    let text = |b: &Bytes| String::from_utf8_lossy(b).into_owned();

    let command = match name.as_str() {
        "PING" => match args.len() {
            1 => Command::Ping(None),
            2 => Command::Ping(Some(args[1].clone())),
            _ => return Err(arity()),
        },
        "GET" => {
            if args.len() != 2 {
                return Err(arity());
            }
            Command::Get { key: args[1].clone() }
        }
        "SET" => {
            if args.len() != 3 {
                return Err(arity());
            }
            Command::Set {
                key: args[1].clone(),
                value: args[2].clone(),
            }
        }
        "DEL" => {
            if args.len() < 2 {
                return Err(arity());
            }
            Command::Del {
                keys: args[1..].to_vec(),
            }
        }
        "HSET" => {
            if args.len() < 4 || args.len() % 2 != 0 {
                return Err(arity());
            }
            let pairs = args[2..]
                .chunks_exact(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            Command::HSet {
                key: args[1].clone(),
                pairs,
            }
        }
        "HGET" => {
            if args.len() != 3 {
                return Err(arity());
            }
            Command::HGet {
                key: args[1].clone(),
                field: args[2].clone(),
            }
        }
        "HDEL" => {
            if args.len() < 3 {
                return Err(arity());
            }
            Command::HDel {
                key: args[1].clone(),
                fields: args[2..].to_vec(),
            }
        }
        "HLEN" => {
            if args.len() != 2 {
                return Err(arity());
            }
            Command::HLen { key: args[1].clone() }
        }
        "INFO" => match args.len() {
            1 => Command::Info(None),
            2 => Command::Info(Some(text(&args[1]).to_ascii_uppercase())),
            _ => return Err(arity()),
        },
        "RAFT.CLUSTER" => {
            let sub = args.get(1).map(|s| text(s).to_ascii_uppercase());
            match sub.as_deref() {
                Some("INIT") => match args.len() {
                    2 => Command::ClusterInit(None),
                    3 => Command::ClusterInit(Some(text(&args[2]))),
                    _ => return Err(arity()),
                },
                Some("JOIN") => match args.len() {
                    3 => Command::ClusterJoin(text(&args[2])),
                    n if n > 3 => return Err("too many arguments".to_string()),
                    _ => return Err(arity()),
                },
                Some(other) => return Err(format!("unknown subcommand '{other}'")),
                None => return Err(arity()),
            }
        }
        "RAFT.NODE" => {
            let sub = args.get(1).map(|s| text(s).to_ascii_uppercase());
            match sub.as_deref() {
                // The id argument is ignored; the address identifies the node.
                Some("ADD") if args.len() == 4 => Command::NodeAdd(text(&args[3])),
                Some("REMOVE") if args.len() == 3 => Command::NodeRemove(text(&args[2])),
                Some("SNAPSHOT") if args.len() == 2 => Command::NodeSnapshot,
                Some("ADD" | "REMOVE" | "SNAPSHOT") | None => return Err(arity()),
                Some(other) => return Err(format!("unknown subcommand '{other}'")),
            }
        }
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

/// Error reply frame.
pub fn error_frame(message: impl Display) -> BytesFrame {
    BytesFrame::Error(format!("ERR {message}").into())
}

fn ok() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

fn status(text: String) -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from(text))
}

fn bulk(value: Option<Vec<u8>>) -> BytesFrame {
    match value {
        Some(v) => BytesFrame::BulkString(Bytes::from(v)),
        None => BytesFrame::Null,
    }
}

fn integer(n: usize) -> BytesFrame {
    BytesFrame::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn is_endpoint(addr: &str) -> bool {
    matches!(
        addr.rsplit_once(':'),
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok()
    )
}

/// Executes commands against storage and the consensus node.
pub struct RequestHandler {
    storage: Arc<Storage>,
    node: Arc<ConsensusNode>,
    coordinator: Arc<ClusterMembershipCoordinator>,
    layout: DataLayout,
}

impl RequestHandler {
    /// Create a handler.
    pub fn new(
        storage: Arc<Storage>,
        node: Arc<ConsensusNode>,
        coordinator: Arc<ClusterMembershipCoordinator>,
    ) -> Self {
        let layout = DataLayout::of(&storage);
        Self {
            storage,
            node,
            coordinator,
            layout,
        }
    }

    /// Execute `command` and return its reply.
    pub async fn handle(&self, command: Command) -> BytesFrame {
        match self.dispatch(command).await {
            Ok(reply) | Err(reply) => reply,
        }
    }

    async fn dispatch(&self, command: Command) -> Result<BytesFrame, BytesFrame> {
        match command {
            Command::Ping(None) => Ok(BytesFrame::SimpleString(Bytes::from_static(b"PONG"))),
            Command::Ping(Some(message)) => Ok(BytesFrame::BulkString(message)),
            Command::Get { key } => {
                let value = self.blocking(move |s| s.get(&key)).await?;
                Ok(bulk(value))
            }
            Command::Set { key, value } => {
                self.blocking(move |s| {
                    let mut batch = s.batch(s.shard_for_key(&key), DataType::String)?;
                    batch.put(ColumnFamily::Strings, key.to_vec(), value.to_vec());
                    batch.commit()
                })
                .await?;
                Ok(ok())
            }
            Command::Del { keys } => {
                let removed = self.blocking(move |s| delete_keys(s, &keys)).await?;
                Ok(integer(removed))
            }
            Command::HSet { key, pairs } => {
                let added = self.blocking(move |s| hash_set(s, &key, &pairs)).await?;
                Ok(integer(added))
            }
            Command::HGet { key, field } => {
                let value = self.blocking(move |s| s.hash_get(&key, &field)).await?;
                Ok(bulk(value))
            }
            Command::HDel { key, fields } => {
                let removed = self.blocking(move |s| hash_delete(s, &key, &fields)).await?;
                Ok(integer(removed))
            }
            Command::HLen { key } => {
                let len = self.blocking(move |s| s.hash_len(&key)).await?;
                Ok(integer(len))
            }
            Command::Info(section) => Ok(BytesFrame::BulkString(Bytes::from(self.info(section.as_deref())))),
            Command::ClusterInit(group_id) => self.cluster_init(group_id).await,
            Command::ClusterJoin(target) => self.cluster_join(&target).await,
            Command::NodeAdd(addr) => self.node_add(&addr).await,
            Command::NodeRemove(node_id) => self.node_remove(&node_id).await,
            Command::NodeSnapshot => {
                self.node.snapshot().await.map_err(error_frame)?;
                Ok(ok())
            }
        }
    }

    fn info(&self, section: Option<&str>) -> String {
        match section {
            Some("DATA") => info::data_section(&self.layout),
            Some("RAFT") => info::raft_section(&self.node.info()),
            Some(_) => String::new(),
            None => format!(
                "{}\r\n{}",
                info::data_section(&self.layout),
                info::raft_section(&self.node.info())
            ),
        }
    }

    async fn cluster_init(&self, group_id: Option<String>) -> Result<BytesFrame, BytesFrame> {
        if self.node.is_member() {
            return Err(error_frame("Already cluster member"));
        }
        let group_id = match group_id {
            Some(id) if id.chars().count() != GROUP_ID_LEN => {
                return Err(error_frame(format!(
                    "cluster id must be {GROUP_ID_LEN} characters"
                )));
            }
            Some(id) => id,
            None => generate_group_id(),
        };

        self.node
            .initialize(&group_id, true)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "cluster init failed");
                error_frame(e)
            })?;
        tracing::info!(group_id = %group_id, "initialized raft cluster");
        Ok(status(format!("OK {group_id}")))
    }

    async fn cluster_join(&self, target: &str) -> Result<BytesFrame, BytesFrame> {
        if self.node.is_member() {
            return Err(error_frame("Already cluster member"));
        }
        if !is_endpoint(target) {
            return Err(error_frame(format!("invalid ip::port: {target}")));
        }
        self.coordinator
            .request_join(target)
            .await
            .map_err(|e| BytesFrame::Error(e.reply_message().into()))?;
        Ok(ok())
    }

    async fn node_add(&self, addr: &str) -> Result<BytesFrame, BytesFrame> {
        if !is_endpoint(addr) {
            return Err(error_frame(format!("invalid ip::port: {addr}")));
        }
        self.node.add_peer(addr).await.map_err(|e| {
            tracing::warn!(peer = addr, error = %e, "failed to add peer");
            error_frame(e)
        })?;
        let group_id = self.node.group_id().unwrap_or_default();
        Ok(status(format!("OK {group_id}")))
    }

    async fn node_remove(&self, node_id: &str) -> Result<BytesFrame, BytesFrame> {
        if !self.node.is_leader() && self.node.is_member() {
            return self
                .coordinator
                .request_remove(node_id)
                .await
                .map_err(|e| BytesFrame::Error(e.reply_message().into()));
        }
        self.node.remove_peer(node_id).await.map_err(|e| {
            tracing::warn!(peer = node_id, error = %e, "failed to remove peer");
            error_frame(e)
        })?;
        Ok(ok())
    }

    /// Run a storage operation on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, BytesFrame>
    where
        F: FnOnce(&Storage) -> kiwidb_storage::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        match tokio::task::spawn_blocking(move || f(&storage)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_ambiguous() {
                    tracing::warn!(error = %e, "write outcome unknown");
                }
                Err(error_frame(e))
            }
            Err(e) => Err(error_frame(format!("internal error: {e}"))),
        }
    }
}

/// Delete string keys; returns how many existed.
fn delete_keys(storage: &Storage, keys: &[Bytes]) -> kiwidb_storage::Result<usize> {
    let mut by_shard: BTreeMap<usize, Vec<&Bytes>> = BTreeMap::new();
    for key in keys {
        if storage.get(key)?.is_some() {
            by_shard.entry(storage.shard_for_key(key)).or_default().push(key);
        }
    }

    let mut removed = 0;
    for (shard, keys) in by_shard {
        let mut batch = storage.batch(shard, DataType::String)?;
        for key in &keys {
            batch.delete(ColumnFamily::Strings, key.to_vec());
        }
        batch.commit()?;
        removed += keys.len();
    }
    Ok(removed)
}

/// Set hash fields in one batch; returns how many were new.
fn hash_set(storage: &Storage, key: &[u8], pairs: &[(Bytes, Bytes)]) -> kiwidb_storage::Result<usize> {
    let mut batch = storage.batch(storage.shard_for_key(key), DataType::Hash)?;
    let mut added = 0;
    let mut seen = std::collections::HashSet::new();
    for (field, value) in pairs {
        if seen.insert(field) && storage.hash_get(key, field)?.is_none() {
            added += 1;
        }
        batch.put(ColumnFamily::Hashes, hash_field_key(key, field), value.to_vec());
    }
    batch.commit()?;
    Ok(added)
}

/// Delete hash fields in one batch; returns how many existed.
fn hash_delete(storage: &Storage, key: &[u8], fields: &[Bytes]) -> kiwidb_storage::Result<usize> {
    let mut batch = storage.batch(storage.shard_for_key(key), DataType::Hash)?;
    let mut seen = std::collections::HashSet::new();
    for field in fields {
        if seen.insert(field) && storage.hash_get(key, field)?.is_some() {
            batch.delete(ColumnFamily::Hashes, hash_field_key(key, field));
        }
    }
    let removed = batch.len();
    batch.commit()?;
    Ok(removed)
}
