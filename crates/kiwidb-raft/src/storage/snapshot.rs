//! Snapshot building and restoration for Raft.
//!
//! A snapshot carries the full contents of every storage shard. Building one
//! flushes the shards first, so the watermarks recorded on disk are at least
//! as new as the snapshot; once it is saved the applied-index samples up to
//! its log position are no longer needed.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{RaftSnapshotBuilder, Snapshot};
use openraft::{StorageError, StorageIOError};
use serde::{Deserialize, Serialize};

use kiwidb_storage::{Storage, StorageSnapshot};

use crate::error::RaftError;
use crate::types::{LogId, NodeId, SnapshotMeta, StoredMembership, TypeConfig};

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

const META_FILE: &str = "current.meta";
const DATA_FILE: &str = "current.snap";

/// Snapshot data structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Snapshot format version.
    pub version: u32,
    /// Last log index included in snapshot.
    pub last_log_index: u64,
    /// Last log term included in snapshot.
    pub last_log_term: u64,
    /// Storage contents.
    pub storage: StorageSnapshot,
}

impl SnapshotData {
    /// Decode snapshot bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        let data: SnapshotData =
            serde_json::from_slice(bytes).map_err(|e| RaftError::Snapshot(e.to_string()))?;
        if data.version != SNAPSHOT_VERSION {
            return Err(RaftError::Snapshot(format!(
                "unsupported snapshot version {}",
                data.version
            )));
        }
        Ok(data)
    }
}

/// Builds snapshots of the storage state.
pub struct SnapshotBuilder {
    /// The storage to snapshot.
    storage: Arc<Storage>,
    /// Directory to store snapshots.
    snapshot_dir: PathBuf,
    /// Last applied log ID at snapshot time.
    last_applied: Option<LogId>,
    /// Current membership at snapshot time.
    membership: StoredMembership,
}

impl SnapshotBuilder {
    /// Create a new snapshot builder.
    pub fn new(
        storage: Arc<Storage>,
        snapshot_dir: PathBuf,
        last_applied: Option<LogId>,
        membership: StoredMembership,
    ) -> Self {
        Self {
            storage,
            snapshot_dir,
            last_applied,
            membership,
        }
    }

    /// Generate a unique snapshot ID.
    fn generate_snapshot_id(&self) -> String {
        let index = self.last_applied.map(|l| l.index).unwrap_or(0);
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("snap-{}-{}", index, timestamp)
    }

    /// Build the snapshot data.
    async fn build_snapshot_data(&self) -> Result<Vec<u8>, RaftError> {
        let storage = self.storage.clone();
        let contents = tokio::task::spawn_blocking(move || storage.snapshot_data())
            .await
            .map_err(|e| RaftError::Internal(format!("snapshot task failed: {e}")))??;

        let snapshot = SnapshotData {
            version: SNAPSHOT_VERSION,
            last_log_index: self.last_applied.map(|l| l.index).unwrap_or(0),
            last_log_term: self.last_applied.map(|l| l.leader_id.term).unwrap_or(0),
            storage: contents,
        };

        serde_json::to_vec(&snapshot).map_err(|e| RaftError::Serialization(e.to_string()))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let snapshot_id = self.generate_snapshot_id();

        let meta: SnapshotMeta = openraft::SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.membership.clone(),
            snapshot_id,
        };

        let snapshot_data = self
            .build_snapshot_data()
            .await
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;

        save_snapshot(&self.snapshot_dir, &meta, &snapshot_data)
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;

        if let Some(log_id) = self.last_applied {
            self.storage.purge_trackers(log_id.index);
        }

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(snapshot_data)),
        })
    }
}

/// Save snapshot to disk as the current snapshot.
pub fn save_snapshot(dir: &Path, meta: &SnapshotMeta, data: &[u8]) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(dir)?;

    // Data before metadata: a metadata file always describes complete data.
    let data_path = dir.join(DATA_FILE);
    let tmp = data_path.with_extension("snap.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &data_path)?;

    let meta_bytes = serde_json::to_vec(meta)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    std::fs::write(dir.join(META_FILE), meta_bytes)?;

    tracing::info!(
        snapshot_id = %meta.snapshot_id,
        bytes = data.len(),
        "saved snapshot"
    );
    Ok(())
}

/// Load the current snapshot, if one was saved.
pub fn load_snapshot(dir: &Path) -> Result<Option<(SnapshotMeta, Vec<u8>)>, std::io::Error> {
    let meta_path = dir.join(META_FILE);
    let data_path = dir.join(DATA_FILE);
    if !meta_path.exists() || !data_path.exists() {
        return Ok(None);
    }

    let meta_bytes = std::fs::read(&meta_path)?;
    let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let data = std::fs::read(&data_path)?;
    Ok(Some((meta, data)))
}

/// Replace the storage contents with a received snapshot.
pub async fn restore_snapshot(storage: &Arc<Storage>, data: &[u8]) -> Result<u64, RaftError> {
    let snapshot = SnapshotData::decode(data)?;
    tracing::info!(
        version = snapshot.version,
        index = snapshot.last_log_index,
        term = snapshot.last_log_term,
        "restoring snapshot"
    );

    let storage = storage.clone();
    let index = snapshot.last_log_index;
    tokio::task::spawn_blocking(move || storage.restore_snapshot(index, snapshot.storage))
        .await
        .map_err(|e| RaftError::Internal(format!("restore task failed: {e}")))??;
    Ok(index)
}
