//! Multi-shard storage facade.
//!
//! `Storage` owns the shards, the proposal registry and the apply queue. It
//! is the single entry point for the command layer (reads and write
//! batches) and for the consensus layer (entry delivery, snapshots,
//! recovery watermarks).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::batch::{DirectBatch, LogSubmitter, ReplicatedBatch, WriteBatch};
use crate::config::{StorageConfig, WriteMode};
use crate::error::{Error, Result};
use crate::flush_worker::FlushWorker;
use crate::log_entry::LogEntry;
use crate::log_queue::{ApplyTicket, LogApplyQueue, WriteTask};
use crate::proposals::Proposals;
use crate::shard::Shard;
use crate::types::{hash_field_key, hash_prefix, ColumnFamily, DataType, SequenceNumber};

/// Engine version reported to peers during the join handshake.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One row of a shard snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub cf: ColumnFamily,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Full contents of every shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Rows per shard, in shard order.
    pub shards: Vec<Vec<SnapshotRow>>,
}

/// Sharded storage with both write strategies.
pub struct Storage {
    config: StorageConfig,
    shards: Arc<Vec<Arc<Shard>>>,
    applied_index: Arc<AtomicU64>,
    proposals: Arc<Proposals>,
    submitter: RwLock<Option<Weak<dyn LogSubmitter>>>,
    queue: LogApplyQueue,
    flusher: Option<FlushWorker>,
}

impl Storage {
    /// Open every shard, recover watermarks and start the apply queue.
    pub fn open(config: StorageConfig) -> Result<Self> {
        if !config.temporary {
            std::fs::create_dir_all(&config.path)?;
        }

        let applied_index = Arc::new(AtomicU64::new(0));
        let shards = (0..config.shard_count)
            .map(|index| Shard::open(&config, index, applied_index.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let shards = Arc::new(shards);
        let proposals = Arc::new(Proposals::new());

        let queue = {
            let shards = shards.clone();
            let applied_index = applied_index.clone();
            let proposals = proposals.clone();
            LogApplyQueue::start(Box::new(move |task: &WriteTask| {
                commit_task(&shards, &applied_index, &proposals, task)
            }))?
        };

        let flusher = config
            .flush_interval
            .map(|interval| FlushWorker::start(shards.clone(), interval));

        tracing::info!(
            path = %config.path.display(),
            shards = config.shard_count,
            databases = config.databases,
            mode = ?config.write_mode,
            "storage opened"
        );

        Ok(Self {
            config,
            shards,
            applied_index,
            proposals,
            submitter: RwLock::new(None),
            queue,
            flusher,
        })
    }

    /// Configuration the storage was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of logical databases.
    pub fn databases(&self) -> usize {
        self.config.databases
    }

    /// Engine version string.
    pub fn engine_version(&self) -> &'static str {
        ENGINE_VERSION
    }

    /// Whether writes go through the replicated log.
    pub fn is_replicated(&self) -> bool {
        self.config.write_mode == WriteMode::Replicated
    }

    /// Shard `index`.
    pub fn shard(&self, index: usize) -> Result<&Arc<Shard>> {
        self.shards.get(index).ok_or(Error::NoSuchShard(index))
    }

    /// Shard owning `key`.
    pub fn shard_for_key(&self, key: &[u8]) -> usize {
        let hash = blake3::hash(key);
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.shards.len() as u64) as usize
    }

    /// New write batch for `shard` using the shard's commit strategy.
    pub fn batch(&self, shard: usize, data_type: DataType) -> Result<WriteBatch> {
        let target = self.shard(shard)?;
        Ok(match target.mode() {
            WriteMode::Direct => WriteBatch::Direct(DirectBatch::new(target.clone())),
            WriteMode::Replicated => WriteBatch::Replicated(ReplicatedBatch::new(
                shard as u32,
                data_type,
                self.log_submitter(),
                self.proposals.clone(),
                self.config.apply_timeout,
                self.config.max_entry_size,
            )),
        })
    }

    /// Read a string value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shard(self.shard_for_key(key))?
            .engine()
            .get(ColumnFamily::Strings, key)
    }

    /// Read one hash field.
    pub fn hash_get(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shard(self.shard_for_key(key))?
            .engine()
            .get(ColumnFamily::Hashes, &hash_field_key(key, field))
    }

    /// Number of fields stored under a hash key.
    pub fn hash_len(&self, key: &[u8]) -> Result<usize> {
        Ok(self
            .shard(self.shard_for_key(key))?
            .engine()
            .scan_prefix(ColumnFamily::Hashes, &hash_prefix(key))?
            .len())
    }

    /// Registry of batches waiting for their entry to apply.
    pub fn proposals(&self) -> &Arc<Proposals> {
        &self.proposals
    }

    /// Route replicated batches to `submitter`.
    pub fn bind_log_submitter(&self, submitter: Weak<dyn LogSubmitter>) {
        *self.submitter.write() = Some(submitter);
    }

    /// Detach the submitter; replicated batches fail with `NotInitialized`.
    pub fn unbind_log_submitter(&self) {
        self.submitter.write().take();
    }

    fn log_submitter(&self) -> Option<Arc<dyn LogSubmitter>> {
        self.submitter.read().as_ref().and_then(Weak::upgrade)
    }

    /// Hand a committed entry to the apply queue.
    pub fn produce(&self, log_index: u64, entry: Vec<u8>) -> Result<ApplyTicket> {
        self.queue.produce(log_index, entry)
    }

    /// Flush every shard.
    pub fn flush_all(&self) -> Result<()> {
        for shard in self.shards.iter() {
            shard.flush()?;
        }
        Ok(())
    }

    /// Highest log index applied in this process.
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    /// Highest log index known to be durable in every shard.
    ///
    /// Each shard contributes the maximum watermark over its column families,
    /// since a flush covers all families at once. A shard without any
    /// watermark holds the result at 0.
    pub fn durable_applied_index(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.watermarks().max())
            .min()
            .unwrap_or(0)
    }

    /// Drop tracker samples up to `log_index` in every shard.
    pub fn purge_trackers(&self, log_index: u64) {
        for shard in self.shards.iter() {
            shard.tracker().purge(log_index);
        }
    }

    /// Capture the contents of every shard after flushing them.
    pub fn snapshot_data(&self) -> Result<StorageSnapshot> {
        self.flush_all()?;
        let mut shards = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            let rows = shard
                .dump()?
                .into_iter()
                .map(|(cf, key, value)| SnapshotRow { cf, key, value })
                .collect();
            shards.push(rows);
        }
        Ok(StorageSnapshot { shards })
    }

    /// Replace the contents of every shard with `snapshot`, which reflects
    /// the log up to `applied_index`.
    pub fn restore_snapshot(&self, applied_index: u64, snapshot: StorageSnapshot) -> Result<()> {
        if snapshot.shards.len() != self.shards.len() {
            return Err(Error::InvalidData(format!(
                "snapshot has {} shards, local storage has {}",
                snapshot.shards.len(),
                self.shards.len()
            )));
        }

        for (shard, rows) in self.shards.iter().zip(snapshot.shards) {
            let rows = rows.into_iter().map(|r| (r.cf, r.key, r.value)).collect();
            shard.restore(applied_index, rows)?;
        }
        // Families the snapshot left empty get their marker from this flush.
        self.applied_index.store(applied_index, Ordering::Release);
        self.flush_all()?;
        tracing::info!(applied_index, "restored storage from snapshot");
        Ok(())
    }

    /// Drain the apply queue, stop background work and flush.
    pub fn shutdown(&self) -> Result<()> {
        self.unbind_log_submitter();
        self.queue.stop();
        if let Some(flusher) = &self.flusher {
            flusher.stop();
        }
        self.flush_all()?;
        tracing::info!("storage shut down");
        Ok(())
    }
}

/// Commit callback of the apply queue.
///
/// Writes the entry to its shard and hands the true storage status to the
/// waiting batch, if it lives in this process.
fn commit_task(
    shards: &[Arc<Shard>],
    applied_index: &AtomicU64,
    proposals: &Proposals,
    task: &WriteTask,
) -> Result<SequenceNumber> {
    let entry = LogEntry::decode(&task.entry)?;
    let result = shards
        .get(entry.shard as usize)
        .ok_or(Error::NoSuchShard(entry.shard as usize))
        .and_then(|shard| shard.apply_entry(task.log_index, &entry));
    if result.is_ok() {
        applied_index.fetch_max(task.log_index, Ordering::AcqRel);
    }

    if let Some(id) = entry.proposal {
        let outcome = match &result {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::ApplyFailed(e.to_string())),
        };
        proposals.resolve(id, outcome);
    }

    result
}
