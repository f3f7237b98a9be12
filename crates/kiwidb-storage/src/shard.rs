//! A shard: engine, applied-index tracker and watermarks.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::{StorageConfig, WriteMode};
use crate::engine::ShardEngine;
use crate::error::Result;
use crate::log_entry::{LogEntry, LogOp};
use crate::log_index::{
    superseded_tables, AppliedWatermarks, LogIndexCollectorFactory, LogIndexSequenceTracker,
};
use crate::types::{ColumnFamily, SequenceNumber};

/// One storage shard.
///
/// The engine sits behind a reader/writer lock: writes, reads and dumps take
/// the shared side, replacing the shard contents from a snapshot takes the
/// exclusive side.
pub struct Shard {
    index: usize,
    mode: WriteMode,
    engine: RwLock<ShardEngine>,
    tracker: Arc<LogIndexSequenceTracker>,
    watermarks: RwLock<AppliedWatermarks>,
}

impl Shard {
    /// Open shard `index` and recover its watermarks from table properties.
    ///
    /// `applied_index` is the highest log index the storage has finished
    /// applying; flushes stamp it on column families with nothing pending.
    pub fn open(config: &StorageConfig, index: usize, applied_index: Arc<AtomicU64>) -> Result<Self> {
        let tracker = Arc::new(LogIndexSequenceTracker::new(config.log_index_step));
        let factory = Arc::new(LogIndexCollectorFactory::new(tracker.clone(), applied_index));
        let engine = ShardEngine::open(config, index, vec![factory])?;

        let tables = engine.properties_of_all_tables()?;
        let watermarks = AppliedWatermarks::from_tables(&tables);
        tracing::info!(
            shard = index,
            tables = tables.len(),
            strings = watermarks.get(ColumnFamily::Strings),
            hashes = watermarks.get(ColumnFamily::Hashes),
            "recovered applied log index watermarks"
        );

        Ok(Self {
            index,
            mode: config.write_mode,
            engine: RwLock::new(engine),
            tracker,
            watermarks: RwLock::new(watermarks),
        })
    }

    /// Shard number.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Commit strategy of this shard.
    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Shared access to the engine.
    pub fn engine(&self) -> RwLockReadGuard<'_, ShardEngine> {
        self.engine.read()
    }

    /// Applied-index tracker of this shard.
    pub fn tracker(&self) -> &Arc<LogIndexSequenceTracker> {
        &self.tracker
    }

    /// Current watermarks.
    pub fn watermarks(&self) -> AppliedWatermarks {
        *self.watermarks.read()
    }

    /// Commit a batch locally without a log index.
    pub fn write_direct(&self, ops: &[LogOp]) -> Result<SequenceNumber> {
        self.engine.read().write(ops)
    }

    /// Commit a replicated entry.
    ///
    /// Operations on column families whose watermark already covers
    /// `log_index` are skipped; they are durable from before a restart.
    pub fn apply_entry(&self, log_index: u64, entry: &LogEntry) -> Result<SequenceNumber> {
        let watermarks = self.watermarks();
        let mut ops = Vec::with_capacity(entry.ops.len());
        for op in &entry.ops {
            if watermarks.is_applied(op.column_family()?, log_index) {
                continue;
            }
            ops.push(op.clone());
        }

        let engine = self.engine.read();
        if ops.len() < entry.ops.len() {
            tracing::debug!(
                shard = self.index,
                log_index,
                skipped = entry.ops.len() - ops.len(),
                "skipping operations below the durable watermark"
            );
        }
        let seq = engine.write(&ops)?;
        if !ops.is_empty() {
            self.tracker.update(log_index, seq);
        }
        Ok(seq)
    }

    /// Flush the engine and drop superseded table properties.
    pub fn flush(&self) -> Result<()> {
        let engine = self.engine.read();
        engine.flush()?;
        let superseded = superseded_tables(&engine.properties_of_all_tables()?);
        engine.remove_table_properties(&superseded)
    }

    /// Every user row.
    pub fn dump(&self) -> Result<Vec<(ColumnFamily, Vec<u8>, Vec<u8>)>> {
        self.engine.read().dump()
    }

    /// Replace the shard contents with snapshot rows reflecting `applied_index`.
    ///
    /// The restored rows are flushed immediately so their table properties
    /// carry `applied_index` as the new watermark.
    pub fn restore(
        &self,
        applied_index: u64,
        rows: Vec<(ColumnFamily, Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let engine = self.engine.write();
        let seq = engine.replace_contents(rows)?;

        self.tracker.purge(u64::MAX);
        self.tracker.force_update(applied_index, seq);
        engine.flush()?;
        let superseded = superseded_tables(&engine.properties_of_all_tables()?);
        engine.remove_table_properties(&superseded)?;

        let mut watermarks = self.watermarks.write();
        *watermarks = AppliedWatermarks::default();
        watermarks.raise_all(applied_index);
        Ok(())
    }
}
