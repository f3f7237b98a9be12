//! Write batches.
//!
//! A [`WriteBatch`] collects the Put/Delete set of one logical mutation. The
//! strategy is fixed per shard when storage opens: [`DirectBatch`] commits
//! into the local engine, [`ReplicatedBatch`] submits the batch to the
//! replicated log and waits until the apply path has written it.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::log_entry::{LogEntry, LogOp};
use crate::proposals::Proposals;
use crate::shard::Shard;
use crate::types::{ColumnFamily, DataType};

/// Accepts encoded log entries for replication.
///
/// `submit` only reports whether the entry was accepted; the commit itself
/// is observed through the apply path.
pub trait LogSubmitter: Send + Sync {
    /// Submit one encoded [`LogEntry`].
    fn submit(&self, entry: Vec<u8>) -> Result<()>;
}

/// Batch committed straight into the shard engine.
pub struct DirectBatch {
    shard: Arc<Shard>,
    ops: Vec<LogOp>,
}

impl DirectBatch {
    pub(crate) fn new(shard: Arc<Shard>) -> Self {
        Self {
            shard,
            ops: Vec::new(),
        }
    }

    fn commit(self) -> Result<()> {
        self.shard.write_direct(&self.ops)?;
        Ok(())
    }
}

/// Batch routed through the replicated log.
pub struct ReplicatedBatch {
    shard: u32,
    data_type: DataType,
    ops: Vec<LogOp>,
    submitter: Option<Arc<dyn LogSubmitter>>,
    proposals: Arc<Proposals>,
    timeout: Duration,
    max_entry_size: usize,
}

impl ReplicatedBatch {
    pub(crate) fn new(
        shard: u32,
        data_type: DataType,
        submitter: Option<Arc<dyn LogSubmitter>>,
        proposals: Arc<Proposals>,
        timeout: Duration,
        max_entry_size: usize,
    ) -> Self {
        Self {
            shard,
            data_type,
            ops: Vec::new(),
            submitter,
            proposals,
            timeout,
            max_entry_size,
        }
    }

    fn commit(self) -> Result<()> {
        let submitter = self.submitter.ok_or(Error::NotInitialized)?;

        let (id, rx) = self.proposals.register();
        let entry = LogEntry::new(self.data_type, self.shard, self.ops).with_proposal(id);
        let bytes = match entry.encode() {
            Ok(bytes) if bytes.len() > self.max_entry_size => {
                self.proposals.cancel(id);
                return Err(Error::EntryTooLarge {
                    size: bytes.len(),
                    limit: self.max_entry_size,
                });
            }
            Ok(bytes) => bytes,
            Err(e) => {
                self.proposals.cancel(id);
                return Err(e);
            }
        };

        if let Err(e) = submitter.submit(bytes) {
            self.proposals.cancel(id);
            return Err(e);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                self.proposals.cancel(id);
                tracing::warn!(
                    origin = id.origin,
                    seq = id.seq,
                    timeout = ?self.timeout,
                    "replicated write not confirmed in time"
                );
                Err(Error::Timeout(self.timeout))
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }
}

/// A write batch with its commit strategy.
pub enum WriteBatch {
    /// Local commit.
    Direct(DirectBatch),
    /// Replicated commit.
    Replicated(ReplicatedBatch),
}

impl WriteBatch {
    fn ops_mut(&mut self) -> &mut Vec<LogOp> {
        match self {
            WriteBatch::Direct(b) => &mut b.ops,
            WriteBatch::Replicated(b) => &mut b.ops,
        }
    }

    fn ops(&self) -> &[LogOp] {
        match self {
            WriteBatch::Direct(b) => &b.ops,
            WriteBatch::Replicated(b) => &b.ops,
        }
    }

    /// Queue a put.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops_mut().push(LogOp::put(cf, key, value));
    }

    /// Queue a delete.
    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) {
        self.ops_mut().push(LogOp::delete(cf, key));
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops().is_empty()
    }

    /// Whether this batch goes through the replicated log.
    pub fn is_replicated(&self) -> bool {
        matches!(self, WriteBatch::Replicated(_))
    }

    /// Commit every queued operation atomically.
    ///
    /// An empty batch succeeds without side effects. For replicated batches
    /// this blocks the calling thread until the entry is applied or the
    /// timeout expires; [`Error::Timeout`] means the outcome is unknown.
    pub fn commit(self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        match self {
            WriteBatch::Direct(b) => b.commit(),
            WriteBatch::Replicated(b) => b.commit(),
        }
    }
}
