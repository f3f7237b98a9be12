//! The replicated unit of a write batch.
//!
//! A [`LogEntry`] carries every operation of one committed batch. It is
//! encoded with rkyv and travels through the consensus log as opaque bytes;
//! only the apply path decodes it again.

use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use crate::error::{Error, Result};
use crate::types::{ColumnFamily, DataType};

/// Kind of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum OpKind {
    /// Insert or overwrite a key.
    Put,
    /// Remove a key.
    Delete,
}

/// One Put or Delete inside a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct LogOp {
    /// Put or Delete.
    pub kind: OpKind,
    /// Column family index.
    pub cf: u8,
    /// Key within the column family.
    pub key: Vec<u8>,
    /// Value for puts.
    pub value: Option<Vec<u8>>,
}

impl LogOp {
    /// Create a put operation.
    pub fn put(cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OpKind::Put,
            cf: cf as u8,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Create a delete operation.
    pub fn delete(cf: ColumnFamily, key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OpKind::Delete,
            cf: cf as u8,
            key: key.into(),
            value: None,
        }
    }

    /// The column family this operation targets.
    pub fn column_family(&self) -> Result<ColumnFamily> {
        ColumnFamily::from_index(self.cf as usize)
            .ok_or_else(|| Error::InvalidData(format!("unknown column family {}", self.cf)))
    }
}

/// Identifies the local batch waiting on an entry.
///
/// `origin` is random per process, so a proposal id minted on one node never
/// matches a waiter on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct ProposalId {
    /// Process-unique origin tag.
    pub origin: u64,
    /// Sequence within the origin.
    pub seq: u64,
}

/// A batch of operations replicated as one consensus log entry.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct LogEntry {
    /// Data-type discriminant of the command that produced the batch.
    pub data_type: DataType,
    /// Target shard.
    pub shard: u32,
    /// Operations in batch order.
    pub ops: Vec<LogOp>,
    /// Waiting local batch, if any.
    pub proposal: Option<ProposalId>,
}

impl LogEntry {
    /// Create an entry without a waiting proposal.
    pub fn new(data_type: DataType, shard: u32, ops: Vec<LogOp>) -> Self {
        Self {
            data_type,
            shard,
            ops,
            proposal: None,
        }
    }

    /// Attach the proposal that waits for this entry.
    pub fn with_proposal(mut self, id: ProposalId) -> Self {
        self.proposal = Some(id);
        self
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from bytes produced by [`LogEntry::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // Log payloads come back from the raft log without alignment guarantees.
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<LogEntry, rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}
