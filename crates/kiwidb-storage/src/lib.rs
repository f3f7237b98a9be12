//! KiwiDB storage - sharded engine, write batches and ordered log apply.
//!
//! Shards are sled databases with two column families. Mutations reach a
//! shard either directly or, in replicated mode, through the consensus log
//! and the [`LogApplyQueue`]. Every flush records which log index the
//! flushed data reflects, so a restarted node knows where to resume.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod flush_worker;
pub mod log_entry;
pub mod log_index;
pub mod log_queue;
pub mod properties;
pub mod proposals;
pub mod shard;
pub mod storage;
pub mod types;

pub use batch::{DirectBatch, LogSubmitter, ReplicatedBatch, WriteBatch};
pub use config::{StorageConfig, WriteMode};
pub use error::{Error, Result};
pub use log_entry::{LogEntry, LogOp, OpKind, ProposalId};
pub use log_index::{AppliedLogIndexMarker, AppliedWatermarks, LogIndexSequenceTracker};
pub use log_queue::{ApplyTicket, LogApplyQueue, WriteTask};
pub use proposals::Proposals;
pub use shard::Shard;
pub use storage::{SnapshotRow, Storage, StorageSnapshot, ENGINE_VERSION};
pub use types::{hash_field_key, hash_prefix, ColumnFamily, DataType, SequenceNumber};
