//! Flush-time table properties.
//!
//! Every flush of a shard persists one [`TableProperties`] record per column
//! family that received writes since the previous flush. Collectors observe
//! each flushed key and contribute user properties to that record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ColumnFamily, SequenceNumber};

/// Metadata persisted for one flushed table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Monotonic table number within the shard.
    pub file_number: u64,
    /// Column family the table belongs to.
    pub column_family: ColumnFamily,
    /// Smallest sequence number in the table.
    pub smallest_seqno: SequenceNumber,
    /// Largest sequence number in the table.
    pub largest_seqno: SequenceNumber,
    /// Number of entries in the table.
    pub num_entries: u64,
    /// Properties contributed by collectors.
    pub user_collected_properties: BTreeMap<String, String>,
}

/// Observes the keys of one table while it is flushed.
pub trait TablePropertiesCollector: Send {
    /// Called once per flushed key.
    fn add_user_key(&mut self, key: &[u8], seq: SequenceNumber);

    /// Called after the last key; returns the properties to persist.
    fn finish(&mut self) -> BTreeMap<String, String>;

    /// Collector name, for logging.
    fn name(&self) -> &'static str;
}

/// Creates a fresh collector for every table.
pub trait TablePropertiesCollectorFactory: Send + Sync {
    /// Create a collector for a table of the given column family.
    fn create(&self, cf: ColumnFamily) -> Box<dyn TablePropertiesCollector>;
}
