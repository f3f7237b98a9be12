//! Shard engine implementation.
//!
//! A shard is one sled database. User data lives in a single tree with the
//! column family as the first key byte. Every mutation gets a sequence
//! number; the counter is persisted in the same atomic batch as the data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sled::{Batch, Db, Tree};

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::log_entry::{LogOp, OpKind};
use crate::properties::{TableProperties, TablePropertiesCollectorFactory};
use crate::types::{ColumnFamily, SequenceNumber, CF_COUNT};

/// Tree name for user data.
const DATA_TREE: &str = "data";

/// Tree name for flushed table properties.
const PROPS_TREE: &str = "table_props";

/// Reserved first key byte for engine metadata in the data tree.
const META_PREFIX: u8 = 0xFF;

/// Key of the persisted sequence counter.
const SEQUENCE_KEY: &[u8] = b"\xFFlast_sequence";

/// Rows per sled batch when bulk-loading a shard.
const LOAD_BATCH_SIZE: usize = 1024;

/// Keys written since the last flush, per column family.
type Memtable = [Vec<(Vec<u8>, SequenceNumber)>; CF_COUNT];

/// One storage shard backed by sled.
pub struct ShardEngine {
    /// Shard number.
    index: usize,
    /// The underlying sled database.
    db: Db,
    /// Tree for user data and the sequence counter.
    data: Tree,
    /// Tree for table properties (key = file number as big-endian u64).
    props: Tree,
    /// Serializes sequence allocation, flushes and bulk loads.
    write_lock: Mutex<()>,
    /// Last sequence number handed out.
    last_sequence: AtomicU64,
    /// Next table number.
    next_file_number: AtomicU64,
    /// Unflushed keys.
    memtable: Mutex<Memtable>,
    /// Unflushed key count that triggers an inline flush.
    memtable_limit: usize,
    /// Collector factories run on every flush.
    collectors: Vec<Arc<dyn TablePropertiesCollectorFactory>>,
}

impl ShardEngine {
    /// Open or create shard `index` under the configured path.
    pub fn open(
        config: &StorageConfig,
        index: usize,
        collectors: Vec<Arc<dyn TablePropertiesCollectorFactory>>,
    ) -> Result<Self> {
        let path = config.shard_path(index);
        if !config.temporary {
            std::fs::create_dir_all(&path)?;
        }

        let db = config.to_sled_config(&path).open()?;
        let data = db.open_tree(DATA_TREE)?;
        let props = db.open_tree(PROPS_TREE)?;

        let last_sequence = match data.get(SEQUENCE_KEY)? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 0,
        };
        let next_file_number = match props.last()? {
            Some((key, _)) => decode_u64(&key)? + 1,
            None => 1,
        };

        tracing::debug!(
            shard = index,
            last_sequence,
            next_file_number,
            recovered = db.was_recovered(),
            "opened shard"
        );

        Ok(Self {
            index,
            db,
            data,
            props,
            write_lock: Mutex::new(()),
            last_sequence: AtomicU64::new(last_sequence),
            next_file_number: AtomicU64::new(next_file_number),
            memtable: Mutex::new(Default::default()),
            memtable_limit: config.memtable_entries_limit.max(1),
            collectors,
        })
    }

    /// Shard number.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Last sequence number handed out.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Atomically apply a batch of operations.
    ///
    /// Each operation consumes one sequence number. Returns the sequence
    /// number of the last operation, or the current last sequence for an
    /// empty batch.
    pub fn write(&self, ops: &[LogOp]) -> Result<SequenceNumber> {
        if ops.is_empty() {
            return Ok(self.last_sequence());
        }

        let families = ops
            .iter()
            .map(LogOp::column_family)
            .collect::<Result<Vec<_>>>()?;

        let guard = self.write_lock.lock();
        let mut seq = self.last_sequence.load(Ordering::Acquire);
        let mut batch = Batch::default();
        let mut written = Vec::with_capacity(ops.len());

        for (op, cf) in ops.iter().zip(families) {
            seq += 1;
            let key = data_key(cf, &op.key);
            match op.kind {
                OpKind::Put => batch.insert(key, op.value.clone().unwrap_or_default()),
                OpKind::Delete => batch.remove(key),
            }
            written.push((cf, op.key.clone(), seq));
        }
        batch.insert(SEQUENCE_KEY, seq.to_be_bytes().to_vec());

        self.data.apply_batch(batch)?;
        self.last_sequence.store(seq, Ordering::Release);

        let pending = {
            let mut memtable = self.memtable.lock();
            for (cf, key, seq) in written {
                memtable[cf.index()].push((key, seq));
            }
            memtable.iter().map(Vec::len).sum::<usize>()
        };

        if pending >= self.memtable_limit {
            tracing::debug!(shard = self.index, pending, "memtable limit reached, flushing");
            self.flush_locked()?;
        }
        drop(guard);

        Ok(seq)
    }

    /// Read a key.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(data_key(cf, key))?.map(|v| v.to_vec()))
    }

    /// All keys of a column family starting with `prefix`, with the prefix kept.
    pub fn scan_prefix(&self, cf: ColumnFamily, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.data.scan_prefix(data_key(cf, prefix)) {
            let (key, value) = item?;
            out.push((key[1..].to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// Make every write durable and record table properties for the
    /// column families written since the previous flush. Families without
    /// new writes get a table record only if a collector reports properties
    /// for the empty table.
    pub fn flush(&self) -> Result<Vec<TableProperties>> {
        let _guard = self.write_lock.lock();
        self.flush_locked()
    }

    /// Flush body; the caller holds `write_lock`.
    fn flush_locked(&self) -> Result<Vec<TableProperties>> {
        // Data first, so no property describes rows that are not yet on disk.
        self.db.flush()?;

        let pending = std::mem::take(&mut *self.memtable.lock());
        let mut tables = Vec::new();

        for (cf, entries) in ColumnFamily::ALL.into_iter().zip(pending) {
            let mut collectors: Vec<_> = self.collectors.iter().map(|f| f.create(cf)).collect();
            let (mut smallest_seqno, mut largest_seqno) = if entries.is_empty() {
                let seq = self.last_sequence();
                (seq, seq)
            } else {
                (SequenceNumber::MAX, 0)
            };
            for (key, seq) in &entries {
                smallest_seqno = smallest_seqno.min(*seq);
                largest_seqno = largest_seqno.max(*seq);
                for collector in collectors.iter_mut() {
                    collector.add_user_key(key, *seq);
                }
            }

            let mut user_collected_properties = BTreeMap::new();
            for collector in collectors.iter_mut() {
                user_collected_properties.extend(collector.finish());
            }
            // An idle family is only recorded when a collector has something to say.
            if entries.is_empty() && user_collected_properties.is_empty() {
                continue;
            }

            let properties = TableProperties {
                file_number: self.next_file_number.fetch_add(1, Ordering::AcqRel),
                column_family: cf,
                smallest_seqno,
                largest_seqno,
                num_entries: entries.len() as u64,
                user_collected_properties,
            };
            let bytes = serde_json::to_vec(&properties)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            self.props.insert(properties.file_number.to_be_bytes(), bytes)?;
            tables.push(properties);
        }

        if !tables.is_empty() {
            self.props.flush()?;
            tracing::debug!(shard = self.index, tables = tables.len(), "flushed shard");
        }

        Ok(tables)
    }

    /// Properties of every table recorded so far.
    pub fn properties_of_all_tables(&self) -> Result<Vec<TableProperties>> {
        let mut out = Vec::new();
        for item in self.props.iter() {
            let (_, bytes) = item?;
            let properties: TableProperties = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            out.push(properties);
        }
        Ok(out)
    }

    /// Drop table property records that no longer matter.
    pub fn remove_table_properties(&self, file_numbers: &[u64]) -> Result<()> {
        if file_numbers.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::default();
        for number in file_numbers {
            batch.remove(number.to_be_bytes().to_vec());
        }
        self.props.apply_batch(batch)?;
        Ok(())
    }

    /// Every user row, in key order.
    pub fn dump(&self) -> Result<Vec<(ColumnFamily, Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.data.iter() {
            let (key, value) = item?;
            if key.first() == Some(&META_PREFIX) {
                continue;
            }
            let cf = key
                .first()
                .and_then(|b| ColumnFamily::from_index(*b as usize))
                .ok_or_else(|| Error::InvalidData(format!("bad key in shard {}", self.index)))?;
            out.push((cf, key[1..].to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// Replace all user rows with `rows`.
    ///
    /// Loaded rows get fresh sequence numbers; the counter never moves back.
    pub fn replace_contents(
        &self,
        rows: Vec<(ColumnFamily, Vec<u8>, Vec<u8>)>,
    ) -> Result<SequenceNumber> {
        let _guard = self.write_lock.lock();

        self.data.clear()?;
        *self.memtable.lock() = Default::default();

        let mut seq = self.last_sequence.load(Ordering::Acquire);
        for chunk in rows.chunks(LOAD_BATCH_SIZE) {
            let mut batch = Batch::default();
            let mut memtable = self.memtable.lock();
            for (cf, key, value) in chunk {
                seq += 1;
                batch.insert(data_key(*cf, key), value.as_slice());
                memtable[cf.index()].push((key.clone(), seq));
            }
            batch.insert(SEQUENCE_KEY, seq.to_be_bytes().to_vec());
            self.data.apply_batch(batch)?;
        }
        if rows.is_empty() {
            self.data.insert(SEQUENCE_KEY, seq.to_be_bytes().to_vec())?;
        }
        self.last_sequence.store(seq, Ordering::Release);

        tracing::info!(shard = self.index, rows = rows.len(), last_sequence = seq, "replaced shard contents");
        Ok(seq)
    }
}

/// Encode a user key with its column family byte.
fn data_key(cf: ColumnFamily, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(cf as u8);
    out.extend_from_slice(key);
    out
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::InvalidData(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::TablePropertiesCollector;

    struct CountingFactory;

    struct CountingCollector(u64);

    impl TablePropertiesCollector for CountingCollector {
        fn add_user_key(&mut self, _key: &[u8], _seq: SequenceNumber) {
            self.0 += 1;
        }

        fn finish(&mut self) -> BTreeMap<String, String> {
            if self.0 == 0 {
                return BTreeMap::new();
            }
            BTreeMap::from([("count".to_string(), self.0.to_string())])
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    impl TablePropertiesCollectorFactory for CountingFactory {
        fn create(&self, _cf: ColumnFamily) -> Box<dyn TablePropertiesCollector> {
            Box::new(CountingCollector(0))
        }
    }

    fn open_temp() -> ShardEngine {
        ShardEngine::open(&StorageConfig::temporary(), 0, vec![Arc::new(CountingFactory)]).unwrap()
    }

    #[test]
    fn test_sequence_per_operation() {
        let engine = open_temp();
        let seq = engine
            .write(&[
                LogOp::put(ColumnFamily::Strings, b"a".to_vec(), b"1".to_vec()),
                LogOp::put(ColumnFamily::Strings, b"b".to_vec(), b"2".to_vec()),
            ])
            .unwrap();
        assert_eq!(seq, 2);

        let seq = engine
            .write(&[LogOp::delete(ColumnFamily::Strings, b"a".to_vec())])
            .unwrap();
        assert_eq!(seq, 3);
        assert_eq!(engine.get(ColumnFamily::Strings, b"a").unwrap(), None);
        assert_eq!(engine.get(ColumnFamily::Strings, b"b").unwrap(), Some(b"2".to_vec()));

        // Empty batch leaves the counter alone.
        assert_eq!(engine.write(&[]).unwrap(), 3);
    }

    #[test]
    fn test_column_families_are_separate() {
        let engine = open_temp();
        engine
            .write(&[
                LogOp::put(ColumnFamily::Strings, b"k".to_vec(), b"s".to_vec()),
                LogOp::put(ColumnFamily::Hashes, b"k".to_vec(), b"h".to_vec()),
            ])
            .unwrap();

        assert_eq!(engine.get(ColumnFamily::Strings, b"k").unwrap(), Some(b"s".to_vec()));
        assert_eq!(engine.get(ColumnFamily::Hashes, b"k").unwrap(), Some(b"h".to_vec()));
    }

    #[test]
    fn test_flush_records_properties_per_family() {
        let engine = open_temp();
        engine
            .write(&[
                LogOp::put(ColumnFamily::Strings, b"a".to_vec(), b"1".to_vec()),
                LogOp::put(ColumnFamily::Hashes, b"h".to_vec(), b"2".to_vec()),
                LogOp::put(ColumnFamily::Strings, b"b".to_vec(), b"3".to_vec()),
            ])
            .unwrap();

        let tables = engine.flush().unwrap();
        assert_eq!(tables.len(), 2);

        let strings = &tables[0];
        assert_eq!(strings.column_family, ColumnFamily::Strings);
        assert_eq!(strings.smallest_seqno, 1);
        assert_eq!(strings.largest_seqno, 3);
        assert_eq!(strings.user_collected_properties["count"], "2");

        // Nothing new to flush.
        assert!(engine.flush().unwrap().is_empty());
        assert_eq!(engine.properties_of_all_tables().unwrap().len(), 2);
    }

    /// Reports a fixed property for empty tables only.
    struct IdleFactory;

    struct IdleCollector(bool);

    impl TablePropertiesCollector for IdleCollector {
        fn add_user_key(&mut self, _key: &[u8], _seq: SequenceNumber) {
            self.0 = false;
        }

        fn finish(&mut self) -> BTreeMap<String, String> {
            if self.0 {
                BTreeMap::from([("idle".to_string(), "yes".to_string())])
            } else {
                BTreeMap::new()
            }
        }

        fn name(&self) -> &'static str {
            "idle"
        }
    }

    impl TablePropertiesCollectorFactory for IdleFactory {
        fn create(&self, _cf: ColumnFamily) -> Box<dyn TablePropertiesCollector> {
            Box::new(IdleCollector(true))
        }
    }

    #[test]
    fn test_flush_records_idle_family_when_collector_reports() {
        let engine =
            ShardEngine::open(&StorageConfig::temporary(), 0, vec![Arc::new(IdleFactory)]).unwrap();
        engine
            .write(&[LogOp::put(ColumnFamily::Strings, b"a".to_vec(), b"1".to_vec())])
            .unwrap();

        let tables = engine.flush().unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].column_family, ColumnFamily::Strings);
        assert!(tables[0].user_collected_properties.is_empty());

        let idle = &tables[1];
        assert_eq!(idle.column_family, ColumnFamily::Hashes);
        assert_eq!(idle.num_entries, 0);
        assert_eq!((idle.smallest_seqno, idle.largest_seqno), (1, 1));
        assert_eq!(idle.user_collected_properties["idle"], "yes");
    }

    #[test]
    fn test_reopen_restores_sequence_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path());

        {
            let engine = ShardEngine::open(&config, 1, vec![]).unwrap();
            engine
                .write(&[LogOp::put(ColumnFamily::Strings, b"k".to_vec(), b"v".to_vec())])
                .unwrap();
            engine.flush().unwrap();
        }

        let engine = ShardEngine::open(&config, 1, vec![]).unwrap();
        assert_eq!(engine.last_sequence(), 1);
        assert_eq!(engine.properties_of_all_tables().unwrap().len(), 1);

        engine
            .write(&[LogOp::put(ColumnFamily::Strings, b"k2".to_vec(), b"v".to_vec())])
            .unwrap();
        let tables = engine.flush().unwrap();
        assert_eq!(tables[0].file_number, 2);
    }

    #[test]
    fn test_replace_contents_keeps_sequence_monotonic() {
        let engine = open_temp();
        engine
            .write(&[LogOp::put(ColumnFamily::Strings, b"old".to_vec(), b"1".to_vec())])
            .unwrap();

        let seq = engine
            .replace_contents(vec![
                (ColumnFamily::Strings, b"new".to_vec(), b"2".to_vec()),
                (ColumnFamily::Hashes, b"h".to_vec(), b"3".to_vec()),
            ])
            .unwrap();

        assert_eq!(seq, 3);
        assert_eq!(engine.get(ColumnFamily::Strings, b"old").unwrap(), None);

        let rows = engine.dump().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (ColumnFamily::Strings, b"new".to_vec(), b"2".to_vec()));
    }

    #[test]
    fn test_scan_prefix_strips_family_byte() {
        let engine = open_temp();
        engine
            .write(&[
                LogOp::put(ColumnFamily::Hashes, b"user:1".to_vec(), b"a".to_vec()),
                LogOp::put(ColumnFamily::Hashes, b"user:2".to_vec(), b"b".to_vec()),
                LogOp::put(ColumnFamily::Strings, b"user:3".to_vec(), b"c".to_vec()),
            ])
            .unwrap();

        let rows = engine.scan_prefix(ColumnFamily::Hashes, b"user:").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"user:1".to_vec());
    }
}
