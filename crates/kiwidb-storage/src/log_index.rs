//! Mapping between engine sequence numbers and replicated-log indices.
//!
//! The apply path records an [`AppliedLogIndexMarker`] after committing each
//! log entry. When a shard flushes, [`LogIndexCollector`] looks up the log
//! index matching the largest sequence number in the flushed table and stores
//! it as a table property. A column family with nothing to flush gets a
//! marker too, carrying the storage-wide applied index, so shards that stop
//! receiving writes keep their watermark current. On startup
//! [`AppliedWatermarks`] folds those properties back into a
//! per-column-family watermark.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::properties::{TableProperties, TablePropertiesCollector, TablePropertiesCollectorFactory};
use crate::types::{ColumnFamily, SequenceNumber, CF_COUNT};

/// Property name under which a table stores its applied-index marker.
pub const PROPERTY_KEY: &str = "latest-applied-log-index/largest-sequence-number";

/// One (log index, sequence number) sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedLogIndexMarker {
    /// Replicated-log index of the committed entry.
    pub applied_log_index: u64,
    /// Last engine sequence number written by that entry.
    pub sequence_number: SequenceNumber,
}

impl AppliedLogIndexMarker {
    /// Render as `appliedLogIndex/sequenceNumber`.
    pub fn to_property(&self) -> String {
        format!("{}/{}", self.applied_log_index, self.sequence_number)
    }

    /// Parse the `appliedLogIndex/sequenceNumber` form.
    pub fn parse(value: &str) -> Option<Self> {
        let (index, seq) = value.split_once('/')?;
        Some(Self {
            applied_log_index: index.trim().parse().ok()?,
            sequence_number: seq.trim().parse().ok()?,
        })
    }
}

/// Ordered in-memory samples of applied log positions for one shard.
pub struct LogIndexSequenceTracker {
    /// Record every `step_length`-th update.
    step_length: u64,
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    samples: VecDeque<AppliedLogIndexMarker>,
    updates: u64,
}

impl LogIndexSequenceTracker {
    /// Create a tracker sampling every `step_length` commits.
    pub fn new(step_length: u64) -> Self {
        Self {
            step_length: step_length.max(1),
            inner: Mutex::new(TrackerState::default()),
        }
    }

    /// Record that `applied_log_index` has been committed up to `seq`.
    pub fn update(&self, applied_log_index: u64, seq: SequenceNumber) {
        let mut state = self.inner.lock();
        state.updates += 1;
        if state.updates % self.step_length != 0 {
            return;
        }
        Self::push(&mut state, applied_log_index, seq);
    }

    /// Record a sample regardless of the stride.
    pub fn force_update(&self, applied_log_index: u64, seq: SequenceNumber) {
        let mut state = self.inner.lock();
        Self::push(&mut state, applied_log_index, seq);
    }

    fn push(state: &mut TrackerState, applied_log_index: u64, seq: SequenceNumber) {
        if let Some(last) = state.samples.back() {
            if applied_log_index < last.applied_log_index || seq < last.sequence_number {
                tracing::warn!(
                    applied_log_index,
                    seq,
                    last_index = last.applied_log_index,
                    last_seq = last.sequence_number,
                    "dropping out-of-order applied index sample"
                );
                return;
            }
        }
        state.samples.push_back(AppliedLogIndexMarker {
            applied_log_index,
            sequence_number: seq,
        });
    }

    /// Greatest applied log index whose sample has a sequence number `<= seq`.
    ///
    /// Returns 0 for `seq == 0` or when no sample qualifies.
    pub fn find_applied_log_index(&self, seq: SequenceNumber) -> u64 {
        if seq == 0 {
            return 0;
        }
        let state = self.inner.lock();
        state
            .samples
            .iter()
            .rev()
            .find(|s| s.sequence_number <= seq)
            .map(|s| s.applied_log_index)
            .unwrap_or(0)
    }

    /// Drop every sample with `applied_log_index <= upto`.
    pub fn purge(&self, upto: u64) {
        let mut state = self.inner.lock();
        while state
            .samples
            .front()
            .is_some_and(|s| s.applied_log_index <= upto)
        {
            state.samples.pop_front();
        }
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Whether no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the retained samples, oldest first.
    pub fn samples(&self) -> Vec<AppliedLogIndexMarker> {
        self.inner.lock().samples.iter().copied().collect()
    }
}

/// Records the sequence range of a flushed table and embeds the matching
/// applied log index.
///
/// A table without keys is an idle column family: every entry up to
/// `idle_index` that touched it is already durable, so the marker carries
/// `idle_index` instead of a tracker lookup.
pub struct LogIndexCollector {
    tracker: Arc<LogIndexSequenceTracker>,
    smallest_seqno: SequenceNumber,
    largest_seqno: SequenceNumber,
    cf: ColumnFamily,
    idle_index: u64,
    idle_marked: Arc<Mutex<[u64; CF_COUNT]>>,
}

impl TablePropertiesCollector for LogIndexCollector {
    fn add_user_key(&mut self, _key: &[u8], seq: SequenceNumber) {
        self.smallest_seqno = self.smallest_seqno.min(seq);
        self.largest_seqno = self.largest_seqno.max(seq);
    }

    fn finish(&mut self) -> BTreeMap<String, String> {
        let applied_log_index = if self.largest_seqno == 0 {
            let mut marked = self.idle_marked.lock();
            let slot = &mut marked[self.cf.index()];
            if self.idle_index <= *slot {
                return BTreeMap::new();
            }
            *slot = self.idle_index;
            self.idle_index
        } else {
            self.tracker.find_applied_log_index(self.largest_seqno)
        };

        let marker = AppliedLogIndexMarker {
            applied_log_index,
            sequence_number: self.largest_seqno,
        };
        BTreeMap::from([(PROPERTY_KEY.to_string(), marker.to_property())])
    }

    fn name(&self) -> &'static str {
        "LogIndexTablePropertiesCollector"
    }
}

/// Hands out [`LogIndexCollector`]s bound to one shard's tracker.
///
/// Collectors are created while the shard holds its write lock, so every
/// entry at or below the storage-wide `applied_index` read at that point has
/// finished writing to the shard.
pub struct LogIndexCollectorFactory {
    tracker: Arc<LogIndexSequenceTracker>,
    applied_index: Arc<AtomicU64>,
    idle_marked: Arc<Mutex<[u64; CF_COUNT]>>,
}

impl LogIndexCollectorFactory {
    /// Create a factory for the given tracker and storage-wide applied index.
    pub fn new(tracker: Arc<LogIndexSequenceTracker>, applied_index: Arc<AtomicU64>) -> Self {
        Self {
            tracker,
            applied_index,
            idle_marked: Arc::new(Mutex::new([0; CF_COUNT])),
        }
    }
}

impl TablePropertiesCollectorFactory for LogIndexCollectorFactory {
    fn create(&self, cf: ColumnFamily) -> Box<dyn TablePropertiesCollector> {
        Box::new(LogIndexCollector {
            tracker: self.tracker.clone(),
            smallest_seqno: SequenceNumber::MAX,
            largest_seqno: 0,
            cf,
            idle_index: self.applied_index.load(Ordering::Acquire),
            idle_marked: self.idle_marked.clone(),
        })
    }
}

/// Read the applied-index marker of a table, if it carries one.
pub fn marker_of(table: &TableProperties) -> Option<AppliedLogIndexMarker> {
    table
        .user_collected_properties
        .get(PROPERTY_KEY)
        .and_then(|v| AppliedLogIndexMarker::parse(v))
}

/// Durable applied log index per column family of one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedWatermarks {
    indices: [u64; CF_COUNT],
}

impl AppliedWatermarks {
    /// Fold table properties into per-family maxima.
    pub fn from_tables(tables: &[TableProperties]) -> Self {
        let mut out = Self::default();
        for table in tables {
            if let Some(marker) = marker_of(table) {
                let slot = &mut out.indices[table.column_family.index()];
                *slot = (*slot).max(marker.applied_log_index);
            }
        }
        out
    }

    /// Watermark of one column family.
    pub fn get(&self, cf: ColumnFamily) -> u64 {
        self.indices[cf.index()]
    }

    /// Whether entry `log_index` is already durable in `cf`.
    pub fn is_applied(&self, cf: ColumnFamily, log_index: u64) -> bool {
        log_index <= self.indices[cf.index()]
    }

    /// Highest watermark over all families.
    pub fn max(&self) -> u64 {
        self.indices.iter().copied().max().unwrap_or(0)
    }

    /// Raise every family to at least `log_index`.
    pub fn raise_all(&mut self, log_index: u64) {
        for slot in self.indices.iter_mut() {
            *slot = (*slot).max(log_index);
        }
    }

    /// Per-family values, in column family order.
    pub fn as_array(&self) -> [u64; CF_COUNT] {
        self.indices
    }
}

/// File numbers of tables whose marker is dominated by a newer table of the
/// same column family, and which therefore no longer affect any watermark.
pub fn superseded_tables(tables: &[TableProperties]) -> Vec<u64> {
    let mut best: [Option<(u64, u64)>; CF_COUNT] = [None; CF_COUNT];
    for table in tables {
        let Some(marker) = marker_of(table) else { continue };
        let slot = &mut best[table.column_family.index()];
        let candidate = (marker.applied_log_index, table.file_number);
        if slot.map_or(true, |current| candidate >= current) {
            *slot = Some(candidate);
        }
    }

    tables
        .iter()
        .filter(|table| {
            marker_of(table).is_some()
                && best[table.column_family.index()]
                    .is_some_and(|(_, keep)| keep != table.file_number)
        })
        .map(|table| table.file_number)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(file_number: u64, cf: ColumnFamily, marker: Option<(u64, u64)>) -> TableProperties {
        let mut user_collected_properties = BTreeMap::new();
        if let Some((index, seq)) = marker {
            user_collected_properties.insert(PROPERTY_KEY.to_string(), format!("{index}/{seq}"));
        }
        TableProperties {
            file_number,
            column_family: cf,
            smallest_seqno: 1,
            largest_seqno: 1,
            num_entries: 1,
            user_collected_properties,
        }
    }

    #[test]
    fn test_find_zero_is_zero() {
        let tracker = LogIndexSequenceTracker::new(1);
        assert_eq!(tracker.find_applied_log_index(0), 0);
        tracker.update(5, 10);
        assert_eq!(tracker.find_applied_log_index(0), 0);
    }

    #[test]
    fn test_find_returns_last_sample_at_or_below() {
        let tracker = LogIndexSequenceTracker::new(1);
        tracker.update(1, 3);
        tracker.update(2, 7);
        tracker.update(4, 12);

        assert_eq!(tracker.find_applied_log_index(2), 0);
        assert_eq!(tracker.find_applied_log_index(3), 1);
        assert_eq!(tracker.find_applied_log_index(6), 1);
        assert_eq!(tracker.find_applied_log_index(7), 2);
        assert_eq!(tracker.find_applied_log_index(100), 4);
    }

    #[test]
    fn test_find_is_monotonic() {
        let tracker = LogIndexSequenceTracker::new(1);
        let mut seq = 0;
        for index in 1..=50u64 {
            seq += index % 4 + 1;
            tracker.update(index, seq);
        }

        let mut previous = 0;
        for seq_at in 0..=seq + 5 {
            let found = tracker.find_applied_log_index(seq_at);
            assert!(found >= previous, "seq {seq_at}: {found} < {previous}");
            previous = found;
        }
    }

    #[test]
    fn test_step_length_samples_every_nth_update() {
        let tracker = LogIndexSequenceTracker::new(3);
        for index in 1..=7u64 {
            tracker.update(index, index * 10);
        }

        let samples = tracker.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].applied_log_index, 3);
        assert_eq!(samples[1].applied_log_index, 6);
        // Between samples the answer lags behind.
        assert_eq!(tracker.find_applied_log_index(50), 3);
    }

    #[test]
    fn test_purge_removes_exactly_up_to() {
        let tracker = LogIndexSequenceTracker::new(1);
        for index in 1..=6u64 {
            tracker.update(index, index * 2);
        }

        tracker.purge(3);
        let remaining: Vec<u64> = tracker.samples().iter().map(|s| s.applied_log_index).collect();
        assert_eq!(remaining, vec![4, 5, 6]);

        tracker.purge(0);
        assert_eq!(tracker.len(), 3);

        tracker.purge(100);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_out_of_order_sample_is_dropped() {
        let tracker = LogIndexSequenceTracker::new(1);
        tracker.update(5, 50);
        tracker.update(4, 60);
        tracker.update(6, 40);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_collector_embeds_marker_for_largest_seq() {
        let tracker = Arc::new(LogIndexSequenceTracker::new(1));
        tracker.update(10, 100);
        tracker.update(11, 105);

        let factory = LogIndexCollectorFactory::new(tracker, Arc::new(AtomicU64::new(20)));
        let mut collector = factory.create(ColumnFamily::Strings);
        collector.add_user_key(b"a", 101);
        collector.add_user_key(b"b", 104);

        let props = collector.finish();
        assert_eq!(props[PROPERTY_KEY], "10/104");
    }

    #[test]
    fn test_idle_collector_marks_applied_index_once() {
        let tracker = Arc::new(LogIndexSequenceTracker::new(1));
        let applied = Arc::new(AtomicU64::new(0));
        let factory = LogIndexCollectorFactory::new(tracker, applied.clone());

        // Nothing applied yet: no marker.
        assert!(factory.create(ColumnFamily::Hashes).finish().is_empty());

        applied.store(7, Ordering::Release);
        let props = factory.create(ColumnFamily::Hashes).finish();
        assert_eq!(props[PROPERTY_KEY], "7/0");

        // Same index again is not re-recorded, other families still are.
        assert!(factory.create(ColumnFamily::Hashes).finish().is_empty());
        assert_eq!(factory.create(ColumnFamily::Strings).finish()[PROPERTY_KEY], "7/0");

        applied.store(9, Ordering::Release);
        assert_eq!(factory.create(ColumnFamily::Hashes).finish()[PROPERTY_KEY], "9/0");
    }

    #[test]
    fn test_marker_parse() {
        let marker = AppliedLogIndexMarker::parse("42/1000").unwrap();
        assert_eq!(marker.applied_log_index, 42);
        assert_eq!(marker.sequence_number, 1000);
        assert_eq!(marker.to_property(), "42/1000");

        assert!(AppliedLogIndexMarker::parse("42").is_none());
        assert!(AppliedLogIndexMarker::parse("x/1").is_none());
    }

    #[test]
    fn test_watermarks_take_max_per_family() {
        let tables = vec![
            table(1, ColumnFamily::Strings, Some((5, 10))),
            table(2, ColumnFamily::Strings, Some((9, 20))),
            table(3, ColumnFamily::Hashes, Some((7, 15))),
            table(4, ColumnFamily::Strings, Some((8, 25))),
            table(5, ColumnFamily::Hashes, None),
        ];

        let watermarks = AppliedWatermarks::from_tables(&tables);
        assert_eq!(watermarks.get(ColumnFamily::Strings), 9);
        assert_eq!(watermarks.get(ColumnFamily::Hashes), 7);
        assert_eq!(watermarks.max(), 9);
        assert!(watermarks.is_applied(ColumnFamily::Hashes, 7));
        assert!(!watermarks.is_applied(ColumnFamily::Hashes, 8));
    }

    #[test]
    fn test_superseded_tables_keep_the_max() {
        let tables = vec![
            table(1, ColumnFamily::Strings, Some((5, 10))),
            table(2, ColumnFamily::Strings, Some((9, 20))),
            table(3, ColumnFamily::Hashes, Some((7, 15))),
            table(4, ColumnFamily::Strings, Some((8, 25))),
        ];

        let mut dropped = superseded_tables(&tables);
        dropped.sort();
        assert_eq!(dropped, vec![1, 4]);

        let kept: Vec<_> = tables
            .into_iter()
            .filter(|t| !dropped.contains(&t.file_number))
            .collect();
        let watermarks = AppliedWatermarks::from_tables(&kept);
        assert_eq!(watermarks.get(ColumnFamily::Strings), 9);
        assert_eq!(watermarks.get(ColumnFamily::Hashes), 7);
    }
}
