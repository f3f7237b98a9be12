//! Raft log storage implementation using sled.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{LogFlushed, RaftLogReader, RaftLogStorage};
use openraft::{LogState, OptionalSend, StorageError, StorageIOError};
use parking_lot::RwLock;
use sled::{Batch, Db, Tree};

use crate::error::RaftError;
use crate::types::{LogId, NodeId, RaftEntry, TypeConfig, Vote};

/// Tree names for Raft storage in sled.
const RAFT_LOG_TREE: &str = "raft_log";
const RAFT_VOTE_TREE: &str = "raft_vote";
const RAFT_STATE_TREE: &str = "raft_state";

/// Keys in the state tree.
const KEY_LAST_PURGED: &[u8] = b"last_purged_log_id";
const KEY_COMMITTED: &[u8] = b"committed_log_id";

/// Raft log storage backed by sled.
///
/// Stores:
/// - Log entries in `raft_log` tree (key = index as big-endian u64)
/// - Vote in `raft_vote` tree
/// - State metadata in `raft_state` tree (last purged, committed)
#[derive(Clone)]
pub struct SledRaftLogStorage {
    /// Tree for log entries.
    log_tree: Tree,
    /// Tree for vote storage.
    vote_tree: Tree,
    /// Tree for state metadata.
    state_tree: Tree,
    /// Cached last purged log ID, shared with log readers.
    last_purged: Arc<RwLock<Option<LogId>>>,
}

impl SledRaftLogStorage {
    /// Open or create a new Raft log storage in the given sled database.
    pub fn open(db: &Db) -> Result<Self, RaftError> {
        let log_tree = db.open_tree(RAFT_LOG_TREE)?;
        let vote_tree = db.open_tree(RAFT_VOTE_TREE)?;
        let state_tree = db.open_tree(RAFT_STATE_TREE)?;

        let last_purged = load_log_id(&state_tree, KEY_LAST_PURGED)?;

        Ok(Self {
            log_tree,
            vote_tree,
            state_tree,
            last_purged: Arc::new(RwLock::new(last_purged)),
        })
    }

    /// Encode log index as key (big-endian for lexicographic ordering).
    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    /// Last purged log ID.
    pub fn last_purged(&self) -> Option<LogId> {
        *self.last_purged.read()
    }

    /// Log ID of the entry stored at `index`, if it is still in the log.
    pub fn log_id_at(&self, index: u64) -> Result<Option<LogId>, RaftError> {
        match self.log_tree.get(Self::log_key(index))? {
            Some(bytes) => Ok(Some(Self::deserialize_entry(&bytes)?.log_id)),
            None => Ok(None),
        }
    }

    /// Save last purged log ID to state tree.
    fn save_last_purged(&self, log_id: LogId) -> Result<(), RaftError> {
        let bytes =
            serde_json::to_vec(&log_id).map_err(|e| RaftError::Serialization(e.to_string()))?;
        self.state_tree.insert(KEY_LAST_PURGED, bytes)?;
        self.state_tree.flush()?;
        *self.last_purged.write() = Some(log_id);
        Ok(())
    }

    /// Get the last log entry's LogId.
    fn get_last_log_id(&self) -> Result<Option<LogId>, RaftError> {
        match self.log_tree.last()? {
            Some((_, value)) => Ok(Some(Self::deserialize_entry(&value)?.log_id)),
            None => Ok(None),
        }
    }

    /// Serialize an entry to bytes.
    fn serialize_entry(entry: &RaftEntry) -> Result<Vec<u8>, RaftError> {
        serde_json::to_vec(entry).map_err(|e| RaftError::Serialization(e.to_string()))
    }

    /// Deserialize an entry from bytes.
    fn deserialize_entry(bytes: &[u8]) -> Result<RaftEntry, RaftError> {
        serde_json::from_slice(bytes).map_err(|e| RaftError::Storage(e.to_string()))
    }

    /// Remove every log key in `range`.
    fn remove_range<R: RangeBounds<[u8; 8]>>(&self, range: R) -> Result<usize, RaftError> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for item in self.log_tree.range(range) {
            let (key, _) = item?;
            batch.remove(key);
            removed += 1;
        }
        self.log_tree.apply_batch(batch)?;
        self.log_tree.flush()?;
        Ok(removed)
    }
}

fn load_log_id(tree: &Tree, key: &[u8]) -> Result<Option<LogId>, RaftError> {
    match tree.get(key)? {
        Some(bytes) => {
            let log_id: LogId =
                serde_json::from_slice(&bytes).map_err(|e| RaftError::Storage(e.to_string()))?;
            Ok(Some(log_id))
        }
        None => Ok(None),
    }
}

impl RaftLogReader<TypeConfig> for SledRaftLogStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<RaftEntry>, StorageError<NodeId>> {
        use std::ops::Bound;

        let start = match range.start_bound() {
            Bound::Included(&i) => Self::log_key(i),
            Bound::Excluded(&i) => Self::log_key(i.saturating_add(1)),
            Bound::Unbounded => Self::log_key(0),
        };

        let end = match range.end_bound() {
            Bound::Included(&i) => Some(Self::log_key(i.saturating_add(1))),
            Bound::Excluded(&i) => Some(Self::log_key(i)),
            Bound::Unbounded => None,
        };

        let iter = if let Some(end_key) = end {
            self.log_tree.range(start..end_key)
        } else {
            self.log_tree.range(start..)
        };

        let mut entries = Vec::new();
        for result in iter {
            let (_, value) = result.map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            let entry = Self::deserialize_entry(&value)
                .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for SledRaftLogStorage {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = self.last_purged();
        let last_log_id = self
            .get_last_log_id()
            .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;

        Ok(LogState {
            last_purged_log_id: last_purged,
            // An empty log still remembers where it was purged to.
            last_log_id: last_log_id.or(last_purged),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError<NodeId>> {
        let bytes =
            serde_json::to_vec(vote).map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .insert(b"vote", bytes)
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .flush()
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError<NodeId>> {
        match self
            .vote_tree
            .get(b"vote")
            .map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?
        {
            Some(bytes) => {
                let vote: Vote = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?;
                Ok(Some(vote))
            }
            None => Ok(None),
        }
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), StorageError<NodeId>> {
        let Some(log_id) = committed else {
            return Ok(());
        };
        let bytes =
            serde_json::to_vec(&log_id).map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        self.state_tree
            .insert(KEY_COMMITTED, bytes)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError<NodeId>> {
        load_log_id(&self.state_tree, KEY_COMMITTED)
            .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)).into())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = RaftEntry> + Send,
        I::IntoIter: Send,
    {
        let mut batch = Batch::default();
        for entry in entries {
            let value = Self::serialize_entry(&entry)
                .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
            batch.insert(Self::log_key(entry.log_id.index).to_vec(), value);
        }

        self.log_tree
            .apply_batch(batch)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        self.log_tree
            .flush()
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        // Remove all entries with index >= log_id.index
        let removed = self
            .remove_range(Self::log_key(log_id.index)..)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        tracing::debug!(from = log_id.index, removed, "truncated raft log");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        // Remove all entries with index <= log_id.index
        let removed = self
            .remove_range(..Self::log_key(log_id.index.saturating_add(1)))
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        self.save_last_purged(log_id)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        tracing::debug!(upto = log_id.index, removed, "purged raft log");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientRequest;
    use openraft::EntryPayload;

    fn create_test_entry(index: u64, term: u64) -> RaftEntry {
        RaftEntry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Normal(ClientRequest::Noop),
        }
    }

    /// Insert entries directly into the log tree (bypasses append which needs LogFlushed).
    fn insert_entries_directly(storage: &SledRaftLogStorage, entries: &[RaftEntry]) {
        for entry in entries {
            let key = SledRaftLogStorage::log_key(entry.log_id.index);
            let value = SledRaftLogStorage::serialize_entry(entry).unwrap();
            storage.log_tree.insert(key, value).unwrap();
        }
        storage.log_tree.flush().unwrap();
    }

    fn open_temp() -> (Db, SledRaftLogStorage) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let storage = SledRaftLogStorage::open(&db).unwrap();
        (db, storage)
    }

    #[tokio::test]
    async fn test_insert_and_read() {
        let (_db, mut storage) = open_temp();

        let entries = vec![
            create_test_entry(1, 1),
            create_test_entry(2, 1),
            create_test_entry(3, 1),
        ];
        insert_entries_directly(&storage, &entries);

        let read_entries = storage.try_get_log_entries(1..4).await.unwrap();
        assert_eq!(read_entries.len(), 3);
        assert_eq!(read_entries[0].log_id.index, 1);
        assert_eq!(read_entries[2].log_id.index, 3);
        assert_eq!(storage.log_id_at(2).unwrap().map(|l| l.index), Some(2));
        assert_eq!(storage.log_id_at(9).unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncate() {
        let (_db, mut storage) = open_temp();

        let entries: Vec<_> = (1..=4).map(|i| create_test_entry(i, 1)).collect();
        insert_entries_directly(&storage, &entries);

        let log_id = LogId::new(openraft::CommittedLeaderId::new(1, 1), 3);
        storage.truncate(log_id).await.unwrap();

        let read_entries = storage.try_get_log_entries(1..).await.unwrap();
        assert_eq!(read_entries.len(), 2);
    }

    #[tokio::test]
    async fn test_purge() {
        let (_db, mut storage) = open_temp();

        let entries: Vec<_> = (1..=4).map(|i| create_test_entry(i, 1)).collect();
        insert_entries_directly(&storage, &entries);

        let log_id = LogId::new(openraft::CommittedLeaderId::new(1, 1), 2);
        storage.purge(log_id).await.unwrap();

        let read_entries = storage.try_get_log_entries(1..).await.unwrap();
        assert_eq!(read_entries.len(), 2);
        assert_eq!(read_entries[0].log_id.index, 3);

        let log_state = storage.get_log_state().await.unwrap();
        assert_eq!(log_state.last_purged_log_id, Some(log_id));
    }

    #[tokio::test]
    async fn test_purged_empty_log_reports_purge_point() {
        let (_db, mut storage) = open_temp();
        insert_entries_directly(&storage, &[create_test_entry(1, 1)]);

        let log_id = LogId::new(openraft::CommittedLeaderId::new(1, 1), 1);
        storage.purge(log_id).await.unwrap();

        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id));
    }

    #[tokio::test]
    async fn test_vote_and_committed_persistence() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let mut storage = SledRaftLogStorage::open(&db).unwrap();

        assert!(storage.read_vote().await.unwrap().is_none());
        assert!(storage.read_committed().await.unwrap().is_none());

        let vote = Vote::new(1, 5);
        storage.save_vote(&vote).await.unwrap();
        let committed = LogId::new(openraft::CommittedLeaderId::new(1, 5), 7);
        storage.save_committed(Some(committed)).await.unwrap();

        drop(storage);
        let mut storage2 = SledRaftLogStorage::open(&db).unwrap();
        assert_eq!(storage2.read_vote().await.unwrap(), Some(vote));
        assert_eq!(storage2.read_committed().await.unwrap(), Some(committed));
    }

    #[tokio::test]
    async fn test_log_state() {
        let (_db, mut storage) = open_temp();

        let state = storage.get_log_state().await.unwrap();
        assert!(state.last_purged_log_id.is_none());
        assert!(state.last_log_id.is_none());

        insert_entries_directly(&storage, &[create_test_entry(1, 1)]);

        let state = storage.get_log_state().await.unwrap();
        assert!(state.last_purged_log_id.is_none());
        assert_eq!(state.last_log_id.unwrap().index, 1);
    }
}
