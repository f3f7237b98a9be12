//! Raft state machine implementation for KiwiDB.
//!
//! Committed entries are handed, in log order, to the storage apply queue;
//! the state machine waits for every entry of a batch before it advances
//! `last_applied`.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{EntryPayload, OptionalSend, StorageError, StorageIOError};
use parking_lot::RwLock;
use sled::{Db, Tree};

use kiwidb_storage::{ApplyTicket, Storage};

use crate::error::RaftError;
use crate::storage::log_storage::SledRaftLogStorage;
use crate::storage::snapshot::{load_snapshot, restore_snapshot, save_snapshot, SnapshotBuilder};
use crate::types::{
    ClientRequest, ClientResponse, LogId, Membership, NodeId, RaftEntry, SnapshotMeta,
    StoredMembership, TypeConfig,
};

/// Tree name for state machine metadata.
const SM_STATE_TREE: &str = "raft_sm_state";

/// Keys in the state tree.
const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_MEMBERSHIP: &[u8] = b"membership";

/// Raft state machine that applies entries to KiwiDB storage.
pub struct KiwiStateMachine {
    /// Storage receiving committed entries.
    storage: Arc<Storage>,
    /// State metadata tree.
    state_tree: Tree,
    /// Last applied log ID.
    last_applied: RwLock<Option<LogId>>,
    /// Current membership configuration.
    membership: RwLock<StoredMembership>,
    /// Snapshot directory.
    snapshot_dir: PathBuf,
}

/// Pending outcome of one entry in an apply batch.
enum Pending {
    Ready(ClientResponse),
    Queued(ApplyTicket),
}

impl KiwiStateMachine {
    /// Create a new state machine.
    pub fn new(storage: Arc<Storage>, db: &Db, snapshot_dir: PathBuf) -> Result<Self, RaftError> {
        let state_tree = db.open_tree(SM_STATE_TREE)?;

        let last_applied = Self::load_last_applied(&state_tree)?;
        let membership = Self::load_membership(&state_tree)?;

        std::fs::create_dir_all(&snapshot_dir)?;

        Ok(Self {
            storage,
            state_tree,
            last_applied: RwLock::new(last_applied),
            membership: RwLock::new(membership),
            snapshot_dir,
        })
    }

    /// Load last applied log ID from state tree.
    fn load_last_applied(state_tree: &Tree) -> Result<Option<LogId>, RaftError> {
        match state_tree.get(KEY_LAST_APPLIED)? {
            Some(bytes) => {
                let log_id: LogId =
                    serde_json::from_slice(&bytes).map_err(|e| RaftError::Storage(e.to_string()))?;
                Ok(Some(log_id))
            }
            None => Ok(None),
        }
    }

    /// Load membership from state tree.
    fn load_membership(state_tree: &Tree) -> Result<StoredMembership, RaftError> {
        match state_tree.get(KEY_MEMBERSHIP)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| RaftError::Storage(e.to_string()))
            }
            None => Ok(StoredMembership::new(None, Membership::new(vec![], None))),
        }
    }

    /// Persist state to disk.
    fn persist_state(&self) -> Result<(), RaftError> {
        match *self.last_applied.read() {
            Some(log_id) => {
                let bytes = serde_json::to_vec(&log_id)
                    .map_err(|e| RaftError::Serialization(e.to_string()))?;
                self.state_tree.insert(KEY_LAST_APPLIED, bytes)?;
            }
            None => {
                self.state_tree.remove(KEY_LAST_APPLIED)?;
            }
        }

        let membership = self.membership.read().clone();
        let bytes =
            serde_json::to_vec(&membership).map_err(|e| RaftError::Serialization(e.to_string()))?;
        self.state_tree.insert(KEY_MEMBERSHIP, bytes)?;

        self.state_tree.flush()?;
        Ok(())
    }

    /// Move `last_applied` back to what storage has durably applied.
    ///
    /// `last_applied` is persisted after the apply queue reports success,
    /// but the engine only makes data durable on flush. After a crash the
    /// entries in between must be replayed; storage skips whatever its
    /// watermarks already cover.
    pub fn rewind_to_durable(
        &self,
        durable_index: u64,
        log: &SledRaftLogStorage,
    ) -> Result<(), RaftError> {
        let Some(persisted) = *self.last_applied.read() else {
            return Ok(());
        };
        if persisted.index <= durable_index {
            return Ok(());
        }

        if let Some(purged) = log.last_purged() {
            if durable_index < purged.index {
                tracing::warn!(
                    durable_index,
                    last_purged = purged.index,
                    last_applied = persisted.index,
                    "durable index is behind the purged log; keeping last applied"
                );
                return Ok(());
            }
        }

        let target = if durable_index == 0 {
            None
        } else {
            match log.log_id_at(durable_index)? {
                Some(log_id) => Some(log_id),
                None => {
                    tracing::warn!(durable_index, "durable index not found in log; keeping last applied");
                    return Ok(());
                }
            }
        };

        tracing::info!(
            from = persisted.index,
            to = durable_index,
            "rewinding last applied to the durable storage index"
        );
        *self.last_applied.write() = target;
        self.persist_state()
    }

    /// Get the current last applied log ID.
    pub fn last_applied(&self) -> Option<LogId> {
        *self.last_applied.read()
    }

    /// Get the current membership.
    pub fn membership(&self) -> StoredMembership {
        self.membership.read().clone()
    }

    /// Get the storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn produce(&self, entry: &RaftEntry, payload: Vec<u8>) -> Result<ApplyTicket, StorageError<NodeId>> {
        self.storage
            .produce(entry.log_id.index, payload)
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)).into())
    }
}

impl RaftStateMachine<TypeConfig> for KiwiStateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId>, StoredMembership), StorageError<NodeId>> {
        Ok((*self.last_applied.read(), self.membership.read().clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ClientResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = RaftEntry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut pending = Vec::new();
        let mut last = None;

        // Queue the whole batch first; the queue keeps log order.
        for entry in entries {
            last = Some(entry.log_id);
            let outcome = match &entry.payload {
                EntryPayload::Blank => Pending::Ready(ClientResponse::NoopResult),
                EntryPayload::Normal(ClientRequest::Noop) => Pending::Ready(ClientResponse::NoopResult),
                EntryPayload::Normal(ClientRequest::Apply(payload)) => {
                    Pending::Queued(self.produce(&entry, payload.clone())?)
                }
                EntryPayload::Membership(membership) => {
                    *self.membership.write() =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    Pending::Ready(ClientResponse::NoopResult)
                }
            };
            pending.push(outcome);
        }

        let mut responses = Vec::with_capacity(pending.len());
        for outcome in pending {
            let response = match outcome {
                Pending::Ready(response) => response,
                Pending::Queued(ticket) => match ticket.wait().await {
                    Ok(sequence) => ClientResponse::Applied { sequence },
                    Err(kiwidb_storage::Error::Closed) => {
                        return Err(StorageIOError::write_state_machine(AnyError::new(
                            &kiwidb_storage::Error::Closed,
                        ))
                        .into());
                    }
                    Err(e) => ClientResponse::error(e.to_string()),
                },
            };
            responses.push(response);
        }

        if last.is_some() {
            *self.last_applied.write() = last;
        }
        self.persist_state()
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder::new(
            self.storage.clone(),
            self.snapshot_dir.clone(),
            *self.last_applied.read(),
            self.membership.read().clone(),
        )
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            last_log_id = ?meta.last_log_id,
            "installing snapshot"
        );

        restore_snapshot(&self.storage, &data)
            .await
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), AnyError::new(&e)))?;

        save_snapshot(&self.snapshot_dir, meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), AnyError::new(&e)))?;

        *self.last_applied.write() = meta.last_log_id;
        *self.membership.write() = meta.last_membership.clone();

        self.persist_state()
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let loaded = load_snapshot(&self.snapshot_dir)
            .map_err(|e| StorageIOError::read_snapshot(None, AnyError::new(&e)))?;

        Ok(loaded.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwidb_storage::{ColumnFamily, DataType, LogEntry, LogOp, StorageConfig};

    fn create_test_storage() -> Arc<Storage> {
        Arc::new(Storage::open(StorageConfig::temporary().with_shard_count(1)).unwrap())
    }

    fn log_id(index: u64) -> LogId {
        LogId::new(openraft::CommittedLeaderId::new(1, 1), index)
    }

    fn apply_entry(index: u64, key: &[u8], value: &[u8]) -> RaftEntry {
        let payload = LogEntry::new(
            DataType::String,
            0,
            vec![LogOp::put(ColumnFamily::Strings, key.to_vec(), value.to_vec())],
        )
        .encode()
        .unwrap();
        RaftEntry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(ClientRequest::Apply(payload)),
        }
    }

    fn open_sm(storage: Arc<Storage>) -> (KiwiStateMachine, Db, tempfile::TempDir) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let snapshot_dir = tempfile::tempdir().unwrap();
        let sm = KiwiStateMachine::new(storage, &db, snapshot_dir.path().to_path_buf()).unwrap();
        (sm, db, snapshot_dir)
    }

    #[tokio::test]
    async fn test_state_machine_apply_noop() {
        let (mut sm, _db, _dir) = open_sm(create_test_storage());

        let entry = RaftEntry {
            log_id: log_id(1),
            payload: EntryPayload::Blank,
        };

        let responses = sm.apply(vec![entry]).await.unwrap();
        assert_eq!(responses, vec![ClientResponse::NoopResult]);

        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_apply_writes_through_queue_in_order() {
        let storage = create_test_storage();
        let (mut sm, _db, _dir) = open_sm(storage.clone());

        let responses = sm
            .apply(vec![
                apply_entry(1, b"k", b"first"),
                apply_entry(2, b"k", b"second"),
            ])
            .await
            .unwrap();

        assert_eq!(
            responses,
            vec![
                ClientResponse::Applied { sequence: 1 },
                ClientResponse::Applied { sequence: 2 },
            ]
        );
        assert_eq!(storage.get(b"k").unwrap(), Some(b"second".to_vec()));
        assert_eq!(sm.last_applied().unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_failed_entry_does_not_stop_the_batch() {
        let storage = create_test_storage();
        let (mut sm, _db, _dir) = open_sm(storage.clone());

        let broken = RaftEntry {
            log_id: log_id(1),
            payload: EntryPayload::Normal(ClientRequest::Apply(vec![1, 2, 3])),
        };
        let responses = sm
            .apply(vec![broken, apply_entry(2, b"k", b"v")])
            .await
            .unwrap();

        assert!(responses[0].is_error());
        assert_eq!(responses[1], ClientResponse::Applied { sequence: 1 });
        assert_eq!(sm.last_applied().unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_state_machine_membership() {
        let (mut sm, _db, _dir) = open_sm(create_test_storage());

        let membership = Membership::new(vec![std::collections::BTreeSet::from([1, 2, 3])], None);
        let entry = RaftEntry {
            log_id: log_id(1),
            payload: EntryPayload::Membership(membership.clone()),
        };

        sm.apply(vec![entry]).await.unwrap();

        let (_, stored_membership) = sm.applied_state().await.unwrap();
        assert_eq!(*stored_membership.membership(), membership);
    }

    #[tokio::test]
    async fn test_rewind_to_durable_index() {
        let storage = create_test_storage();
        let (mut sm, db, _dir) = open_sm(storage);
        let log = SledRaftLogStorage::open(&db).unwrap();

        let entries: Vec<_> = (1..=5).map(|i| apply_entry(i, b"k", b"v")).collect();
        sm.apply(entries).await.unwrap();
        assert_eq!(sm.last_applied().unwrap().index, 5);

        // Log entry 3 is needed to rebuild its log id.
        let tree = db.open_tree("raft_log").unwrap();
        let entry = RaftEntry {
            log_id: log_id(3),
            payload: EntryPayload::Blank,
        };
        tree.insert(3u64.to_be_bytes(), serde_json::to_vec(&entry).unwrap())
            .unwrap();

        sm.rewind_to_durable(3, &log).unwrap();
        assert_eq!(sm.last_applied().unwrap().index, 3);

        // Never moves forward.
        sm.rewind_to_durable(4, &log).unwrap();
        assert_eq!(sm.last_applied().unwrap().index, 3);

        sm.rewind_to_durable(0, &log).unwrap();
        assert_eq!(sm.last_applied(), None);
    }

    #[tokio::test]
    async fn test_state_machine_persistence() {
        let db_dir = tempfile::tempdir().unwrap();
        let snapshot_dir = tempfile::tempdir().unwrap();

        {
            let db = sled::open(db_dir.path()).unwrap();
            let mut sm =
                KiwiStateMachine::new(create_test_storage(), &db, snapshot_dir.path().to_path_buf())
                    .unwrap();
            let entry = RaftEntry {
                log_id: log_id(5),
                payload: EntryPayload::Blank,
            };
            sm.apply(vec![entry]).await.unwrap();
        }

        let db = sled::open(db_dir.path()).unwrap();
        let mut sm =
            KiwiStateMachine::new(create_test_storage(), &db, snapshot_dir.path().to_path_buf())
                .unwrap();
        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 5);
    }
}
