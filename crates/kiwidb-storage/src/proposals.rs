//! Registry of local batches waiting for their log entry to be applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use dashmap::DashMap;

use crate::error::Result;
use crate::log_entry::ProposalId;

/// Pending proposals of this process.
pub struct Proposals {
    origin: u64,
    next_seq: AtomicU64,
    waiters: DashMap<ProposalId, SyncSender<Result<()>>>,
}

impl Proposals {
    /// Create a registry with a random origin tag.
    pub fn new() -> Self {
        Self::with_origin(rand::random())
    }

    /// Create a registry with a fixed origin tag.
    pub fn with_origin(origin: u64) -> Self {
        Self {
            origin,
            next_seq: AtomicU64::new(1),
            waiters: DashMap::new(),
        }
    }

    /// Origin tag stamped on every id minted here.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Mint an id and the receiver its outcome will arrive on.
    pub fn register(&self) -> (ProposalId, Receiver<Result<()>>) {
        let id = ProposalId {
            origin: self.origin,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let (tx, rx) = sync_channel(1);
        self.waiters.insert(id, tx);
        (id, rx)
    }

    /// Deliver the outcome of `id`.
    ///
    /// Unknown, foreign or already cancelled ids are ignored. Returns whether
    /// a waiter was found.
    pub fn resolve(&self, id: ProposalId, outcome: Result<()>) -> bool {
        if id.origin != self.origin {
            return false;
        }
        match self.waiters.remove(&id) {
            Some((_, tx)) => {
                // The waiter may have given up between removal and send.
                let _ = tx.try_send(outcome);
                true
            }
            None => {
                tracing::trace!(seq = id.seq, "late or unknown proposal resolution ignored");
                false
            }
        }
    }

    /// Forget `id`; a later [`Proposals::resolve`] becomes a no-op.
    pub fn cancel(&self, id: ProposalId) {
        self.waiters.remove(&id);
    }

    /// Number of proposals still waiting.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for Proposals {
    fn default() -> Self {
        Self::new()
    }
}
