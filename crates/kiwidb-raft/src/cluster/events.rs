//! Consensus lifecycle events.
//!
//! openraft reports role and membership changes through its metrics
//! channel. [`RoleObserver`] turns successive metrics snapshots into
//! discrete lifecycle callbacks on a [`StateMachineEvents`] implementation.

use std::collections::BTreeSet;
use std::sync::Weak;

use openraft::{BasicNode, RaftMetrics, ServerState};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::types::{LogId, NodeId};

/// Lifecycle callbacks of the consensus state machine.
///
/// Committed entries and snapshots are handled by the state machine itself;
/// everything else a node reacts to arrives here.
pub trait StateMachineEvents: Send + Sync {
    /// This node became leader in `term`.
    fn on_leader_start(&self, term: u64);

    /// This node stopped being leader.
    fn on_leader_stop(&self);

    /// This node started following `leader`.
    fn on_start_following(&self, leader: NodeId);

    /// This node stopped following its leader.
    fn on_stop_following(&self);

    /// A membership configuration was committed.
    fn on_configuration_committed(&self, voters: &BTreeSet<NodeId>);

    /// The consensus core stopped.
    fn on_shutdown(&self);

    /// The consensus core hit a fatal error.
    fn on_error(&self, message: &str);
}

/// Tracks the last observed role and emits events on change.
#[derive(Debug)]
pub struct RoleObserver {
    node_id: NodeId,
    leading_term: Option<u64>,
    following: Option<NodeId>,
    committed_membership: Option<LogId>,
    failed: bool,
}

impl RoleObserver {
    /// Create an observer for `node_id`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            leading_term: None,
            following: None,
            committed_membership: None,
            failed: false,
        }
    }

    /// Compare `metrics` with the previous observation and emit events.
    pub fn observe(
        &mut self,
        metrics: &RaftMetrics<NodeId, BasicNode>,
        events: &dyn StateMachineEvents,
    ) {
        if let Err(fatal) = &metrics.running_state {
            if !self.failed {
                self.failed = true;
                events.on_error(&fatal.to_string());
            }
        }

        let leading = (metrics.state == ServerState::Leader).then_some(metrics.current_term);
        if leading != self.leading_term {
            if self.leading_term.is_some() {
                events.on_leader_stop();
            }
            if let Some(term) = leading {
                events.on_leader_start(term);
            }
            self.leading_term = leading;
        }

        let following = match metrics.state {
            ServerState::Follower | ServerState::Learner => {
                metrics.current_leader.filter(|leader| *leader != self.node_id)
            }
            _ => None,
        };
        if following != self.following {
            if self.following.is_some() {
                events.on_stop_following();
            }
            if let Some(leader) = following {
                events.on_start_following(leader);
            }
            self.following = following;
        }

        let membership_log_id = *metrics.membership_config.log_id();
        let applied = metrics.last_applied.map(|l| l.index);
        let committed = match (membership_log_id, applied) {
            (Some(log_id), Some(applied)) => log_id.index <= applied,
            _ => false,
        };
        if committed && membership_log_id != self.committed_membership {
            self.committed_membership = membership_log_id;
            let voters: BTreeSet<NodeId> =
                metrics.membership_config.membership().voter_ids().collect();
            events.on_configuration_committed(&voters);
        }
    }

    /// Emit the events of a node going down.
    pub fn finish(&mut self, events: &dyn StateMachineEvents) {
        if self.leading_term.take().is_some() {
            events.on_leader_stop();
        }
        if self.following.take().is_some() {
            events.on_stop_following();
        }
        events.on_shutdown();
    }
}

/// Follow the metrics channel of a Raft instance and dispatch events.
///
/// The task ends when the Raft instance is dropped or the event sink goes
/// away.
pub fn spawn_role_watcher(
    node_id: NodeId,
    mut metrics: watch::Receiver<RaftMetrics<NodeId, BasicNode>>,
    events: Weak<dyn StateMachineEvents>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut observer = RoleObserver::new(node_id);
        loop {
            let Some(sink) = events.upgrade() else {
                return;
            };
            let snapshot = metrics.borrow_and_update().clone();
            observer.observe(&snapshot, sink.as_ref());

            let stopped = matches!(snapshot.state, ServerState::Shutdown);
            drop(sink);
            if stopped || metrics.changed().await.is_err() {
                break;
            }
        }

        if let Some(sink) = events.upgrade() {
            observer.finish(sink.as_ref());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Membership, StoredMembership};
    use openraft::CommittedLeaderId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl StateMachineEvents for Recorder {
        fn on_leader_start(&self, term: u64) {
            self.events.lock().push(format!("leader_start:{term}"));
        }
        fn on_leader_stop(&self) {
            self.events.lock().push("leader_stop".into());
        }
        fn on_start_following(&self, leader: NodeId) {
            self.events.lock().push(format!("start_following:{leader}"));
        }
        fn on_stop_following(&self) {
            self.events.lock().push("stop_following".into());
        }
        fn on_configuration_committed(&self, voters: &BTreeSet<NodeId>) {
            self.events.lock().push(format!("configuration:{voters:?}"));
        }
        fn on_shutdown(&self) {
            self.events.lock().push("shutdown".into());
        }
        fn on_error(&self, message: &str) {
            self.events.lock().push(format!("error:{message}"));
        }
    }

    fn metrics(state: ServerState, term: u64, leader: Option<NodeId>) -> RaftMetrics<NodeId, BasicNode> {
        let mut m = RaftMetrics::new_initial(1);
        m.state = state;
        m.current_term = term;
        m.current_leader = leader;
        m
    }

    #[test]
    fn test_leader_transitions() {
        let recorder = Recorder::default();
        let mut observer = RoleObserver::new(1);

        observer.observe(&metrics(ServerState::Leader, 2, Some(1)), &recorder);
        assert_eq!(recorder.take(), vec!["leader_start:2"]);

        // Same state again emits nothing.
        observer.observe(&metrics(ServerState::Leader, 2, Some(1)), &recorder);
        assert!(recorder.take().is_empty());

        observer.observe(&metrics(ServerState::Leader, 3, Some(1)), &recorder);
        assert_eq!(recorder.take(), vec!["leader_stop", "leader_start:3"]);

        observer.observe(&metrics(ServerState::Follower, 4, Some(7)), &recorder);
        assert_eq!(recorder.take(), vec!["leader_stop", "start_following:7"]);
    }

    #[test]
    fn test_following_transitions() {
        let recorder = Recorder::default();
        let mut observer = RoleObserver::new(1);

        observer.observe(&metrics(ServerState::Learner, 1, None), &recorder);
        assert!(recorder.take().is_empty());

        observer.observe(&metrics(ServerState::Learner, 1, Some(5)), &recorder);
        assert_eq!(recorder.take(), vec!["start_following:5"]);

        observer.observe(&metrics(ServerState::Candidate, 2, None), &recorder);
        assert_eq!(recorder.take(), vec!["stop_following"]);

        observer.finish(&recorder);
        assert_eq!(recorder.take(), vec!["shutdown"]);
    }

    #[test]
    fn test_configuration_reported_once_when_applied() {
        let recorder = Recorder::default();
        let mut observer = RoleObserver::new(1);

        let membership_log = LogId::new(CommittedLeaderId::new(1, 1), 3);
        let mut m = metrics(ServerState::Follower, 1, None);
        m.membership_config = Arc::new(StoredMembership::new(
            Some(membership_log),
            Membership::new(vec![BTreeSet::from([1, 2])], None),
        ));
        m.last_applied = Some(LogId::new(CommittedLeaderId::new(1, 1), 2));

        observer.observe(&m, &recorder);
        assert!(recorder.take().is_empty());

        m.last_applied = Some(LogId::new(CommittedLeaderId::new(1, 1), 3));
        observer.observe(&m, &recorder);
        assert_eq!(recorder.take(), vec!["configuration:{1, 2}"]);

        observer.observe(&m, &recorder);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_finish_stops_leadership() {
        let recorder = Recorder::default();
        let mut observer = RoleObserver::new(1);
        observer.observe(&metrics(ServerState::Leader, 1, Some(1)), &recorder);
        recorder.take();

        observer.finish(&recorder);
        assert_eq!(recorder.take(), vec!["leader_stop", "shutdown"]);
    }
}
