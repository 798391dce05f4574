//! The leader- and replica-side handle for one operation in flight.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use crate::error::ConsensusResult;
use crate::raft_types::OpId;
use crate::raft_types::RaftConfig;
use crate::raft_types::ReplicateMsg;
use crate::raft_types::ReplicatePayload;
use crate::time::HybridTimestamp;

/// Invoked exactly once, when the round's operation is durably replicated to
/// a majority (`Ok`) or abandoned (`Err(Aborted)` and friends).
///
/// The callback may run while consensus-internal locks are held. It must be
/// cheap and must not call back into consensus synchronously; schedule any
/// follow-up work instead.
pub type ReplicatedCallback = Box<dyn FnOnce(ConsensusResult<()>) + Send + 'static>;

/// A `Round` is the handle for one pending operation, from submission through
/// replication to notification.
///
/// It is shared (`Arc`) between the pending-operation map, the outbound
/// message queue, and the replica transaction executor, and stays live until
/// the replicated callback has been invoked.
pub struct Round {
    replicate: RwLock<ReplicateMsg>,
    /// The term this round was bound to when it was handed to Prepare, or
    /// `-1` if unbound. Replication refuses a round whose bound term is not
    /// the current one, closing the race where a leader briefly loses and
    /// regains leadership while a Prepare is in flight.
    bound_term: AtomicI64,
    replicated_cb: Mutex<Option<ReplicatedCallback>>,
}

impl Round {
    /// Create a new leader-side round for the given message, with the
    /// callback to invoke once the message is committed or abandoned.
    pub fn new(replicate: ReplicateMsg, replicated_cb: ReplicatedCallback) -> Arc<Round> {
        Arc::new(Round {
            replicate: RwLock::new(replicate),
            bound_term: AtomicI64::new(-1),
            replicated_cb: Mutex::new(Some(replicated_cb)),
        })
    }

    /// Create a replica-side round for a message received from the leader.
    /// The transaction started for it may register a callback later.
    pub fn new_replica(replicate: ReplicateMsg) -> Arc<Round> {
        Arc::new(Round {
            replicate: RwLock::new(replicate),
            bound_term: AtomicI64::new(-1),
            replicated_cb: Mutex::new(None),
        })
    }

    pub fn id(&self) -> OpId {
        self.replicate.read().unwrap().id
    }

    /// A clone of the replicate message in its current state.
    pub fn replicate_msg(&self) -> ReplicateMsg {
        self.replicate.read().unwrap().clone()
    }

    pub fn is_config_change(&self) -> bool {
        self.replicate.read().unwrap().is_config_change()
    }

    /// The new config carried by this round, if it is a config change.
    pub fn config_change(&self) -> Option<RaftConfig> {
        match &self.replicate.read().unwrap().payload {
            ReplicatePayload::ConfigChange(config) => Some(config.clone()),
            _ => None,
        }
    }

    /// Stamp the message with its assigned OpId and timestamp. Called by the
    /// leader exactly once, under the core lock; the message is immutable
    /// afterwards. A config-change payload also learns its own log index
    /// here.
    pub(crate) fn assign_id(&self, id: OpId, timestamp: HybridTimestamp) {
        let mut msg = self.replicate.write().unwrap();
        msg.id = id;
        msg.timestamp = timestamp;
        if let ReplicatePayload::ConfigChange(config) = &mut msg.payload {
            config.opid_index = id.index;
        }
    }

    pub fn bind_term(&self, term: i64) {
        self.bound_term.store(term, Ordering::SeqCst);
    }

    pub fn bound_term(&self) -> i64 {
        self.bound_term.load(Ordering::SeqCst)
    }

    /// Register the replicated callback on a replica-side round. Later
    /// registrations win; the transaction executor owns the notification.
    pub fn set_replicated_callback(&self, cb: ReplicatedCallback) {
        *self.replicated_cb.lock().unwrap() = Some(cb);
    }

    /// Fire the replicated callback with the replication outcome. Invoked at
    /// most once; subsequent calls are no-ops.
    pub fn notify_replication_finished(&self, result: ConsensusResult<()>) {
        let cb = self.replicated_cb.lock().unwrap().take();
        if let Some(cb) = cb {
            cb(result);
        }
    }
}

impl std::fmt::Debug for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Round")
            .field("id", &self.id())
            .field("bound_term", &self.bound_term())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn test_replicated_callback_fires_exactly_once() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        let round = Round::new(
            ReplicateMsg::new(ReplicatePayload::NoOp),
            Box::new(|_res| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            }),
        );
        round.notify_replication_finished(Ok(()));
        round.notify_replication_finished(Ok(()));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_assign_id_stamps_config_change_index() {
        let config = RaftConfig::bootstrap(vec![]);
        let round = Round::new_replica(ReplicateMsg::new(ReplicatePayload::ConfigChange(config)));
        round.assign_id(OpId::new(2, 7), HybridTimestamp::MIN);
        assert_eq!(round.id(), OpId::new(2, 7));
        assert_eq!(round.config_change().unwrap().opid_index, 7);
    }
}
