//! The per-peer outbound message queue and commit watermark tracking.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use crate::config::ConsensusOptions;
use crate::error::ConsensusError;
use crate::error::ConsensusErrorCode;
use crate::error::ConsensusResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft_types::OpId;
use crate::raft_types::RaftPeer;
use crate::raft_types::ReplicateMsg;
use crate::ReplicaId;

/// Callbacks from the queue to the consensus core.
///
/// Implementations must not block and must not re-enter the queue; the core
/// schedules the real work onto the runtime.
pub(crate) trait PeerMessageQueueObserver: Send + Sync + 'static {
    /// The majority-replicated watermark advanced to `commit_index` with an
    /// entry of the current term at that index.
    fn notify_commit_index(&self, commit_index: i64);

    /// A response carried a term above the queue's; the leader must step down.
    fn notify_term_change(&self, term: i64);

    /// A peer can no longer be caught up from the retained buffer, or has
    /// stopped responding.
    fn notify_failed_follower(&self, uuid: &str, term: i64, reason: &str);
}

enum Notification {
    CommitIndex(i64),
    TermChange(i64),
    FailedFollower { uuid: ReplicaId, term: i64, reason: String },
}

/// Replication state for one tracked peer.
#[derive(Debug)]
struct TrackedPeer {
    peer: RaftPeer,
    /// The index of the next operation to send.
    next_index: i64,
    /// The last OpId the peer acknowledged appending.
    last_received: OpId,
    last_known_committed_index: i64,
    consecutive_failures: u64,
    /// Set when the peer was reported failed; it still receives status-only
    /// heartbeats but cannot be caught up from the buffer.
    failed: bool,
}

impl TrackedPeer {
    fn new(peer: RaftPeer, next_index: i64) -> Self {
        Self {
            peer,
            next_index,
            last_received: OpId::MIN,
            last_known_committed_index: 0,
            consecutive_failures: 0,
            failed: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueMode {
    NonLeader,
    Leader,
}

struct QueueInner {
    mode: QueueMode,
    current_term: i64,
    committed_index: i64,
    /// The last operation appended to the local log (the leader's tail).
    last_opid: OpId,
    /// Recent replicate messages, keyed by index, retained up to the memory
    /// budget so lagging peers can be caught up without log reads.
    buffer: BTreeMap<i64, ReplicateMsg>,
    /// The OpId of the entry immediately preceding the first buffered one.
    buffer_preceding: OpId,
    buffer_bytes: usize,
    /// All tracked peers, including the local one.
    peers: BTreeMap<ReplicaId, TrackedPeer>,
    committed_voters: BTreeSet<ReplicaId>,
    pending_voters: Option<BTreeSet<ReplicaId>>,
}

/// Tracks what has been sent to and acknowledged by each peer, retains recent
/// replicate messages in memory, and computes the majority-replicated
/// watermark.
///
/// Only entries of the queue's current term advance the commit index
/// (§5.4.2); earlier-term entries become committed implicitly when a
/// same-term entry reaches its majority.
pub(crate) struct PeerMessageQueue {
    options: Arc<ConsensusOptions>,
    tablet_id: String,
    local_uuid: ReplicaId,
    observer: OnceLock<Arc<dyn PeerMessageQueueObserver>>,
    inner: Mutex<QueueInner>,
}

impl PeerMessageQueue {
    pub fn new(options: Arc<ConsensusOptions>, tablet_id: String, local_uuid: ReplicaId) -> Self {
        Self {
            options,
            tablet_id,
            local_uuid,
            observer: OnceLock::new(),
            inner: Mutex::new(QueueInner {
                mode: QueueMode::NonLeader,
                current_term: 0,
                committed_index: 0,
                last_opid: OpId::MIN,
                buffer: BTreeMap::new(),
                buffer_preceding: OpId::MIN,
                buffer_bytes: 0,
                peers: BTreeMap::new(),
                committed_voters: BTreeSet::new(),
                pending_voters: None,
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn PeerMessageQueueObserver>) {
        let _ = self.observer.set(observer);
    }

    pub fn init(&self, last_opid: OpId, committed_index: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_opid = last_opid;
        inner.buffer_preceding = last_opid;
        inner.committed_index = committed_index;
    }

    /// Switch to leader mode: start tracking every config member, with the
    /// local peer already caught up and remote peers optimistically assumed
    /// at the leader's tail (they back off from there).
    pub fn set_leader_mode(
        &self,
        term: i64,
        committed_index: i64,
        local_peer: RaftPeer,
        members: Vec<RaftPeer>,
        committed_voters: BTreeSet<ReplicaId>,
        pending_voters: Option<BTreeSet<ReplicaId>>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.mode = QueueMode::Leader;
        inner.current_term = term;
        inner.committed_index = committed_index;
        inner.buffer.clear();
        inner.buffer_bytes = 0;
        inner.buffer_preceding = inner.last_opid;
        inner.committed_voters = committed_voters;
        inner.pending_voters = pending_voters;
        inner.peers.clear();
        let last = inner.last_opid;
        let mut local = TrackedPeer::new(local_peer, last.index + 1);
        local.last_received = last;
        local.last_known_committed_index = committed_index;
        inner.peers.insert(self.local_uuid.clone(), local);
        for member in members {
            if member.uuid != self.local_uuid {
                inner
                    .peers
                    .entry(member.uuid.clone())
                    .or_insert_with(|| TrackedPeer::new(member, last.index + 1));
            }
        }
    }

    pub fn set_non_leader_mode(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.mode = QueueMode::NonLeader;
        inner.peers.clear();
        inner.buffer.clear();
        inner.buffer_bytes = 0;
        inner.buffer_preceding = inner.last_opid;
    }

    /// Refresh the tracked membership after a config change while leading.
    pub fn update_config(
        &self,
        members: Vec<RaftPeer>,
        committed_voters: BTreeSet<ReplicaId>,
        pending_voters: Option<BTreeSet<ReplicaId>>,
    ) {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != QueueMode::Leader {
                return;
            }
            inner.committed_voters = committed_voters;
            inner.pending_voters = pending_voters;
            let keep: BTreeSet<ReplicaId> = members.iter().map(|m| m.uuid.clone()).collect();
            let last = inner.last_opid;
            inner.peers.retain(|uuid, _| *uuid == self.local_uuid || keep.contains(uuid));
            for member in members {
                if member.uuid != self.local_uuid {
                    inner
                        .peers
                        .entry(member.uuid.clone())
                        .or_insert_with(|| TrackedPeer::new(member, last.index + 1));
                }
            }
            // Membership may have shrunk the required majority.
            self.advance_watermark(&mut inner, &mut notifications);
        }
        self.fire(notifications);
    }

    /// Track a new operation the leader just assigned. Enforces the memory
    /// budget; peers whose catch-up entries must be evicted are failed.
    pub fn append_operation(&self, msg: ReplicateMsg) -> ConsensusResult<()> {
        let mut notifications = Vec::new();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != QueueMode::Leader {
                return Err(ConsensusError::IllegalState(
                    "queue is not in leader mode".to_string(),
                ));
            }
            let prev_last = inner.last_opid;
            let index = msg.id.index;
            let size = msg.size_bytes();
            inner.buffer_bytes += size;
            inner.last_opid = msg.id;
            inner.buffer.insert(index, msg);
            match self.enforce_memory_budget(&mut inner, &mut notifications) {
                Ok(()) => Ok(()),
                Err(error) => {
                    // Roll back: a rejected operation must not linger where a
                    // peer could replicate it.
                    inner.buffer.remove(&index);
                    inner.buffer_bytes -= size;
                    inner.last_opid = prev_last;
                    Err(error)
                }
            }
        };
        self.fire(notifications);
        result
    }

    /// The local log made an operation durable.
    pub fn local_peer_appended(&self, opid: OpId) {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != QueueMode::Leader {
                return;
            }
            if let Some(local) = inner.peers.get_mut(&self.local_uuid) {
                if opid > local.last_received {
                    local.last_received = opid;
                    local.next_index = opid.index + 1;
                }
            }
            self.advance_watermark(&mut inner, &mut notifications);
        }
        self.fire(notifications);
    }

    /// Build the next AppendEntries request for a peer. Falls back to a
    /// status-only heartbeat when the peer is caught up or beyond repair from
    /// the buffer.
    pub fn request_for_peer(&self, uuid: &str) -> ConsensusResult<(RaftPeer, AppendEntriesRequest)> {
        let mut notifications = Vec::new();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != QueueMode::Leader {
                return Err(ConsensusError::NotFound(format!(
                    "peer {} is not tracked: queue is not in leader mode",
                    uuid
                )));
            }
            let term = inner.current_term;
            let committed_index = inner.committed_index;
            let last_opid = inner.last_opid;
            let buffer_preceding = inner.buffer_preceding;
            let next = match inner.peers.get(uuid) {
                Some(tracked) => tracked.next_index,
                None => {
                    return Err(ConsensusError::NotFound(format!("peer {} is not tracked", uuid)));
                }
            };

            let (preceding_opid, ops) = if next > last_opid.index {
                // Caught up: status-only heartbeat.
                (last_opid, Vec::new())
            } else if next == buffer_preceding.index + 1 {
                (buffer_preceding, self.collect_ops(&inner, next))
            } else if let Some(prev) = inner.buffer.get(&(next - 1)) {
                let preceding = prev.id;
                (preceding, self.collect_ops(&inner, next))
            } else {
                // The entries this peer needs are no longer retained.
                let tracked = inner.peers.get_mut(uuid).unwrap();
                if !tracked.failed {
                    tracked.failed = true;
                    notifications.push(Notification::FailedFollower {
                        uuid: uuid.to_string(),
                        term,
                        reason: format!(
                            "needs operations from index {} which have fallen off the message buffer",
                            next
                        ),
                    });
                }
                (last_opid, Vec::new())
            };

            let tracked = inner.peers.get(uuid).unwrap();
            Ok((
                tracked.peer.clone(),
                AppendEntriesRequest {
                    tablet_id: self.tablet_id.clone(),
                    leader_uuid: self.local_uuid.clone(),
                    term,
                    preceding_opid,
                    committed_index,
                    ops,
                },
            ))
        };
        self.fire(notifications);
        result
    }

    /// Process a peer's response. Returns true when the peer has more
    /// operations waiting and should be driven again immediately.
    pub fn response_from_peer(&self, uuid: &str, resp: &AppendEntriesResponse) -> bool {
        let mut notifications = Vec::new();
        let has_more = 'locked: {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != QueueMode::Leader {
                break 'locked false;
            }
            if resp.term > inner.current_term {
                notifications.push(Notification::TermChange(resp.term));
                break 'locked false;
            }
            let last_opid = inner.last_opid;
            let has_more = match inner.peers.get_mut(uuid) {
                None => false,
                Some(tracked) => {
                    tracked.consecutive_failures = 0;
                    if resp.success {
                        tracked.last_received = resp.last_received;
                        tracked.next_index = resp.last_received.index + 1;
                        tracked.last_known_committed_index = resp.last_committed_index;
                        tracked.failed = false;
                        tracked.next_index <= last_opid.index
                    } else if resp.error == Some(ConsensusErrorCode::PrecedingEntryDidntMatch) {
                        // Back off against the watermark established in our
                        // own term when there is one; a stale cross-term
                        // last_received can be beyond what actually matches.
                        let fallback = if resp.last_received_current_leader > OpId::MIN {
                            resp.last_received_current_leader
                        } else {
                            resp.last_received
                        };
                        tracked.next_index = tracked.next_index.saturating_sub(1).min(fallback.index + 1).max(1);
                        true
                    } else {
                        tracing::warn!(
                            peer = uuid,
                            error = ?resp.error,
                            "AppendEntries rejected by peer"
                        );
                        false
                    }
                }
            };
            self.advance_watermark(&mut inner, &mut notifications);
            has_more
        };
        self.fire(notifications);
        has_more
    }

    /// Record a transport-level failure talking to a peer.
    pub fn peer_communication_failed(&self, uuid: &str) {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let term = inner.current_term;
            if let Some(tracked) = inner.peers.get_mut(uuid) {
                tracked.consecutive_failures += 1;
                if tracked.consecutive_failures == self.options.max_missed_heartbeats as u64 {
                    notifications.push(Notification::FailedFollower {
                        uuid: uuid.to_string(),
                        term,
                        reason: format!(
                            "no successful response in {} attempts",
                            tracked.consecutive_failures
                        ),
                    });
                }
            }
        }
        self.fire(notifications);
    }

    pub fn committed_index(&self) -> i64 {
        self.inner.lock().unwrap().committed_index
    }

    /// The lowest index acknowledged by every tracked peer; the log retains
    /// entries above it so the farthest-behind peer can still catch up.
    pub fn all_replicated_index(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        if inner.mode != QueueMode::Leader {
            return inner.committed_index;
        }
        inner
            .peers
            .values()
            .map(|p| p.last_received.index)
            .min()
            .unwrap_or(inner.committed_index)
    }

    fn collect_ops(&self, inner: &QueueInner, from_index: i64) -> Vec<ReplicateMsg> {
        inner
            .buffer
            .range(from_index..)
            .take(self.options.max_payload_ops as usize)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// The k-th largest voter `last_received` index, k = majority size. For a
    /// joint config, the watermark is the minimum over both voter sets, so
    /// both majorities are required.
    fn advance_watermark(&self, inner: &mut QueueInner, notifications: &mut Vec<Notification>) {
        fn watermark_of(inner: &QueueInner, voters: &BTreeSet<ReplicaId>) -> i64 {
            if voters.is_empty() {
                return 0;
            }
            let mut indexes: Vec<i64> = voters
                .iter()
                .map(|uuid| inner.peers.get(uuid).map(|p| p.last_received.index).unwrap_or(0))
                .collect();
            indexes.sort_unstable_by(|a, b| b.cmp(a));
            let majority = voters.len() / 2 + 1;
            indexes[majority - 1]
        }

        let mut watermark = watermark_of(inner, &inner.committed_voters);
        if let Some(pending) = &inner.pending_voters {
            watermark = watermark.min(watermark_of(inner, pending));
        }
        if watermark <= inner.committed_index {
            return;
        }
        // Only entries of the leader's own term may advance the commit index.
        match inner.buffer.get(&watermark) {
            Some(msg) if msg.id.term == inner.current_term => {
                inner.committed_index = watermark;
                notifications.push(Notification::CommitIndex(watermark));
            }
            _ => {}
        }
    }

    /// First stage of budget enforcement: evict committed entries that no
    /// live peer still needs. The buffer otherwise retains entries so late
    /// joiners can be caught up without log reads.
    fn trim_buffer(&self, inner: &mut QueueInner) {
        let min_needed = inner
            .peers
            .values()
            .filter(|p| !p.failed)
            .map(|p| p.next_index)
            .min()
            .unwrap_or(inner.last_opid.index + 1);
        let evict_below = min_needed.min(inner.committed_index + 1);
        while let Some((&index, _)) = inner.buffer.iter().next() {
            if index >= evict_below {
                break;
            }
            let msg = inner.buffer.remove(&index).unwrap();
            inner.buffer_bytes -= msg.size_bytes();
            inner.buffer_preceding = msg.id;
        }
    }

    /// Bring the buffer back under the memory budget, failing peers whose
    /// catch-up entries have to go. Uncommitted entries are never evicted; if
    /// they alone exceed the budget the queue is full.
    fn enforce_memory_budget(
        &self,
        inner: &mut QueueInner,
        notifications: &mut Vec<Notification>,
    ) -> ConsensusResult<()> {
        self.trim_buffer(inner);
        while inner.buffer_bytes > self.options.memory_limit_bytes as usize {
            let first_index = match inner.buffer.keys().next() {
                Some(&index) => index,
                None => break,
            };
            if first_index > inner.committed_index {
                return Err(ConsensusError::ServiceUnavailable(format!(
                    "message buffer full: {} bytes of uncommitted operations exceed the {} byte limit",
                    inner.buffer_bytes, self.options.memory_limit_bytes
                )));
            }
            // Fail every peer that still needed this entry, then evict it.
            let term = inner.current_term;
            for (uuid, tracked) in inner.peers.iter_mut() {
                if !tracked.failed && tracked.next_index <= first_index {
                    tracked.failed = true;
                    notifications.push(Notification::FailedFollower {
                        uuid: uuid.clone(),
                        term,
                        reason: format!(
                            "memory limit exceeded: evicting operations from index {} still needed by this peer",
                            first_index
                        ),
                    });
                }
            }
            let msg = inner.buffer.remove(&first_index).unwrap();
            inner.buffer_bytes -= msg.size_bytes();
            inner.buffer_preceding = msg.id;
        }
        Ok(())
    }

    fn fire(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let observer = match self.observer.get() {
            Some(observer) => observer.clone(),
            None => return,
        };
        for notification in notifications {
            match notification {
                Notification::CommitIndex(index) => observer.notify_commit_index(index),
                Notification::TermChange(term) => observer.notify_term_change(term),
                Notification::FailedFollower { uuid, term, reason } => {
                    observer.notify_failed_follower(&uuid, term, &reason)
                }
            }
        }
    }
}
