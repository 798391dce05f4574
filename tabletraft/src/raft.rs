//! Wire-level request and response types exchanged between peers.

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConsensusErrorCode;
use crate::raft_types::OpId;
use crate::raft_types::RaftConfig;
use crate::raft_types::RaftPeer;
use crate::raft_types::ReplicateMsg;
use crate::ReplicaId;

/// An RPC sent by the leader to replicate log entries; also used as a
/// heartbeat when `ops` is empty (a status-only request, passing watermarks
/// back and forth).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The tablet whose state machine this request updates.
    pub tablet_id: String,
    /// The uuid of the sending leader.
    pub leader_uuid: ReplicaId,
    /// The leader's term.
    pub term: i64,
    /// The OpId of the entry immediately preceding `ops` in the leader's log.
    pub preceding_opid: OpId,
    /// The index of the latest operation considered committed by consensus.
    pub committed_index: i64,
    /// Zero or more operations to replicate, in leader log order.
    pub ops: Vec<ReplicateMsg>,
}

impl AppendEntriesRequest {
    pub fn is_status_only(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub responder_uuid: ReplicaId,
    /// The responder's current term. A term above the request's tells the
    /// leader to step down.
    pub term: i64,
    pub success: bool,
    /// Wire-level rejection reason, reported to higher layers verbatim.
    pub error: Option<ConsensusErrorCode>,
    /// The last OpId the responder has appended to its log, across all terms.
    pub last_received: OpId,
    /// The last OpId received from the *current* leader. After a leader
    /// change this restarts from `OpId::MIN`, which is the watermark a new
    /// leader must back off against.
    pub last_received_current_leader: OpId,
    /// The responder's committed index, for log-retention bookkeeping.
    pub last_committed_index: i64,
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub tablet_id: String,
    pub candidate_uuid: ReplicaId,
    /// The term the candidate is campaigning in. For a pre-election this is
    /// the term the candidate *would* move to; no voter persists anything.
    pub term: i64,
    /// The last OpId in the candidate's log; voters deny candidates whose
    /// log is behind their own (§5.4.1).
    pub last_logged_opid: OpId,
    /// True for the non-binding pre-vote phase.
    pub is_pre_election: bool,
    /// True when voters should vote even if they believe a leader is alive;
    /// used for fast leader handoff.
    pub ignore_live_leader: bool,
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub responder_uuid: ReplicaId,
    pub term: i64,
    pub vote_granted: bool,
    pub error: Option<ConsensusErrorCode>,
}

/// Modes for `start_election`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionMode {
    /// A normal leader election. Peers will not vote for this node if they
    /// believe a leader is alive.
    Normal,
    /// A pre-election: peers respond as they would for a normal election but
    /// the votes are not binding and nothing is persisted.
    PreElection,
    /// Peers vote even if they think a leader is alive. Used for a fast
    /// handoff between a leader and one of its replicas.
    ElectEvenIfLeaderIsAlive,
}

/// Reasons for `start_election`, used for logging and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionReason {
    /// The config has a single voter which has just started up.
    InitialSingleNodeElection,
    /// The failure-detection window expired; the previous leader probably
    /// failed, or there was no leader in this term.
    ElectionTimeoutExpired,
    /// An explicit external request, e.g. a leadership transfer.
    ExternalRequest,
}

/// The kind of change a `ChangeConfigRequest` applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeConfigType {
    AddPeer,
    RemovePeer,
    /// Change the role of an existing peer, e.g. promote a learner to voter.
    ModifyPeer,
}

/// A request to change the tablet's membership. One change at a time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeConfigRequest {
    pub tablet_id: String,
    pub change_type: ChangeConfigType,
    pub peer: RaftPeer,
    /// If set, the change only applies while the committed config still has
    /// this `opid_index` (a compare-and-swap guard for racing operators).
    pub cas_config_opid_index: Option<i64>,
}

/// An operator recovery request: rewrite the committed config on a single
/// node, bypassing replication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsafeChangeConfigRequest {
    pub tablet_id: String,
    pub caller_id: String,
    pub new_config: RaftConfig,
}

/// Asks the target peer to start an election even if it believes a leader is
/// alive. Sent by a leader performing a graceful step-down handoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunLeaderElectionRequest {
    pub tablet_id: String,
    pub dest_uuid: ReplicaId,
}

/// Which OpId `get_last_opid` should report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpIdType {
    /// The last operation received and appended to the log.
    Received,
    /// The last operation known to be committed.
    Committed,
}
