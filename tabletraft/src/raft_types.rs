//! Core data types of the consensus protocol.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConsensusError;
use crate::error::ConsensusResult;
use crate::time::HybridTimestamp;
use crate::ReplicaId;

/// The identity of one replicated operation: a `(term, index)` pair.
///
/// Comparison is lexicographic on term, then index. Indexes are strictly
/// increasing within a term on the leader that produced them, and a given
/// `(term, index)` pair is globally unique.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

impl OpId {
    /// The OpId preceding every real operation; used for the bootstrap
    /// configuration and for empty logs.
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: i64, index: i64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// The membership role of one peer within a Raft config.
///
/// Only voters count toward majorities. Non-voters and learners receive
/// replicated data but have no say in elections or commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Voter,
    NonVoter,
    Learner,
}

/// One member of a Raft config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftPeer {
    pub uuid: ReplicaId,
    pub host: String,
    pub port: u16,
    pub role: MemberRole,
}

impl RaftPeer {
    pub fn new_voter(uuid: impl Into<ReplicaId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            uuid: uuid.into(),
            host: host.into(),
            port,
            role: MemberRole::Voter,
        }
    }
}

/// A Raft membership configuration.
///
/// `opid_index` is the log index of the config-change entry that produced
/// this config; `-1` for the bootstrap config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub opid_index: i64,
    pub members: Vec<RaftPeer>,
}

impl RaftConfig {
    /// A bootstrap config (not produced by any log entry).
    pub fn bootstrap(members: Vec<RaftPeer>) -> Self {
        Self { opid_index: -1, members }
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.members.iter().any(|m| m.uuid == uuid)
    }

    pub fn get_peer(&self, uuid: &str) -> Option<&RaftPeer> {
        self.members.iter().find(|m| m.uuid == uuid)
    }

    /// The uuids of all voting members.
    pub fn voter_uuids(&self) -> BTreeSet<ReplicaId> {
        self.members
            .iter()
            .filter(|m| m.role == MemberRole::Voter)
            .map(|m| m.uuid.clone())
            .collect()
    }

    /// The number of votes required for a majority of this config's voters.
    pub fn majority_size(&self) -> usize {
        let voters = self.members.iter().filter(|m| m.role == MemberRole::Voter).count();
        voters / 2 + 1
    }

    /// Structural validation: at least one voter, no duplicate uuids.
    pub fn validate(&self) -> ConsensusResult<()> {
        if !self.members.iter().any(|m| m.role == MemberRole::Voter) {
            return Err(ConsensusError::InvalidArgument(
                "config must contain at least one voter".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for member in &self.members {
            if !seen.insert(&member.uuid) {
                return Err(ConsensusError::InvalidArgument(format!(
                    "duplicate peer {} in config",
                    member.uuid
                )));
            }
        }
        Ok(())
    }
}

/// The consensus role of this replica, derived from the active config, the
/// known leader, and the current term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Leader,
    Follower,
    Learner,
    NonParticipant,
}

/// Lifecycle state of a consensus instance. Transitions are monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecycleState {
    Initialized,
    Running,
    ShuttingDown,
    Shutdown,
}

/// The payload of one replicate message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatePayload {
    /// An entry appended by a new leader to implicitly commit entries from
    /// prior terms (§5.4.2).
    NoOp,
    /// An opaque state-machine write, interpreted by the replica transaction
    /// factory.
    Write(Vec<u8>),
    /// A membership change. Takes effect as the pending config upon receipt
    /// and becomes the committed config upon commit.
    ConfigChange(RaftConfig),
}

/// One replicated operation as it travels from the leader to its peers.
/// Immutable after being assigned an `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateMsg {
    pub id: OpId,
    pub timestamp: HybridTimestamp,
    pub payload: ReplicatePayload,
}

impl ReplicateMsg {
    pub fn new(payload: ReplicatePayload) -> Self {
        Self {
            id: OpId::MIN,
            timestamp: HybridTimestamp::MIN,
            payload,
        }
    }

    pub fn is_config_change(&self) -> bool {
        matches!(self.payload, ReplicatePayload::ConfigChange(_))
    }

    /// Approximate in-memory footprint, used by the message buffer's memory
    /// accounting.
    pub fn size_bytes(&self) -> usize {
        let payload = match &self.payload {
            ReplicatePayload::NoOp => 0,
            ReplicatePayload::Write(data) => data.len(),
            ReplicatePayload::ConfigChange(config) => config.members.len() * 64,
        };
        payload + std::mem::size_of::<Self>()
    }
}

/// State recovered from the log at startup and handed to `start`.
#[derive(Clone, Debug, Default)]
pub struct ConsensusBootstrapInfo {
    /// The last operation appended to the log before shutdown.
    pub last_logged_opid: OpId,
    /// The last operation known to be committed before shutdown.
    pub last_committed_opid: OpId,
    /// Replicates found in the log with an index above the committed one;
    /// they become pending rounds again.
    pub orphaned_replicates: Vec<ReplicateMsg>,
}

/// Log indexes the consensus implementation would like retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionIndexes {
    /// No log entry at or below the committed index may be GCed before this.
    pub for_durability: i64,
    /// The index of the farthest-behind peer; GCing past it forces that peer
    /// into external repair.
    pub for_peers: i64,
}
