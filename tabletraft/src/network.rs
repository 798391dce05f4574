//! The peer RPC interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::RunLeaderElectionRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft_types::RaftPeer;

/// A trait defining the transport between cluster peers.
///
/// Transport-level failures are returned as errors and retried by the peer
/// manager with backoff; protocol-level rejections travel inside the response
/// types.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target peer (§5.3); also used as
    /// heartbeat (§5.2).
    async fn append_entries(&self, target: &RaftPeer, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target peer (§5.2).
    async fn request_vote(&self, target: &RaftPeer, req: VoteRequest) -> Result<VoteResponse>;

    /// Ask the target peer to start an election immediately, ignoring any
    /// live leader. Used for graceful leadership handoff.
    async fn run_leader_election(&self, target: &RaftPeer, req: RunLeaderElectionRequest) -> Result<()>;
}
