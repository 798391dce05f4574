//! Observable consensus state.
//!
//! A running consensus instance publishes a [`ConsensusState`] snapshot on a
//! `watch` channel whenever something externally visible changes. Embedding
//! servers expose it for observability; tests and `wait_until_leader` block
//! on it via [`Wait`].

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::ConsensusError;
use crate::error::ConsensusResult;
use crate::raft_types::LifecycleState;
use crate::raft_types::OpId;
use crate::raft_types::RaftConfig;
use crate::raft_types::RaftRole;
use crate::ReplicaId;

/// A copy of the externally observable state of one consensus instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub tablet_id: String,
    pub peer_uuid: ReplicaId,
    pub role: RaftRole,
    pub lifecycle: LifecycleState,
    pub current_term: i64,
    pub leader_uuid: Option<ReplicaId>,
    pub voted_for: Option<ReplicaId>,
    pub last_received: OpId,
    pub committed_index: i64,
    pub committed_config: RaftConfig,
    pub pending_config: Option<RaftConfig>,
}

impl ConsensusState {
    pub(crate) fn new_initial(tablet_id: String, peer_uuid: ReplicaId, committed_config: RaftConfig) -> Self {
        Self {
            tablet_id,
            peer_uuid,
            role: RaftRole::Follower,
            lifecycle: LifecycleState::Initialized,
            current_term: 0,
            leader_uuid: None,
            voted_for: None,
            last_received: OpId::MIN,
            committed_index: 0,
            committed_config,
            pending_config: None,
        }
    }
}

/// Blocks until the observed consensus state satisfies a predicate, or a
/// timeout expires.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ConsensusState>,
}

impl Wait {
    /// Wait for the state to satisfy `func`. Returns the first satisfying
    /// snapshot, or `TimedOut` carrying `msg` for diagnosis.
    pub async fn until<F>(&self, func: F, msg: &str) -> ConsensusResult<ConsensusState>
    where F: Fn(&ConsensusState) -> bool {
        let mut rx = self.rx.clone();
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            {
                let state = rx.borrow();
                if func(&state) {
                    return Ok(state.clone());
                }
            }
            let timeout = tokio::time::timeout_at(deadline, rx.changed());
            match timeout.await {
                Ok(Ok(())) => continue,
                Ok(Err(_closed)) => {
                    return Err(ConsensusError::Aborted(format!(
                        "consensus shut down while waiting for {}",
                        msg
                    )));
                }
                Err(_elapsed) => {
                    return Err(ConsensusError::TimedOut(format!(
                        "timed out after {:?} waiting for {}",
                        self.timeout, msg
                    )));
                }
            }
        }
    }
}
