//! Administrative operations: membership changes and leadership transfer.

use std::sync::Arc;

use crate::core::RaftConsensus;
use crate::error::ConsensusError;
use crate::error::ConsensusResult;
use crate::raft::ChangeConfigRequest;
use crate::raft::ChangeConfigType;
use crate::raft::RunLeaderElectionRequest;
use crate::raft::UnsafeChangeConfigRequest;
use crate::raft_types::RaftRole;
use crate::raft_types::ReplicateMsg;
use crate::raft_types::ReplicatePayload;
use crate::round::ReplicatedCallback;
use crate::round::Round;

impl RaftConsensus {
    /// Propose a membership change: a single peer added, removed, or
    /// re-roled, one change at a time.
    ///
    /// Validation happens synchronously against the committed config; the
    /// outcome of replication is reported through `cb` once the change entry
    /// commits or is abandoned. The new config takes effect for quorum
    /// purposes as soon as this method returns.
    #[tracing::instrument(level = "debug", skip(self, req, cb), fields(tablet = %req.tablet_id, change = ?req.change_type, peer = %req.peer.uuid))]
    pub async fn change_config(&self, req: ChangeConfigRequest, cb: ReplicatedCallback) -> ConsensusResult<()> {
        self.check_fatal()?;
        let _guard = self.inner.update_lock.lock().await;

        let round = {
            let state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;
            if self.role_locked(&state) != RaftRole::Leader {
                return Err(ConsensusError::IllegalState(
                    "config changes must be submitted to the leader".to_string(),
                ));
            }
            if let Some(pending) = state.meta.pending_config() {
                return Err(ConsensusError::IllegalState(format!(
                    "the config change at index {} is still uncommitted",
                    pending.opid_index
                )));
            }
            let committed = state.meta.committed_config();
            if let Some(cas) = req.cas_config_opid_index {
                if cas != committed.opid_index {
                    return Err(ConsensusError::InvalidArgument(format!(
                        "config has opid_index {} but the request expected {}",
                        committed.opid_index, cas
                    )));
                }
            }

            let mut new_config = committed.clone();
            match req.change_type {
                ChangeConfigType::AddPeer => {
                    if new_config.contains(&req.peer.uuid) {
                        return Err(ConsensusError::InvalidArgument(format!(
                            "peer {} is already a member",
                            req.peer.uuid
                        )));
                    }
                    new_config.members.push(req.peer.clone());
                }
                ChangeConfigType::RemovePeer => {
                    if req.peer.uuid == self.inner.local_peer.uuid {
                        return Err(ConsensusError::InvalidArgument(
                            "the leader cannot remove itself; transfer leadership first".to_string(),
                        ));
                    }
                    if !new_config.contains(&req.peer.uuid) {
                        return Err(ConsensusError::NotFound(format!(
                            "peer {} is not a member",
                            req.peer.uuid
                        )));
                    }
                    new_config.members.retain(|m| m.uuid != req.peer.uuid);
                }
                ChangeConfigType::ModifyPeer => {
                    let member = new_config
                        .members
                        .iter_mut()
                        .find(|m| m.uuid == req.peer.uuid)
                        .ok_or_else(|| {
                            ConsensusError::NotFound(format!("peer {} is not a member", req.peer.uuid))
                        })?;
                    if member.role == req.peer.role {
                        return Err(ConsensusError::InvalidArgument(format!(
                            "peer {} already has role {:?}",
                            req.peer.uuid, member.role
                        )));
                    }
                    member.role = req.peer.role;
                }
            }
            // The definitive opid_index is assigned at replication time.
            new_config.opid_index = -1;
            new_config.validate()?;
            Round::new(ReplicateMsg::new(ReplicatePayload::ConfigChange(new_config)), cb)
        };

        self.check_leadership_and_bind_term(&round)?;
        self.replicate_config_change(round).await
    }

    /// Replicate a config-change round: like `replicate`, plus installing
    /// the new config as pending and re-aiming the queue and peer workers at
    /// it. The install happens before the entry is enqueued, so no majority
    /// can be computed for it under the old voter set.
    async fn replicate_config_change(&self, round: Arc<Round>) -> ConsensusResult<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            let mut config = round.config_change().ok_or_else(|| {
                ConsensusError::IllegalState("round does not carry a config change".to_string())
            })?;
            // The entry's index is deterministic under the core lock;
            // `replicate_locked` below assigns the same one to the round.
            config.opid_index = state.last_received.index + 1;
            state.meta.set_pending_config(config)?;
            let committed_voters = state.meta.committed_config().voter_uuids();
            let pending_voters = state.meta.pending_config().map(|c| c.voter_uuids());
            let members = state.meta.active_config().members.clone();
            self.inner
                .queue
                .update_config(members.clone(), committed_voters, pending_voters);
            self.inner.peer_manager.update_peers(&members);

            if let Err(error) = self.replicate_locked(&mut state, &round) {
                state.meta.clear_pending_config();
                let committed_voters = state.meta.committed_config().voter_uuids();
                let members = state.meta.active_config().members.clone();
                self.inner.queue.update_config(members.clone(), committed_voters, None);
                self.inner.peer_manager.update_peers(&members);
                return Err(error);
            }
        }
        self.flush_meta().await?;
        self.inner.peer_manager.signal_request_all();
        self.report_state();
        Ok(())
    }

    /// Operator recovery: rewrite the committed config on this node alone,
    /// bypassing replication. Safe only when a majority of the old config is
    /// gone for good.
    #[tracing::instrument(level = "debug", skip(self, req), fields(tablet = %req.tablet_id, caller = %req.caller_id))]
    pub async fn unsafe_change_config(&self, req: UnsafeChangeConfigRequest) -> ConsensusResult<()> {
        self.check_fatal()?;
        let _guard = self.inner.update_lock.lock().await;
        {
            let mut state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;
            req.new_config.validate()?;
            let mut config = req.new_config.clone();
            if config.opid_index < 0 {
                config.opid_index = state.pending.last_committed_index();
            }
            tracing::warn!(
                tablet = %self.inner.tablet_id,
                caller = %req.caller_id,
                "rewriting the committed config on this node only, bypassing replication"
            );
            state.meta.overwrite_committed_config(config);
            self.become_follower_locked(&mut state, None);
        }
        self.flush_meta().await?;
        (self.inner.mark_dirty)(&format!("unsafe config change requested by {}", req.caller_id));
        self.report_state();
        Ok(())
    }

    /// Gracefully relinquish leadership.
    ///
    /// With a target uuid, the chosen successor is asked to campaign
    /// immediately (ignoring leader liveness) before this replica steps
    /// down; without one, this replica simply becomes a follower and lets
    /// the failure detectors elect someone.
    #[tracing::instrument(level = "debug", skip(self), fields(tablet = %self.inner.tablet_id))]
    pub async fn step_down(&self, new_leader_uuid: Option<&str>) -> ConsensusResult<()> {
        self.check_fatal()?;
        let _guard = self.inner.update_lock.lock().await;

        let target = {
            let state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;
            if self.role_locked(&state) != RaftRole::Leader {
                return Err(ConsensusError::IllegalState(
                    "this replica is not the leader".to_string(),
                ));
            }
            match new_leader_uuid {
                Some(uuid) if uuid == self.inner.local_peer.uuid => {
                    return Err(ConsensusError::InvalidArgument(
                        "cannot transfer leadership to the current leader".to_string(),
                    ));
                }
                Some(uuid) => Some(
                    state
                        .meta
                        .active_config()
                        .get_peer(uuid)
                        .cloned()
                        .ok_or_else(|| ConsensusError::NotFound(format!("peer {} is not a member", uuid)))?,
                ),
                None => None,
            }
        };

        if let Some(peer) = target {
            let req = RunLeaderElectionRequest {
                tablet_id: self.inner.tablet_id.clone(),
                dest_uuid: peer.uuid.clone(),
            };
            if let Err(error) = self.inner.messenger.run_leader_election(&peer, req).await {
                tracing::warn!(peer = %peer.uuid, %error, "could not ask the successor to start an election");
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            self.become_follower_locked(&mut state, None);
        }
        // Hold back a full period so the successor wins before our own
        // detector fires.
        self.inner
            .failure_detector
            .snooze(Some(self.inner.options.new_rand_election_period()));
        (self.inner.mark_dirty)("leader stepped down");
        self.report_state();
        Ok(())
    }
}
