//! The voter path and election driving.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::time::Instant;

use crate::core::RaftConsensus;
use crate::election::ElectionDecision;
use crate::election::ElectionOutcome;
use crate::election::LeaderElection;
use crate::error::ConsensusErrorCode;
use crate::error::ConsensusResult;
use crate::raft::ElectionMode;
use crate::raft::ElectionReason;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft_types::LifecycleState;
use crate::raft_types::MemberRole;
use crate::raft_types::RaftPeer;
use crate::raft_types::RaftRole;
use crate::ReplicaId;

struct ElectionPrep {
    pre: bool,
    req: VoteRequest,
    committed_voters: BTreeSet<ReplicaId>,
    pending_voters: Option<BTreeSet<ReplicaId>>,
    remote_voters: Vec<RaftPeer>,
}

enum AfterOutcome {
    BecomeLeader,
    RunReal,
    StepDownTo { term: i64, failed: u64 },
    Backoff { failed: u64 },
    Nothing,
}

impl RaftConsensus {
    /// Handle a RequestVote RPC from a candidate (§5.2).
    ///
    /// Contention on the update lock is answered with `ConsensusBusy`: a vote
    /// must not interleave with an append or another vote's persistence. A
    /// binding vote is flushed before the response is sent; a crash between
    /// grant and flush therefore re-denies. Pre-election requests follow the
    /// same decision table but persist nothing.
    #[tracing::instrument(
        level = "trace",
        skip(self, req),
        fields(
            candidate = %req.candidate_uuid,
            term = req.term,
            pre = req.is_pre_election,
        ),
    )]
    pub async fn request_vote(&self, req: VoteRequest) -> ConsensusResult<VoteResponse> {
        self.check_fatal()?;
        let _guard = match self.inner.update_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("denying vote: consensus is busy");
                return Ok(VoteResponse {
                    responder_uuid: self.inner.local_peer.uuid.clone(),
                    term: self.current_term(),
                    vote_granted: false,
                    error: Some(ConsensusErrorCode::ConsensusBusy),
                });
            }
        };

        let mut persist = false;
        let mut granted = false;
        let mut error = None;
        let term_now = {
            let mut state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;

            // A binding request with a higher term moves us into that term
            // regardless of how the vote itself resolves.
            if !req.is_pre_election && req.term > state.meta.current_term() {
                state.meta.set_current_term(req.term)?;
                self.become_follower_locked(&mut state, None);
                persist = true;
            }
            let current = state.meta.current_term();

            if req.term < current {
                error = Some(ConsensusErrorCode::InvalidTerm);
            } else if !req.ignore_live_leader && Instant::now() < state.withhold_votes_until {
                tracing::debug!(candidate = %req.candidate_uuid, "denying vote: leader is alive");
                error = Some(ConsensusErrorCode::LeaderIsAlive);
            } else {
                let prior_vote = if req.term == current {
                    state.meta.voted_for().cloned()
                } else {
                    // A pre-election for a future term; no vote exists there.
                    None
                };
                match prior_vote {
                    Some(candidate) if candidate == req.candidate_uuid => {
                        // Idempotent re-grant.
                        granted = true;
                    }
                    Some(_) => {
                        error = Some(ConsensusErrorCode::AlreadyVoted);
                    }
                    None => {
                        if req.last_logged_opid < state.last_received {
                            tracing::debug!(
                                candidate_last = %req.last_logged_opid,
                                local_last = %state.last_received,
                                "denying vote: candidate log is behind ours"
                            );
                            error = Some(ConsensusErrorCode::LastOpIdTooOld);
                        } else {
                            granted = true;
                            if !req.is_pre_election {
                                state.meta.record_vote(&req.candidate_uuid)?;
                                persist = true;
                            }
                        }
                    }
                }
            }
            state.meta.current_term()
        };

        if persist {
            // Only persisted vote transitions may be acknowledged.
            self.flush_meta().await?;
            self.report_state();
        }
        if granted && !req.is_pre_election {
            // A granted vote holds back our own candidacy for a full period.
            self.inner.failure_detector.snooze(None);
            tracing::info!(candidate = %req.candidate_uuid, term = term_now, "granted vote");
        }
        Ok(VoteResponse {
            responder_uuid: self.inner.local_peer.uuid.clone(),
            term: term_now,
            vote_granted: granted,
            error,
        })
    }

    /// Trigger a leader election.
    ///
    /// In `Normal` mode with pre-vote enabled, a non-binding poll runs first;
    /// only a polled majority leads to the real, term-incrementing election.
    pub async fn start_election(&self, mode: ElectionMode, reason: ElectionReason) -> ConsensusResult<()> {
        let _guard = self.inner.update_lock.lock().await;
        self.do_start_election(mode, reason, false).await
    }

    /// Ask this replica to campaign immediately even if it believes a leader
    /// is alive. Sent by a leader performing a graceful handoff.
    pub async fn handle_run_leader_election(
        &self,
        req: crate::raft::RunLeaderElectionRequest,
    ) -> ConsensusResult<()> {
        if req.dest_uuid != self.inner.local_peer.uuid {
            return Err(crate::error::ConsensusError::InvalidArgument(format!(
                "request addressed to {}, but this is {}",
                req.dest_uuid, self.inner.local_peer.uuid
            )));
        }
        self.start_election(ElectionMode::ElectEvenIfLeaderIsAlive, ElectionReason::ExternalRequest)
            .await
    }

    /// Caller holds the update lock.
    pub(crate) async fn do_start_election(
        &self,
        mode: ElectionMode,
        reason: ElectionReason,
        force_real: bool,
    ) -> ConsensusResult<()> {
        let prep = {
            let mut state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;
            if self.role_locked(&state) == RaftRole::Leader {
                return Ok(());
            }
            if state.election_pending {
                tracing::debug!("election already in progress");
                return Ok(());
            }
            if !state
                .meta
                .active_config()
                .voter_uuids()
                .contains(&self.inner.local_peer.uuid)
            {
                return Err(crate::error::ConsensusError::IllegalState(format!(
                    "replica {} is not a voter in the active config",
                    self.inner.local_peer.uuid
                )));
            }

            let pre = !force_real
                && match mode {
                    ElectionMode::PreElection => true,
                    ElectionMode::Normal => self.inner.options.enable_pre_vote,
                    ElectionMode::ElectEvenIfLeaderIsAlive => false,
                };
            let election_term = state.meta.current_term() + 1;
            if !pre {
                state.meta.set_current_term(election_term)?;
                state.meta.record_vote(&self.inner.local_peer.uuid)?;
                state.leader_uuid = None;
            }
            state.election_pending = true;

            let committed_voters = state.meta.committed_config().voter_uuids();
            let pending_voters = state.meta.pending_config().map(|c| c.voter_uuids());
            let mut remote: BTreeMap<ReplicaId, RaftPeer> = BTreeMap::new();
            let pending_members = state.meta.pending_config().map(|c| c.members.iter());
            for peer in state
                .meta
                .committed_config()
                .members
                .iter()
                .chain(pending_members.into_iter().flatten())
            {
                if peer.role == MemberRole::Voter && peer.uuid != self.inner.local_peer.uuid {
                    remote.entry(peer.uuid.clone()).or_insert_with(|| peer.clone());
                }
            }

            ElectionPrep {
                pre,
                req: VoteRequest {
                    tablet_id: self.inner.tablet_id.clone(),
                    candidate_uuid: self.inner.local_peer.uuid.clone(),
                    term: election_term,
                    last_logged_opid: state.last_received,
                    is_pre_election: pre,
                    ignore_live_leader: mode == ElectionMode::ElectEvenIfLeaderIsAlive,
                },
                committed_voters,
                pending_voters,
                remote_voters: remote.into_values().collect(),
            }
        };

        if !prep.pre {
            // The incremented term and self-vote must be durable before any
            // vote request carries them.
            if let Err(error) = self.flush_meta().await {
                self.inner.state.lock().unwrap().election_pending = false;
                return Err(error);
            }
        }
        self.inner.failure_detector.snooze(None);
        tracing::info!(
            tablet = %self.inner.tablet_id,
            peer = %self.inner.local_peer.uuid,
            term = prep.req.term,
            ?mode,
            ?reason,
            pre_election = prep.pre,
            "starting election"
        );

        let weak = Arc::downgrade(&self.inner);
        LeaderElection::run(
            self.inner.messenger.clone(),
            prep.req,
            prep.committed_voters,
            prep.pending_voters,
            prep.remote_voters,
            self.inner.options.new_rand_election_period(),
            Box::new(move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    let consensus = RaftConsensus { inner };
                    let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                        Box::pin(async move {
                            consensus.handle_election_outcome(outcome, mode, reason).await;
                        });
                    tokio::spawn(fut);
                }
            }),
        );
        self.report_state();
        Ok(())
    }

    /// Apply the result of an election once it resolves. Scheduled onto the
    /// runtime by the election's decision callback, never run on a transport
    /// thread.
    async fn handle_election_outcome(&self, outcome: ElectionOutcome, mode: ElectionMode, reason: ElectionReason) {
        let _guard = self.inner.update_lock.lock().await;
        let next = {
            let mut state = self.inner.state.lock().unwrap();
            state.election_pending = false;
            if state.lifecycle != LifecycleState::Running {
                AfterOutcome::Nothing
            } else {
                let current = state.meta.current_term();
                match outcome.decision {
                    ElectionDecision::Granted if outcome.is_pre_election => {
                        if current + 1 == outcome.term {
                            AfterOutcome::RunReal
                        } else {
                            AfterOutcome::Nothing
                        }
                    }
                    ElectionDecision::Granted => {
                        if current == outcome.term && state.leader_uuid.is_none() {
                            self.become_leader_locked(&mut state);
                            AfterOutcome::BecomeLeader
                        } else {
                            tracing::debug!(
                                election_term = outcome.term,
                                current,
                                "ignoring stale election result"
                            );
                            AfterOutcome::Nothing
                        }
                    }
                    ElectionDecision::Denied { highest_term } => {
                        state.failed_elections += 1;
                        let failed = state.failed_elections;
                        if highest_term > current {
                            AfterOutcome::StepDownTo {
                                term: highest_term,
                                failed,
                            }
                        } else {
                            AfterOutcome::Backoff { failed }
                        }
                    }
                    ElectionDecision::TimedOut => {
                        state.failed_elections += 1;
                        AfterOutcome::Backoff {
                            failed: state.failed_elections,
                        }
                    }
                }
            }
        };

        match next {
            AfterOutcome::BecomeLeader => {
                (self.inner.mark_dirty)("this replica became leader");
                // The no-op goes in before leadership is reported, so a
                // client write observed after the transition always lands
                // behind it.
                if let Err(error) = self.append_leader_noop().await {
                    tracing::warn!(%error, "could not append the leader no-op entry");
                }
                self.report_state();
            }
            AfterOutcome::RunReal => {
                if let Err(error) = self.do_start_election(mode, reason, true).await {
                    tracing::warn!(%error, "could not start the election after a granted pre-vote");
                }
            }
            AfterOutcome::StepDownTo { term, failed } => {
                {
                    let mut state = self.inner.state.lock().unwrap();
                    if state.meta.set_current_term(term).is_err() {
                        return;
                    }
                    self.become_follower_locked(&mut state, None);
                }
                if self.flush_meta().await.is_err() {
                    return;
                }
                self.inner
                    .failure_detector
                    .snooze(Some(self.inner.options.election_backoff(failed)));
                self.report_state();
            }
            AfterOutcome::Backoff { failed } => {
                let extra = self.inner.options.election_backoff(failed);
                tracing::debug!(
                    failed_elections = failed,
                    backoff = ?extra,
                    "election did not succeed; backing off"
                );
                self.inner.failure_detector.snooze(Some(extra));
            }
            AfterOutcome::Nothing => {}
        }
    }

    /// Assert leadership without consulting any peer, by incrementing the
    /// term and voting only for ourselves.
    ///
    /// This is NOT safe in a clustered deployment with failure detection
    /// enabled: two replicas doing this concurrently is a split brain.
    #[cfg(any(test, feature = "testing"))]
    pub async fn emulate_election(&self) -> ConsensusResult<()> {
        let _guard = self.inner.update_lock.lock().await;
        {
            let mut state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;
            let term = state.meta.current_term() + 1;
            state.meta.set_current_term(term)?;
            state.meta.record_vote(&self.inner.local_peer.uuid)?;
            self.become_leader_locked(&mut state);
        }
        self.flush_meta().await?;
        (self.inner.mark_dirty)("emulated election");
        self.report_state();
        self.append_leader_noop().await
    }

    /// Move this replica into `new_term`, stepping down if it leads.
    #[cfg(any(test, feature = "testing"))]
    pub async fn advance_term_for_tests(&self, new_term: i64) -> ConsensusResult<()> {
        let _guard = self.inner.update_lock.lock().await;
        {
            let mut state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;
            state.meta.set_current_term(new_term)?;
            self.become_follower_locked(&mut state, None);
        }
        self.flush_meta().await?;
        self.report_state();
        Ok(())
    }
}
