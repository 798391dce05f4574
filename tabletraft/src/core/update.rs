//! The follower-side AppendEntries path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::core::CoreState;
use crate::core::LogTask;
use crate::core::RaftConsensus;
use crate::error::ConsensusError;
use crate::error::ConsensusErrorCode;
use crate::error::ConsensusResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft_types::OpId;
use crate::raft_types::ReplicatePayload;
use crate::round::Round;

enum Gate {
    Reject(ConsensusErrorCode),
    AdvanceTerm,
    Proceed,
}

struct AppendWork {
    truncate_after: Option<i64>,
    rounds: Vec<Arc<Round>>,
    meta_dirty: bool,
}

enum Plan {
    Append(AppendWork),
    Mismatch {
        truncate_after: Option<i64>,
        meta_dirty: bool,
    },
}

impl RaftConsensus {
    /// Handle an AppendEntries request from a leader (§5.3).
    ///
    /// The request carries zero or more operations; with zero it is
    /// status-only, exchanging watermarks. Operations are deduplicated,
    /// checked against the log-matching property, appended, and handed to the
    /// transaction factory for Prepare; the response is sent once the log
    /// confirms durability of the batch. The leader's committed index then
    /// drives pending operations through their replicated callbacks, in index
    /// order.
    ///
    /// Serialised by the update lock: if one `update` returns before another
    /// begins, the first call's effects are fully observable to the second.
    #[tracing::instrument(
        level = "trace",
        skip(self, req),
        fields(
            tablet = %req.tablet_id,
            leader = %req.leader_uuid,
            term = req.term,
            preceding = %req.preceding_opid,
            committed = req.committed_index,
            ops = req.ops.len(),
        ),
    )]
    pub async fn update(&self, req: AppendEntriesRequest) -> ConsensusResult<AppendEntriesResponse> {
        self.check_fatal()?;
        let _update = self.inner.update_lock.lock().await;

        // Term and leader checks.
        let gate = {
            let mut state = self.inner.state.lock().unwrap();
            Self::check_running_locked(&state)?;
            let current = state.meta.current_term();
            if req.term < current {
                tracing::debug!(current, "AppendEntries term is behind ours");
                Gate::Reject(ConsensusErrorCode::InvalidTerm)
            } else if req.term > current {
                Gate::AdvanceTerm
            } else {
                match state.leader_uuid.clone() {
                    Some(uuid) if uuid == req.leader_uuid => {
                        state.failed_elections = 0;
                        Gate::Proceed
                    }
                    Some(uuid) => {
                        tracing::warn!(
                            known_leader = %uuid,
                            requester = %req.leader_uuid,
                            term = req.term,
                            "rejecting AppendEntries from a second leader in the same term"
                        );
                        Gate::Reject(ConsensusErrorCode::LeaderConflict)
                    }
                    None => {
                        state.leader_uuid = Some(req.leader_uuid.clone());
                        state.last_received_current_leader = OpId::MIN;
                        state.failed_elections = 0;
                        Gate::Proceed
                    }
                }
            }
        };
        match gate {
            Gate::Reject(code) => return Ok(self.reject_response(code)),
            Gate::AdvanceTerm => {
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.meta.set_current_term(req.term)?;
                    self.become_follower_locked(&mut state, Some(req.leader_uuid.clone()));
                    state.last_received_current_leader = OpId::MIN;
                    state.failed_elections = 0;
                }
                // The new term must be durable before anything reflects it.
                self.flush_meta().await?;
                (self.inner.mark_dirty)("observed higher term from leader");
                self.report_state();
            }
            Gate::Proceed => {}
        }

        let AppendEntriesRequest {
            preceding_opid,
            committed_index: leader_committed,
            ops,
            ..
        } = req;

        // Deduplication and log-matching enforcement.
        let plan = {
            let mut state = self.inner.state.lock().unwrap();
            let committed = state.pending.last_committed_index();

            // Drop the prefix of operations we already have.
            let mut preceding = preceding_opid;
            let mut ops_iter = ops.into_iter().peekable();
            while let Some(op) = ops_iter.peek() {
                let duplicate = op.id.index <= committed || state.pending.has_op(op.id);
                if !duplicate {
                    break;
                }
                preceding = op.id;
                ops_iter.next();
            }
            let kept: Vec<_> = ops_iter.collect();

            if preceding.index < committed {
                tracing::warn!(
                    preceding = %preceding,
                    committed,
                    "preceding entry is below the committed index; leader must back off"
                );
                Plan::Mismatch {
                    truncate_after: None,
                    meta_dirty: false,
                }
            } else if preceding.index > state.last_received.index {
                tracing::debug!(
                    preceding = %preceding,
                    last_received = %state.last_received,
                    "missing entries before the preceding one"
                );
                Plan::Mismatch {
                    truncate_after: None,
                    meta_dirty: false,
                }
            } else {
                let preceding_matches = if preceding.index == committed {
                    preceding.index == 0 || preceding == state.pending.last_committed_opid()
                } else {
                    state.pending.has_op(preceding)
                };
                if !preceding_matches && preceding.index > committed {
                    // Our pending entry at the preceding index has a
                    // different term: delete it and the conflicting suffix.
                    state.pending.abort_ops_after(preceding.index - 1);
                    let meta_dirty = self.clear_aborted_config_locked(&mut state, preceding.index - 1);
                    state.last_received = Self::tail_opid_locked(&state);
                    state.last_received_current_leader =
                        state.last_received_current_leader.min(state.last_received);
                    Plan::Mismatch {
                        truncate_after: Some(preceding.index - 1),
                        meta_dirty,
                    }
                } else if !preceding_matches {
                    tracing::error!(
                        preceding = %preceding,
                        last_committed = %state.pending.last_committed_opid(),
                        "preceding entry conflicts with committed state"
                    );
                    Plan::Mismatch {
                        truncate_after: None,
                        meta_dirty: false,
                    }
                } else {
                    self.build_append_work(&mut state, preceding, kept, leader_committed)?
                }
            }
        };

        let work = match plan {
            Plan::Mismatch {
                truncate_after,
                meta_dirty,
            } => {
                if let Some(after) = truncate_after {
                    self.truncate_log(after).await?;
                }
                if meta_dirty {
                    self.flush_meta().await?;
                }
                // A mismatch is still contact from a valid leader.
                self.inner.failure_detector.snooze(None);
                self.report_state();
                return Ok(self.reject_response(ConsensusErrorCode::PrecedingEntryDidntMatch));
            }
            Plan::Append(work) => work,
        };

        if let Some(after) = work.truncate_after {
            self.truncate_log(after).await?;
        }

        // Prepare begins asynchronously; durability is what gates the ack.
        for round in &work.rounds {
            self.inner
                .txn_factory
                .start_replica_transaction(round.clone())
                .await
                .map_err(|e| self.fatal_error("could not start replica transaction", e))?;
        }

        let appended = if work.rounds.is_empty() {
            None
        } else {
            let batch: Vec<_> = work.rounds.iter().map(|r| r.replicate_msg()).collect();
            let (tx, rx) = oneshot::channel();
            self.inner
                .log_tx
                .send(LogTask::Append {
                    ops: batch,
                    ack: Some(tx),
                })
                .map_err(|_| ConsensusError::ServiceUnavailable("log appender is not running".to_string()))?;
            let last = rx
                .await
                .map_err(|_| ConsensusError::ServiceUnavailable("log appender stopped".to_string()))??;
            Some(last)
        };

        // Commit-index advancement and the durable response.
        let mut meta_dirty = work.meta_dirty;
        let (response, behind) = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(last) = appended {
                state.last_received = last;
                state.last_received_current_leader = last;
            }
            let new_commit = leader_committed.min(state.last_received.index);
            let behind = leader_committed > state.last_received.index;
            if new_commit > state.pending.last_committed_index() {
                let committed_rounds = state.pending.advance_committed_index(new_commit);
                meta_dirty |= self.apply_commits_locked(&mut state, &committed_rounds);
            }
            state.withhold_votes_until =
                Instant::now() + Duration::from_millis(self.inner.options.base_failure_period());
            (self.append_entries_response_locked(&state, true, None), behind)
        };
        if meta_dirty {
            self.flush_meta().await?;
        }

        // The leader is alive. A replica that had to clamp the commit index
        // is missing entries; it holds back an extra period so up-to-date
        // replicas win any election first.
        let extra = if behind {
            Some(self.inner.options.new_rand_election_period())
        } else {
            None
        };
        self.inner.failure_detector.snooze(extra);
        self.report_state();
        Ok(response)
    }

    /// Register the deduplicated suffix of a request: abort overwritten
    /// pending entries, adopt config changes as pending, create replica
    /// rounds.
    fn build_append_work(
        &self,
        state: &mut CoreState,
        preceding: OpId,
        kept: Vec<crate::raft_types::ReplicateMsg>,
        leader_committed: i64,
    ) -> ConsensusResult<Plan> {
        let mut truncate_after = None;
        let mut meta_dirty = false;

        if let Some(first) = kept.first() {
            if first.id.index != preceding.index + 1 {
                return Err(ConsensusError::InvalidArgument(format!(
                    "non-contiguous batch: preceding {} followed by {}",
                    preceding, first.id
                )));
            }
            if first.id.index <= state.last_received.index {
                // The new operations overwrite a conflicting pending suffix.
                state.pending.abort_ops_after(first.id.index - 1);
                meta_dirty |= self.clear_aborted_config_locked(state, first.id.index - 1);
                truncate_after = Some(first.id.index - 1);
                state.last_received = preceding;
                state.last_received_current_leader = state.last_received_current_leader.min(preceding);
            }
        }

        let mut rounds = Vec::with_capacity(kept.len());
        for msg in kept {
            self.inner.time_manager.observe(msg.timestamp);
            if let ReplicatePayload::ConfigChange(config) = &msg.payload {
                let pending_index = state.meta.pending_config().map(|c| c.opid_index);
                if let Some(index) = pending_index {
                    if index <= leader_committed {
                        // The previous change committed leader-side; this
                        // request carries both the commit and the successor.
                        let _ = state.meta.commit_pending_config();
                        meta_dirty = true;
                    } else {
                        return Err(ConsensusError::InvalidArgument(
                            "received a config change while another is uncommitted".to_string(),
                        ));
                    }
                }
                // Config changes take effect upon receipt, before commit.
                state.meta.set_pending_config(config.clone())?;
                meta_dirty = true;
            }
            let round = Round::new_replica(msg);
            state.pending.add_pending_operation(round.clone())?;
            rounds.push(round);
        }

        Ok(Plan::Append(AppendWork {
            truncate_after,
            rounds,
            meta_dirty,
        }))
    }

    fn append_entries_response_locked(
        &self,
        state: &CoreState,
        success: bool,
        error: Option<ConsensusErrorCode>,
    ) -> AppendEntriesResponse {
        AppendEntriesResponse {
            responder_uuid: self.inner.local_peer.uuid.clone(),
            term: state.meta.current_term(),
            success,
            error,
            last_received: state.last_received,
            last_received_current_leader: state.last_received_current_leader,
            last_committed_index: state.pending.last_committed_index(),
        }
    }

    fn reject_response(&self, code: ConsensusErrorCode) -> AppendEntriesResponse {
        let state = self.inner.state.lock().unwrap();
        self.append_entries_response_locked(&state, false, Some(code))
    }

    async fn truncate_log(&self, after_index: i64) -> ConsensusResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .log_tx
            .send(LogTask::Truncate {
                after_index,
                ack: tx,
            })
            .map_err(|_| ConsensusError::ServiceUnavailable("log appender is not running".to_string()))?;
        rx.await
            .map_err(|_| ConsensusError::ServiceUnavailable("log appender stopped".to_string()))?
    }
}
