//! Leader election: a one-shot vote collector for a single term.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::network::Messenger;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft_types::RaftPeer;
use crate::ReplicaId;

/// How an election resolved. Each election resolves exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ElectionDecision {
    /// A majority of voters (both majorities, during a config change)
    /// granted their vote.
    Granted,
    /// The election cannot be won: a majority denied, or a voter reported a
    /// higher term.
    Denied {
        /// The highest term observed in any response.
        highest_term: i64,
    },
    /// The election deadline expired without a decision.
    TimedOut,
}

/// The result handed to the decision callback.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ElectionOutcome {
    /// The term campaigned in.
    pub term: i64,
    pub is_pre_election: bool,
    pub decision: ElectionDecision,
}

/// Invoked exactly once with the election outcome. Runs on the runtime, never
/// on a transport callback, so it may acquire consensus locks.
pub(crate) type DecisionCallback = Box<dyn FnOnce(ElectionOutcome) + Send + 'static>;

/// Tallies votes against one or two voter sets. During a config change both
/// the committed and the pending config must produce a majority.
pub(crate) struct VoteCounter {
    old_voters: BTreeSet<ReplicaId>,
    new_voters: Option<BTreeSet<ReplicaId>>,
    granted: BTreeSet<ReplicaId>,
    denied: BTreeSet<ReplicaId>,
}

impl VoteCounter {
    pub fn new(old_voters: BTreeSet<ReplicaId>, new_voters: Option<BTreeSet<ReplicaId>>) -> Self {
        Self {
            old_voters,
            new_voters,
            granted: BTreeSet::new(),
            denied: BTreeSet::new(),
        }
    }

    /// Record one voter's response. Duplicate responses from a voter are
    /// idempotent; the first answer wins.
    pub fn record(&mut self, uuid: &str, granted: bool) {
        if self.granted.contains(uuid) || self.denied.contains(uuid) {
            return;
        }
        if granted {
            self.granted.insert(uuid.to_string());
        } else {
            self.denied.insert(uuid.to_string());
        }
    }

    /// `Some(true)` once a majority (of each voter set) has granted,
    /// `Some(false)` once a majority has become impossible in either set,
    /// `None` while undecided.
    pub fn decision(&self) -> Option<bool> {
        fn tally(voters: &BTreeSet<ReplicaId>, granted: &BTreeSet<ReplicaId>, denied: &BTreeSet<ReplicaId>) -> Option<bool> {
            let needed = voters.len() / 2 + 1;
            let granted = voters.iter().filter(|v| granted.contains(*v)).count();
            if granted >= needed {
                return Some(true);
            }
            let denied = voters.iter().filter(|v| denied.contains(*v)).count();
            if voters.len() - denied < needed {
                return Some(false);
            }
            None
        }

        let old = tally(&self.old_voters, &self.granted, &self.denied);
        let new = match &self.new_voters {
            Some(voters) => tally(voters, &self.granted, &self.denied),
            None => Some(true),
        };
        match (old, new) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        }
    }
}

/// Runs one election round: dispatches vote requests to every remote voter,
/// tallies, and resolves the decision callback exactly once, on grant, on
/// denial, on an observed higher term, or at the deadline.
pub(crate) struct LeaderElection;

impl LeaderElection {
    pub fn run(
        messenger: Arc<dyn Messenger>,
        request: VoteRequest,
        old_voters: BTreeSet<ReplicaId>,
        new_voters: Option<BTreeSet<ReplicaId>>,
        remote_voters: Vec<RaftPeer>,
        timeout: Duration,
        decision_cb: DecisionCallback,
    ) {
        let term = request.term;
        let is_pre_election = request.is_pre_election;
        let candidate = request.candidate_uuid.clone();
        let span = tracing::debug_span!("leader_election", term, is_pre_election, %candidate);

        tokio::spawn(
            async move {
                let mut counter = VoteCounter::new(old_voters, new_voters);
                // The candidate votes for itself.
                counter.record(&candidate, true);

                let resolve = |decision: ElectionDecision| ElectionOutcome {
                    term,
                    is_pre_election,
                    decision,
                };

                if let Some(granted) = counter.decision() {
                    // A single-voter config decides on the spot.
                    let decision = if granted {
                        ElectionDecision::Granted
                    } else {
                        ElectionDecision::Denied { highest_term: term }
                    };
                    decision_cb(resolve(decision));
                    return;
                }

                let (tx, mut rx) = mpsc::channel::<(ReplicaId, VoteResponse)>(remote_voters.len().max(1));
                for peer in remote_voters {
                    let messenger = messenger.clone();
                    let request = request.clone();
                    let tx = tx.clone();
                    let target = peer.uuid.clone();
                    tokio::spawn(
                        async move {
                            match messenger.request_vote(&peer, request).await {
                                Ok(resp) => {
                                    let _ = tx.send((peer.uuid.clone(), resp)).await;
                                }
                                Err(error) => {
                                    tracing::warn!(peer = %peer.uuid, %error, "error requesting vote from peer");
                                }
                            }
                        }
                        .instrument(tracing::trace_span!("request_vote", peer = %target)),
                    );
                }
                drop(tx);

                let deadline = tokio::time::Instant::now() + timeout;
                let mut highest_term = term;
                let decision = loop {
                    let response = tokio::select! {
                        response = rx.recv() => response,
                        _ = tokio::time::sleep_until(deadline) => break ElectionDecision::TimedOut,
                    };
                    let (uuid, resp) = match response {
                        Some(pair) => pair,
                        // Every RPC task finished without a decision; wait
                        // out the deadline in case this is a minority
                        // partition.
                        None => {
                            tokio::time::sleep_until(deadline).await;
                            break ElectionDecision::TimedOut;
                        }
                    };
                    highest_term = highest_term.max(resp.term);
                    if resp.term > term {
                        break ElectionDecision::Denied { highest_term };
                    }
                    tracing::debug!(peer = %uuid, granted = resp.vote_granted, error = ?resp.error, "vote response");
                    counter.record(&uuid, resp.vote_granted);
                    match counter.decision() {
                        Some(true) => break ElectionDecision::Granted,
                        Some(false) => break ElectionDecision::Denied { highest_term },
                        None => continue,
                    }
                };
                decision_cb(resolve(decision));
            }
            .instrument(span),
        );
    }
}
