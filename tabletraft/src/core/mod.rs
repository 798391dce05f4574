//! The core logic of the per-tablet consensus state machine.

mod admin;
mod update;
mod vote;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ConsensusOptions;
use crate::error::ConsensusError;
use crate::error::ConsensusResult;
use crate::failure_detector::FailureDetector;
use crate::metadata::ConsensusMeta;
use crate::metrics::ConsensusState;
use crate::metrics::Wait;
use crate::network::Messenger;
use crate::peers::PeerManager;
use crate::pending::PendingRounds;
use crate::queue::PeerMessageQueue;
use crate::queue::PeerMessageQueueObserver;
use crate::raft::ElectionMode;
use crate::raft::ElectionReason;
use crate::raft::OpIdType;
use crate::raft_types::ConsensusBootstrapInfo;
use crate::raft_types::LifecycleState;
use crate::raft_types::MemberRole;
use crate::raft_types::OpId;
use crate::raft_types::RaftConfig;
use crate::raft_types::RaftPeer;
use crate::raft_types::RaftRole;
use crate::raft_types::ReplicateMsg;
use crate::raft_types::ReplicatePayload;
use crate::raft_types::RetentionIndexes;
use crate::round::Round;
use crate::storage::Log;
use crate::storage::MetaStore;
use crate::storage::PersistentState;
use crate::storage::ReplicaTransactionFactory;
use crate::time::TimeManager;
use crate::ReplicaId;

/// Invoked whenever something the layer above should know about changes:
/// role transitions, committed config changes, failed followers, and fatal
/// errors. Must be cheap; schedule real work elsewhere.
pub type MarkDirtyCallback = Box<dyn Fn(&str) + Send + Sync + 'static>;

/// Work items for the single log-appender task. Enqueue order is established
/// under the core lock, which keeps the log single-appender.
enum LogTask {
    Append {
        ops: Vec<ReplicateMsg>,
        ack: Option<oneshot::Sender<ConsensusResult<OpId>>>,
    },
    Truncate {
        after_index: i64,
        ack: oneshot::Sender<ConsensusResult<()>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Mutable consensus state, guarded by the core lock.
///
/// The guard is `!Send`, so holding it across an await point is a compile
/// error; all durable work happens outside and re-acquires it.
pub(crate) struct CoreState {
    lifecycle: LifecycleState,
    meta: ConsensusMeta,
    /// The leader this replica recognises for the current term, possibly
    /// itself.
    leader_uuid: Option<ReplicaId>,
    pending: PendingRounds,
    /// The last operation appended to the local log, across all terms.
    last_received: OpId,
    /// The last operation received from the current leader; resets on leader
    /// change.
    last_received_current_leader: OpId,
    failed_elections: u64,
    election_pending: bool,
    /// Votes are withheld until this instant after hearing from a live
    /// leader, unless the candidate asks to ignore liveness.
    withhold_votes_until: Instant,
}

pub(crate) struct ConsensusInner {
    tablet_id: String,
    local_peer: RaftPeer,
    options: Arc<ConsensusOptions>,
    log: Arc<dyn Log>,
    meta_store: Arc<dyn MetaStore>,
    messenger: Arc<dyn Messenger>,
    txn_factory: Arc<dyn ReplicaTransactionFactory>,
    time_manager: Arc<TimeManager>,
    queue: Arc<PeerMessageQueue>,
    peer_manager: PeerManager,
    failure_detector: Arc<FailureDetector>,
    /// Serialises follower updates, vote persistence, and election-outcome
    /// application. Taken before the core lock, never after.
    update_lock: Mutex<()>,
    state: StdMutex<CoreState>,
    log_tx: mpsc::UnboundedSender<LogTask>,
    /// Consumed when the appender task spawns at `start`.
    log_rx: StdMutex<Option<mpsc::UnboundedReceiver<LogTask>>>,
    tx_state: watch::Sender<ConsensusState>,
    mark_dirty: MarkDirtyCallback,
    /// Set when log or metadata persistence failed; the replica stops
    /// accepting operations.
    fatal: AtomicBool,
}

/// The consensus implementation for one tablet replica.
///
/// This type is a cheap-clone handle; clone it liberally. All methods are
/// thread-safe.
pub struct RaftConsensus {
    inner: Arc<ConsensusInner>,
}

impl Clone for RaftConsensus {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RaftConsensus {
    /// Create a consensus instance for one tablet.
    ///
    /// Loads (or initialises) the persistent consensus metadata. The instance
    /// does not participate until [`start`](RaftConsensus::start) is called.
    ///
    /// `initial_config` seeds the metadata of a pristine replica and is
    /// ignored when a record already exists.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        tablet_id: String,
        local_peer: RaftPeer,
        options: ConsensusOptions,
        initial_config: RaftConfig,
        log: Arc<dyn Log>,
        meta_store: Arc<dyn MetaStore>,
        messenger: Arc<dyn Messenger>,
        txn_factory: Arc<dyn ReplicaTransactionFactory>,
        mark_dirty: MarkDirtyCallback,
    ) -> ConsensusResult<RaftConsensus> {
        let persistent = match meta_store.load().await? {
            Some(state) => state,
            None => {
                initial_config.validate()?;
                let state = PersistentState::new_initial(initial_config);
                meta_store.flush(&state).await?;
                state
            }
        };

        let options = Arc::new(options);
        let queue = Arc::new(PeerMessageQueue::new(
            options.clone(),
            tablet_id.clone(),
            local_peer.uuid.clone(),
        ));
        let peer_manager = PeerManager::new(
            tablet_id.clone(),
            local_peer.uuid.clone(),
            options.clone(),
            messenger.clone(),
            queue.clone(),
        );
        let failure_detector = FailureDetector::new(options.clone());
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (tx_state, _rx_state) = watch::channel(ConsensusState::new_initial(
            tablet_id.clone(),
            local_peer.uuid.clone(),
            persistent.committed_config.clone(),
        ));

        let state = CoreState {
            lifecycle: LifecycleState::Initialized,
            meta: ConsensusMeta::new(persistent),
            leader_uuid: None,
            pending: PendingRounds::new(OpId::MIN),
            last_received: OpId::MIN,
            last_received_current_leader: OpId::MIN,
            failed_elections: 0,
            election_pending: false,
            withhold_votes_until: Instant::now(),
        };

        let inner = Arc::new(ConsensusInner {
            tablet_id,
            local_peer,
            options,
            log,
            meta_store,
            messenger,
            txn_factory,
            time_manager: Arc::new(TimeManager::new()),
            queue,
            peer_manager,
            failure_detector,
            update_lock: Mutex::new(()),
            state: StdMutex::new(state),
            log_tx,
            log_rx: StdMutex::new(Some(log_rx)),
            tx_state,
            mark_dirty,
            fatal: AtomicBool::new(false),
        });
        inner.queue.set_observer(Arc::new(QueueObserver {
            inner: Arc::downgrade(&inner),
        }));
        Ok(RaftConsensus { inner })
    }

    /// Start running the consensus algorithm.
    ///
    /// Installs the prior-term last OpId and any orphaned replicates found
    /// during log recovery, arms the failure detector, and transitions
    /// INITIALIZED → RUNNING. A sole-voter config elects itself immediately.
    #[tracing::instrument(level = "debug", skip(self, bootstrap), fields(tablet = %self.inner.tablet_id, peer = %self.inner.local_peer.uuid))]
    pub async fn start(&self, bootstrap: ConsensusBootstrapInfo) -> ConsensusResult<()> {
        let update_guard = self.inner.update_lock.lock().await;

        let orphans = {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle != LifecycleState::Initialized {
                return Err(ConsensusError::IllegalState(format!(
                    "cannot start consensus in state {:?}",
                    state.lifecycle
                )));
            }
            state.last_received = bootstrap.last_logged_opid;
            state.last_received_current_leader = OpId::MIN;
            state.pending = PendingRounds::new(bootstrap.last_committed_opid);

            let mut orphans = Vec::new();
            for msg in bootstrap.orphaned_replicates {
                if msg.id.index <= bootstrap.last_committed_opid.index {
                    continue;
                }
                if let ReplicatePayload::ConfigChange(config) = &msg.payload {
                    if !state.meta.has_pending_config() {
                        state.meta.set_pending_config(config.clone())?;
                    }
                }
                let round = Round::new_replica(msg);
                state.pending.add_pending_operation(round.clone())?;
                orphans.push(round);
            }
            state.lifecycle = LifecycleState::Running;
            orphans
        };

        self.inner
            .queue
            .init(bootstrap.last_logged_opid, bootstrap.last_committed_opid.index);

        // Recovered uncommitted operations go back through Prepare.
        for round in orphans {
            self.inner
                .txn_factory
                .start_replica_transaction(round)
                .await
                .map_err(|e| self.fatal_error("could not restart recovered transaction", e))?;
        }

        // Spawn the single log-appender task.
        if let Some(rx) = self.inner.log_rx.lock().unwrap().take() {
            let log = self.inner.log.clone();
            let queue = self.inner.queue.clone();
            let weak = Arc::downgrade(&self.inner);
            tokio::spawn(appender_main(log, queue, weak, rx));
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.failure_detector.start(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let consensus = RaftConsensus { inner };
                tokio::spawn(async move {
                    consensus.report_failure_detected().await;
                });
            }
        }));
        self.inner.failure_detector.enable();
        self.report_state();

        let single_voter = {
            let state = self.inner.state.lock().unwrap();
            let config = state.meta.active_config();
            config.voter_uuids().len() == 1 && config.voter_uuids().contains(&self.inner.local_peer.uuid)
        };
        drop(update_guard);
        if single_voter {
            self.start_election(ElectionMode::Normal, ElectionReason::InitialSingleNodeElection)
                .await?;
        }
        Ok(())
    }

    /// Called by a leader to replicate an operation.
    ///
    /// Assigns a new OpId `{current_term, last_index + 1}`, registers the
    /// round as pending, and enqueues it in the message queue and the log.
    /// Returns as soon as the operation is locally enqueued; commitment is
    /// asynchronous and reported through the round's replicated callback.
    #[tracing::instrument(level = "trace", skip(self, round))]
    pub async fn replicate(&self, round: Arc<Round>) -> ConsensusResult<()> {
        self.check_fatal()?;
        {
            let mut state = self.inner.state.lock().unwrap();
            self.replicate_locked(&mut state, &round)?;
        }
        self.inner.peer_manager.signal_request_all();
        self.report_state();
        Ok(())
    }

    /// Ensure this replica is currently leader and stamp the round with the
    /// current term. Replication later refuses the round if the term has
    /// changed in the meantime.
    pub fn check_leadership_and_bind_term(&self, round: &Arc<Round>) -> ConsensusResult<()> {
        let state = self.inner.state.lock().unwrap();
        Self::check_running_locked(&state)?;
        if self.role_locked(&state) != RaftRole::Leader {
            return Err(ConsensusError::IllegalState(format!(
                "replica {} is not leader of this config",
                self.inner.local_peer.uuid
            )));
        }
        round.bind_term(state.meta.current_term());
        Ok(())
    }

    /// Stop running consensus. Drains in-flight work, fails every pending
    /// round with `Aborted`, and transitions to SHUT_DOWN. Idempotent.
    #[tracing::instrument(level = "debug", skip(self), fields(tablet = %self.inner.tablet_id, peer = %self.inner.local_peer.uuid))]
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle >= LifecycleState::ShuttingDown {
                return;
            }
            state.lifecycle = LifecycleState::ShuttingDown;
        }
        self.report_state();
        self.inner.failure_detector.shutdown();
        self.inner.peer_manager.close();

        // Wait out any in-flight update or vote.
        let _update = self.inner.update_lock.lock().await;

        // Drain the appender, if it ever started.
        let appender_running = self.inner.log_rx.lock().unwrap().is_none();
        if appender_running {
            let (tx, rx) = oneshot::channel();
            if self.inner.log_tx.send(LogTask::Stop { ack: tx }).is_ok() {
                let _ = rx.await;
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            let committed = state.pending.last_committed_index();
            state.pending.abort_ops_after(committed);
            state.leader_uuid = None;
            state.lifecycle = LifecycleState::Shutdown;
        }
        (self.inner.mark_dirty)("consensus shut down");
        self.report_state();
    }

    //------------------------------------------------------------
    // Observable state
    //------------------------------------------------------------

    pub fn tablet_id(&self) -> &str {
        &self.inner.tablet_id
    }

    pub fn peer_uuid(&self) -> &str {
        &self.inner.local_peer.uuid
    }

    pub fn time_manager(&self) -> Arc<TimeManager> {
        self.inner.time_manager.clone()
    }

    pub fn role(&self) -> RaftRole {
        let state = self.inner.state.lock().unwrap();
        self.role_locked(&state)
    }

    pub fn current_term(&self) -> i64 {
        self.inner.state.lock().unwrap().meta.current_term()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().lifecycle == LifecycleState::Running
    }

    pub fn committed_config(&self) -> RaftConfig {
        self.inner.state.lock().unwrap().meta.committed_config().clone()
    }

    pub fn pending_config(&self) -> Option<RaftConfig> {
        self.inner.state.lock().unwrap().meta.pending_config().cloned()
    }

    /// The last OpId this replica knows about, either received or committed.
    pub fn get_last_opid(&self, ty: OpIdType) -> OpId {
        let state = self.inner.state.lock().unwrap();
        match ty {
            OpIdType::Received => state.last_received,
            OpIdType::Committed => state.pending.last_committed_opid(),
        }
    }

    /// A copy of the externally observable consensus state.
    pub fn consensus_state(&self) -> ConsensusState {
        let state = self.inner.state.lock().unwrap();
        self.state_snapshot(&state)
    }

    /// Subscribe to consensus-state updates.
    pub fn state_watch(&self) -> watch::Receiver<ConsensusState> {
        self.inner.tx_state.subscribe()
    }

    /// The log indexes consensus would like retained: everything above the
    /// committed index for durability, everything the farthest-behind peer
    /// still needs for catch-up.
    pub fn retention_indexes(&self) -> RetentionIndexes {
        let committed = {
            let state = self.inner.state.lock().unwrap();
            state.pending.last_committed_index()
        };
        RetentionIndexes {
            for_durability: committed,
            for_peers: self.inner.queue.all_replicated_index().min(committed),
        }
    }

    /// Wait until this replica has the LEADER role, or time out.
    pub async fn wait_until_leader(&self, timeout: Duration) -> ConsensusResult<()> {
        let wait = Wait {
            timeout,
            rx: self.inner.tx_state.subscribe(),
        };
        wait.until(|s| s.role == RaftRole::Leader, "this replica to become leader")
            .await
            .map(|_| ())
    }

    //------------------------------------------------------------
    // Internal helpers shared with the update / vote / admin paths
    //------------------------------------------------------------

    fn check_fatal(&self) -> ConsensusResult<()> {
        if self.inner.fatal.load(Ordering::SeqCst) {
            return Err(ConsensusError::IllegalState(
                "tablet replica has failed and no longer accepts operations".to_string(),
            ));
        }
        Ok(())
    }

    fn check_running_locked(state: &CoreState) -> ConsensusResult<()> {
        match state.lifecycle {
            LifecycleState::Running => Ok(()),
            LifecycleState::Initialized => Err(ConsensusError::IllegalState(
                "consensus has not been started".to_string(),
            )),
            LifecycleState::ShuttingDown => Err(ConsensusError::ServiceUnavailable(
                "consensus is shutting down".to_string(),
            )),
            LifecycleState::Shutdown => Err(ConsensusError::IllegalState(
                "consensus is shut down".to_string(),
            )),
        }
    }

    fn role_locked(&self, state: &CoreState) -> RaftRole {
        let uuid = &self.inner.local_peer.uuid;
        match state.meta.active_config().get_peer(uuid) {
            None => RaftRole::NonParticipant,
            Some(_) if state.leader_uuid.as_ref() == Some(uuid) => RaftRole::Leader,
            Some(peer) if peer.role == MemberRole::Voter => RaftRole::Follower,
            Some(_) => RaftRole::Learner,
        }
    }

    /// Record a fatal persistence failure: the replica stops accepting
    /// operations and the layer above is signalled through the dirty
    /// callback.
    fn fatal_error(&self, context: &str, error: anyhow::Error) -> ConsensusError {
        tracing::error!(tablet = %self.inner.tablet_id, %error, "{}", context);
        self.inner.fatal.store(true, Ordering::SeqCst);
        (self.inner.mark_dirty)(&format!("{}: {}", context, error));
        ConsensusError::Io(error)
    }

    /// Flush the consensus metadata record. Callers hold the update lock so
    /// that flushes cannot be reordered against each other.
    async fn flush_meta(&self) -> ConsensusResult<()> {
        let snapshot = {
            let state = self.inner.state.lock().unwrap();
            state.meta.snapshot()
        };
        self.inner
            .meta_store
            .flush(&snapshot)
            .await
            .map_err(|e| self.fatal_error("consensus metadata flush failed", e))
    }

    /// Leader-side enqueue of one round: id assignment, pending registration,
    /// queue append, and log append, all under the core lock.
    fn replicate_locked(&self, state: &mut CoreState, round: &Arc<Round>) -> ConsensusResult<()> {
        Self::check_running_locked(state)?;
        if self.role_locked(state) != RaftRole::Leader {
            return Err(ConsensusError::IllegalState(format!(
                "replica {} is not leader of this config",
                self.inner.local_peer.uuid
            )));
        }
        let term = state.meta.current_term();
        let bound = round.bound_term();
        if bound != -1 && bound != term {
            return Err(ConsensusError::Aborted(format!(
                "round bound to term {} but the current term is {}",
                bound, term
            )));
        }

        let id = OpId::new(term, state.last_received.index + 1);
        round.assign_id(id, self.inner.time_manager.now());
        // The queue enforces the memory budget; check it before mutating
        // anything else.
        self.inner.queue.append_operation(round.replicate_msg())?;
        state.pending.add_pending_operation(round.clone())?;
        state.last_received = id;
        state.last_received_current_leader = id;
        self.inner
            .log_tx
            .send(LogTask::Append {
                ops: vec![round.replicate_msg()],
                ack: None,
            })
            .map_err(|_| ConsensusError::ServiceUnavailable("log appender is not running".to_string()))?;
        tracing::trace!(op = %id, "appended operation to leader log and queue");
        Ok(())
    }

    /// Assume leadership for the current term. Caller holds the core lock
    /// and has verified the election result.
    fn become_leader_locked(&self, state: &mut CoreState) {
        let term = state.meta.current_term();
        tracing::info!(
            tablet = %self.inner.tablet_id,
            peer = %self.inner.local_peer.uuid,
            term,
            "becoming leader"
        );
        state.leader_uuid = Some(self.inner.local_peer.uuid.clone());
        state.last_received_current_leader = state.last_received;
        state.failed_elections = 0;
        self.inner.failure_detector.disable();

        let committed_voters = state.meta.committed_config().voter_uuids();
        let pending_voters = state.meta.pending_config().map(|c| c.voter_uuids());
        let members = state.meta.active_config().members.clone();
        self.inner.queue.set_leader_mode(
            term,
            state.pending.last_committed_index(),
            self.inner.local_peer.clone(),
            members.clone(),
            committed_voters,
            pending_voters,
        );
        self.inner.peer_manager.start_peers(&members);
    }

    /// Relinquish leadership (or stay a follower under a new term/leader).
    /// Pending rounds are kept: their entries are in the log, and the next
    /// leader either commits or overwrites them.
    fn become_follower_locked(&self, state: &mut CoreState, leader_uuid: Option<ReplicaId>) {
        let was_leader = self.role_locked(state) == RaftRole::Leader;
        state.leader_uuid = leader_uuid;
        if was_leader {
            tracing::info!(
                tablet = %self.inner.tablet_id,
                peer = %self.inner.local_peer.uuid,
                term = state.meta.current_term(),
                "stepping down"
            );
            self.inner.peer_manager.close();
            self.inner.queue.set_non_leader_mode();
        }
        self.inner.failure_detector.enable();
    }

    /// Append the leader's no-op entry for its new term, which implicitly
    /// commits surviving entries from prior terms (§5.4.2).
    async fn append_leader_noop(&self) -> ConsensusResult<()> {
        let round = Round::new(
            ReplicateMsg::new(ReplicatePayload::NoOp),
            Box::new(|result| match result {
                Ok(()) => tracing::trace!("leader no-op committed"),
                Err(error) => tracing::debug!(%error, "leader no-op abandoned"),
            }),
        );
        self.check_leadership_and_bind_term(&round)?;
        self.replicate(round).await
    }

    /// Config-change side effects for freshly committed rounds. Returns true
    /// when the metadata record needs flushing.
    fn apply_commits_locked(&self, state: &mut CoreState, committed: &[Arc<Round>]) -> bool {
        let mut meta_dirty = false;
        for round in committed {
            if !round.is_config_change() {
                continue;
            }
            match state.meta.commit_pending_config() {
                Ok(()) => meta_dirty = true,
                // Already promoted by a later append in the same batch.
                Err(error) => tracing::debug!(%error, op = %round.id(), "config change already resolved"),
            }
            let config = state.meta.committed_config().clone();
            tracing::info!(
                tablet = %self.inner.tablet_id,
                opid_index = config.opid_index,
                members = config.members.len(),
                "committed configuration change"
            );
            if self.role_locked(state) == RaftRole::Leader {
                let committed_voters = config.voter_uuids();
                let pending_voters = state.meta.pending_config().map(|c| c.voter_uuids());
                let members = state.meta.active_config().members.clone();
                self.inner.queue.update_config(members.clone(), committed_voters, pending_voters);
                self.inner.peer_manager.update_peers(&members);
            }
            (self.inner.mark_dirty)("config changed");
        }
        meta_dirty
    }

    /// After aborting pending operations above `index`, drop a pending
    /// config whose entry was among them. Returns true when the metadata
    /// record needs flushing.
    fn clear_aborted_config_locked(&self, state: &mut CoreState, index: i64) -> bool {
        if let Some(pending) = state.meta.pending_config() {
            if pending.opid_index > index {
                tracing::info!(
                    opid_index = pending.opid_index,
                    "abandoning pending configuration change"
                );
                state.meta.clear_pending_config();
                return true;
            }
        }
        false
    }

    /// The OpId of the last entry surviving in the log view: the last pending
    /// round, or the last committed operation when nothing is pending.
    fn tail_opid_locked(state: &CoreState) -> OpId {
        if state.pending.is_empty() {
            state.pending.last_committed_opid()
        } else {
            state
                .pending
                .get(state.pending.last_pending_index())
                .map(|r| r.id())
                .unwrap_or_else(|| state.pending.last_committed_opid())
        }
    }

    fn state_snapshot(&self, state: &CoreState) -> ConsensusState {
        ConsensusState {
            tablet_id: self.inner.tablet_id.clone(),
            peer_uuid: self.inner.local_peer.uuid.clone(),
            role: self.role_locked(state),
            lifecycle: state.lifecycle,
            current_term: state.meta.current_term(),
            leader_uuid: state.leader_uuid.clone(),
            voted_for: state.meta.voted_for().cloned(),
            last_received: state.last_received,
            committed_index: state.pending.last_committed_index(),
            committed_config: state.meta.committed_config().clone(),
            pending_config: state.meta.pending_config().cloned(),
        }
    }

    fn report_state(&self) {
        let snapshot = {
            let state = self.inner.state.lock().unwrap();
            self.state_snapshot(&state)
        };
        self.inner.tx_state.send_replace(snapshot);
    }

    //------------------------------------------------------------
    // PeerMessageQueue observer notifications
    //------------------------------------------------------------

    /// The majority watermark advanced: commit and apply everything up to it.
    /// Idempotent.
    async fn handle_commit_index_notification(&self, commit_index: i64) {
        let _update = self.inner.update_lock.lock().await;
        let meta_dirty = {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle != LifecycleState::Running || self.role_locked(&state) != RaftRole::Leader {
                return;
            }
            let clamped = commit_index.min(state.last_received.index);
            let committed = state.pending.advance_committed_index(clamped);
            if committed.is_empty() {
                return;
            }
            tracing::debug!(commit_index = clamped, ops = committed.len(), "advanced commit index");
            self.apply_commits_locked(&mut state, &committed)
        };
        if meta_dirty {
            let _ = self.flush_meta().await;
        }
        self.report_state();
    }

    /// A peer reported a higher term: step down into it.
    async fn handle_term_change_notification(&self, term: i64) {
        let _update = self.inner.update_lock.lock().await;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle != LifecycleState::Running || term <= state.meta.current_term() {
                return;
            }
            if state.meta.set_current_term(term).is_err() {
                return;
            }
            self.become_follower_locked(&mut state, None);
        }
        if self.flush_meta().await.is_err() {
            return;
        }
        (self.inner.mark_dirty)("observed higher term from peer");
        self.report_state();
    }

    async fn report_failure_detected(&self) {
        if let Err(error) = self
            .start_election(ElectionMode::Normal, ElectionReason::ElectionTimeoutExpired)
            .await
        {
            tracing::warn!(
                tablet = %self.inner.tablet_id,
                %error,
                "failed to trigger leader election on detected leader failure"
            );
        }
    }
}

/// Queue → core callback shim. Spawns the real work onto the runtime so the
/// queue's internal lock is never held across core-lock acquisition.
struct QueueObserver {
    inner: std::sync::Weak<ConsensusInner>,
}

impl PeerMessageQueueObserver for QueueObserver {
    fn notify_commit_index(&self, commit_index: i64) {
        if let Some(inner) = self.inner.upgrade() {
            let consensus = RaftConsensus { inner };
            tokio::spawn(async move {
                consensus.handle_commit_index_notification(commit_index).await;
            });
        }
    }

    fn notify_term_change(&self, term: i64) {
        if let Some(inner) = self.inner.upgrade() {
            let consensus = RaftConsensus { inner };
            tokio::spawn(async move {
                consensus.handle_term_change_notification(term).await;
            });
        }
    }

    fn notify_failed_follower(&self, uuid: &str, term: i64, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            tracing::warn!(
                tablet = %inner.tablet_id,
                peer = uuid,
                term,
                reason,
                "follower failed"
            );
            (inner.mark_dirty)(&format!("follower {} failed: {}", uuid, reason));
        }
    }
}

/// The single log-appender task: applies appends and truncations in enqueue
/// order, acknowledges durability, and feeds the local watermark back into
/// the queue.
async fn appender_main(
    log: Arc<dyn Log>,
    queue: Arc<PeerMessageQueue>,
    weak: std::sync::Weak<ConsensusInner>,
    mut rx: mpsc::UnboundedReceiver<LogTask>,
) {
    while let Some(task) = rx.recv().await {
        match task {
            LogTask::Append { ops, ack } => {
                let result = async {
                    let last = log.append(&ops).await?;
                    log.sync().await?;
                    Ok::<OpId, anyhow::Error>(last)
                }
                .await;
                match result {
                    Ok(last) => {
                        queue.local_peer_appended(last);
                        if let Some(ack) = ack {
                            let _ = ack.send(Ok(last));
                        }
                    }
                    Err(error) => {
                        let wrapped = match weak.upgrade() {
                            Some(inner) => RaftConsensus { inner }.fatal_error("log append failed", error),
                            None => ConsensusError::Io(error),
                        };
                        if let Some(ack) = ack {
                            let _ = ack.send(Err(wrapped));
                        }
                    }
                }
            }
            LogTask::Truncate { after_index, ack } => {
                let result = log
                    .truncate_after(after_index)
                    .await
                    .map_err(|error| match weak.upgrade() {
                        Some(inner) => RaftConsensus { inner }.fatal_error("log truncation failed", error),
                        None => ConsensusError::Io(error),
                    });
                let _ = ack.send(result);
            }
            LogTask::Stop { ack } => {
                let _ = ack.send(());
                break;
            }
        }
    }
}
