//! The in-memory image of the persistent consensus metadata record.

use crate::error::ConsensusError;
use crate::error::ConsensusResult;
use crate::raft_types::RaftConfig;
use crate::storage::PersistentState;
use crate::ReplicaId;

/// Owns the `(current_term, voted_for, committed_config, pending_config)`
/// record and enforces its mutation rules:
///
/// - the term never decreases, and advancing it clears `voted_for`;
/// - within a term, a vote is recorded at most once and never rewritten;
/// - at most one pending config exists at a time.
///
/// `ConsensusMeta` holds no I/O handle. Mutations mark the record dirty; the
/// core takes a [`snapshot`](ConsensusMeta::snapshot) under its lock and
/// flushes it through the `MetaStore` outside the lock, before any externally
/// observable action reflects the change.
pub(crate) struct ConsensusMeta {
    state: PersistentState,
}

impl ConsensusMeta {
    pub fn new(state: PersistentState) -> Self {
        Self { state }
    }

    pub fn current_term(&self) -> i64 {
        self.state.current_term
    }

    /// Advance the term, clearing any vote recorded in the old term.
    pub fn set_current_term(&mut self, term: i64) -> ConsensusResult<()> {
        if term <= self.state.current_term {
            return Err(ConsensusError::IllegalState(format!(
                "cannot move current term from {} to {}",
                self.state.current_term, term
            )));
        }
        self.state.current_term = term;
        self.state.voted_for = None;
        Ok(())
    }

    pub fn voted_for(&self) -> Option<&ReplicaId> {
        self.state.voted_for.as_ref()
    }

    /// Record a vote in the current term. Granting the same candidate twice
    /// is idempotent; granting a different candidate is refused.
    pub fn record_vote(&mut self, candidate: &str) -> ConsensusResult<()> {
        match &self.state.voted_for {
            Some(existing) if existing != candidate => Err(ConsensusError::IllegalState(format!(
                "already voted for {} in term {}",
                existing, self.state.current_term
            ))),
            _ => {
                self.state.voted_for = Some(candidate.to_string());
                Ok(())
            }
        }
    }

    pub fn committed_config(&self) -> &RaftConfig {
        &self.state.committed_config
    }

    pub fn pending_config(&self) -> Option<&RaftConfig> {
        self.state.pending_config.as_ref()
    }

    pub fn has_pending_config(&self) -> bool {
        self.state.pending_config.is_some()
    }

    /// The config used for quorum computation: the pending config from the
    /// moment it is received, else the committed one.
    pub fn active_config(&self) -> &RaftConfig {
        self.state.pending_config.as_ref().unwrap_or(&self.state.committed_config)
    }

    pub fn set_pending_config(&mut self, config: RaftConfig) -> ConsensusResult<()> {
        if let Some(pending) = &self.state.pending_config {
            return Err(ConsensusError::IllegalState(format!(
                "config change at index {} still pending",
                pending.opid_index
            )));
        }
        self.state.pending_config = Some(config);
        Ok(())
    }

    /// Drop the pending config after its entry was aborted; the committed
    /// config remains in force.
    pub fn clear_pending_config(&mut self) {
        self.state.pending_config = None;
    }

    /// Promote the pending config to committed after its entry committed.
    pub fn commit_pending_config(&mut self) -> ConsensusResult<()> {
        match self.state.pending_config.take() {
            Some(config) => {
                self.state.committed_config = config;
                Ok(())
            }
            None => Err(ConsensusError::IllegalState(
                "no pending config to commit".to_string(),
            )),
        }
    }

    /// Operator recovery: replace the committed config outright and drop any
    /// pending one.
    pub fn overwrite_committed_config(&mut self, config: RaftConfig) {
        self.state.committed_config = config;
        self.state.pending_config = None;
    }

    /// A copy of the record, suitable for flushing outside the core lock.
    pub fn snapshot(&self) -> PersistentState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft_types::RaftPeer;

    fn meta() -> ConsensusMeta {
        let config = RaftConfig::bootstrap(vec![RaftPeer::new_voter("a", "host-a", 7050)]);
        ConsensusMeta::new(PersistentState::new_initial(config))
    }

    #[test]
    fn test_term_is_monotonic() {
        let mut meta = meta();
        meta.set_current_term(3).unwrap();
        assert!(meta.set_current_term(3).is_err());
        assert!(meta.set_current_term(2).is_err());
        assert_eq!(meta.current_term(), 3);
    }

    #[test]
    fn test_term_advance_clears_vote() {
        let mut meta = meta();
        meta.set_current_term(1).unwrap();
        meta.record_vote("b").unwrap();
        assert_eq!(meta.voted_for(), Some(&"b".to_string()));

        meta.set_current_term(2).unwrap();
        assert_eq!(meta.voted_for(), None);
    }

    #[test]
    fn test_vote_is_set_once_per_term() {
        let mut meta = meta();
        meta.set_current_term(1).unwrap();
        meta.record_vote("b").unwrap();
        // Idempotent for the same candidate.
        meta.record_vote("b").unwrap();
        // Refused for a different one.
        assert!(meta.record_vote("c").is_err());
    }

    #[test]
    fn test_pending_config_lifecycle() {
        let mut meta = meta();
        let mut new_config = meta.committed_config().clone();
        new_config.opid_index = 5;
        new_config.members.push(RaftPeer::new_voter("b", "host-b", 7050));

        meta.set_pending_config(new_config.clone()).unwrap();
        assert!(meta.set_pending_config(new_config.clone()).is_err());
        assert_eq!(meta.active_config(), &new_config);

        meta.commit_pending_config().unwrap();
        assert!(!meta.has_pending_config());
        assert_eq!(meta.committed_config(), &new_config);
        assert!(meta.commit_pending_config().is_err());
    }
}
