//! The ordered map of operations pending replication.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConsensusError;
use crate::error::ConsensusResult;
use crate::raft_types::OpId;
use crate::round::Round;

/// Tracks uncommitted rounds, keyed by index.
///
/// Invariants: at most one round per index; rounds are contiguous from the
/// last committed index, with no gaps.
///
/// `PendingRounds` fires replicated callbacks inline (they are required to be
/// cheap), which keeps callback invocation in strict index order across
/// interleaved commit advances and aborts.
pub(crate) struct PendingRounds {
    pending: BTreeMap<i64, Arc<Round>>,
    last_committed: OpId,
}

impl PendingRounds {
    pub fn new(last_committed: OpId) -> Self {
        Self {
            pending: BTreeMap::new(),
            last_committed,
        }
    }

    pub fn last_committed_opid(&self) -> OpId {
        self.last_committed
    }

    pub fn last_committed_index(&self) -> i64 {
        self.last_committed.index
    }

    /// The index of the last pending round, or the last committed index when
    /// nothing is pending.
    pub fn last_pending_index(&self) -> i64 {
        self.pending
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.last_committed.index)
    }

    pub fn get(&self, index: i64) -> Option<&Arc<Round>> {
        self.pending.get(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Insert a new pending round. Its index must directly follow the last
    /// pending one (or the last committed one when the map is empty).
    pub fn add_pending_operation(&mut self, round: Arc<Round>) -> ConsensusResult<()> {
        let index = round.id().index;
        let expected = self.last_pending_index() + 1;
        if index != expected {
            return Err(ConsensusError::InvalidArgument(format!(
                "cannot add pending operation {}: expected index {}",
                round.id(),
                expected
            )));
        }
        self.pending.insert(index, round);
        Ok(())
    }

    /// Abort every pending round with an index greater than `index`, invoking
    /// their callbacks with `Aborted` in index order. Returns the number of
    /// aborted rounds.
    pub fn abort_ops_after(&mut self, index: i64) -> usize {
        let aborted = self.pending.split_off(&(index + 1));
        let count = aborted.len();
        for (_, round) in aborted {
            tracing::debug!(op = %round.id(), "aborting uncommitted operation");
            round.notify_replication_finished(Err(ConsensusError::Aborted(format!(
                "operation {} superseded or cancelled",
                round.id()
            ))));
        }
        count
    }

    /// Advance the committed index, invoking the callback of every round up
    /// to and including `new_index` with `Ok` in index order. Returns the
    /// committed rounds, also in index order.
    ///
    /// The commit index observed through here is non-decreasing: an advance
    /// to an already-committed index is a no-op.
    pub fn advance_committed_index(&mut self, new_index: i64) -> Vec<Arc<Round>> {
        let mut committed = Vec::new();
        while let Some((&index, _)) = self.pending.iter().next() {
            if index > new_index {
                break;
            }
            let round = self.pending.remove(&index).unwrap();
            self.last_committed = round.id();
            round.notify_replication_finished(Ok(()));
            committed.push(round);
        }
        committed
    }

    /// True if a pending round at `index` exists with exactly this OpId.
    pub fn has_op(&self, id: OpId) -> bool {
        self.pending.get(&id.index).map(|r| r.id() == id).unwrap_or(false)
    }
}
