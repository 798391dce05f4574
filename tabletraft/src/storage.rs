//! The storage-facing interfaces: the write-ahead log, the persistent
//! consensus metadata record, and the replica transaction factory.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft_types::OpId;
use crate::raft_types::RaftConfig;
use crate::raft_types::ReplicateMsg;
use crate::round::Round;
use crate::ReplicaId;

/// The record of durable consensus state for one tablet.
///
/// Every change that grants a vote or advances the term is flushed before
/// any externally observable action reflects it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// The last recorded term observed by this replica.
    pub current_term: i64,
    /// The uuid of the candidate voted for in `current_term`, if any.
    pub voted_for: Option<ReplicaId>,
    /// The latest committed membership configuration.
    pub committed_config: RaftConfig,
    /// A membership change that has taken effect for quorum purposes but has
    /// not yet committed.
    pub pending_config: Option<RaftConfig>,
}

impl PersistentState {
    /// State for a pristine replica that has never voted.
    pub fn new_initial(committed_config: RaftConfig) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            committed_config,
            pending_config: None,
        }
    }
}

/// A trait defining the interface to the tablet's write-ahead log.
///
/// The consensus core is the log's single appender; implementations only need
/// to serialise appends against truncations, which the core already issues in
/// order.
///
/// Errors returned from any method are fatal for the tablet.
#[async_trait]
pub trait Log: Send + Sync + 'static {
    /// Append a batch of operations. Returns the OpId of the last appended
    /// operation once the batch has been written.
    async fn append(&self, ops: &[ReplicateMsg]) -> Result<OpId>;

    /// Make all previously appended operations durable.
    async fn sync(&self) -> Result<()>;

    /// Remove every operation with an index greater than `index`.
    async fn truncate_after(&self, index: i64) -> Result<()>;

    /// The OpId of the last operation in the log, or `OpId::MIN` for an
    /// empty log.
    fn last_opid(&self) -> OpId;
}

/// Storage for the persistent consensus metadata record.
///
/// The consensus core is the record's single writer.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Load the previously flushed record, or `None` for a pristine replica.
    async fn load(&self) -> Result<Option<PersistentState>>;

    /// Durably replace the record. Must not return until the record would
    /// survive a crash.
    async fn flush(&self, state: &PersistentState) -> Result<()>;
}

/// Creates replica transactions for operations received from the leader.
///
/// The factory is handed each round as it is appended; Prepare begins
/// asynchronously. When the round commits, the callback registered on it is
/// invoked and the transaction proceeds to Apply. The factory is responsible
/// for writing the Commit record to the log after Apply completes, and must
/// serialise Apply per tablet.
#[async_trait]
pub trait ReplicaTransactionFactory: Send + Sync + 'static {
    async fn start_replica_transaction(&self, round: Arc<Round>) -> Result<()>;
}
