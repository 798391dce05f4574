//! A Raft consensus core for replicated tablets.
//!
//! Each [`RaftConsensus`] instance drives one replicated state machine (a
//! "tablet") across a small group of peers: it orders client-submitted
//! operations, replicates them to followers, advances the commit index once a
//! majority acknowledges durability, and elects a new leader automatically
//! when the current one fails.
//!
//! The storage and transport surfaces are traits supplied by the embedding
//! server: the write-ahead [`Log`], the persistent [`MetaStore`] record, the
//! peer [`Messenger`], and the [`ReplicaTransactionFactory`] that prepares
//! and applies committed operations. The `memstore` crate in this workspace
//! provides in-memory implementations for demo and testing purposes.
//!
//! For the protocol itself, see
//! [the Raft paper](https://raft.github.io/raft.pdf) (**pdf warning**);
//! section references in this crate (§5.2, §5.4.2, ...) point there.

pub mod config;
mod core;
mod election;
pub mod error;
mod failure_detector;
mod metadata;
pub mod metrics;
pub mod network;
mod peers;
mod pending;
mod queue;
pub mod raft;
pub mod raft_types;
pub mod round;
pub mod storage;
pub mod time;

pub use async_trait;

pub use crate::config::ConsensusOptions;
pub use crate::config::OptionsBuilder;
pub use crate::config::OptionsError;
pub use crate::core::MarkDirtyCallback;
pub use crate::core::RaftConsensus;
pub use crate::error::ConsensusError;
pub use crate::error::ConsensusErrorCode;
pub use crate::error::ConsensusResult;
pub use crate::metrics::ConsensusState;
pub use crate::metrics::Wait;
pub use crate::network::Messenger;
pub use crate::raft::AppendEntriesRequest;
pub use crate::raft::AppendEntriesResponse;
pub use crate::raft::ChangeConfigRequest;
pub use crate::raft::ChangeConfigType;
pub use crate::raft::ElectionMode;
pub use crate::raft::ElectionReason;
pub use crate::raft::OpIdType;
pub use crate::raft::RunLeaderElectionRequest;
pub use crate::raft::UnsafeChangeConfigRequest;
pub use crate::raft::VoteRequest;
pub use crate::raft::VoteResponse;
pub use crate::raft_types::ConsensusBootstrapInfo;
pub use crate::raft_types::LifecycleState;
pub use crate::raft_types::MemberRole;
pub use crate::raft_types::OpId;
pub use crate::raft_types::RaftConfig;
pub use crate::raft_types::RaftPeer;
pub use crate::raft_types::RaftRole;
pub use crate::raft_types::ReplicateMsg;
pub use crate::raft_types::ReplicatePayload;
pub use crate::raft_types::RetentionIndexes;
pub use crate::round::ReplicatedCallback;
pub use crate::round::Round;
pub use crate::storage::Log;
pub use crate::storage::MetaStore;
pub use crate::storage::PersistentState;
pub use crate::storage::ReplicaTransactionFactory;
pub use crate::time::HybridTimestamp;
pub use crate::time::TimeManager;

/// The unique identity of one replica within a tablet's config.
pub type ReplicaId = String;
