//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

/// A result type where the error variant is always a `ConsensusError`.
pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;

/// The status taxonomy propagated by every consensus operation.
///
/// Protocol-level rejections (a vote denied, a mismatched preceding entry)
/// are not errors: they are carried inside the corresponding response as a
/// [`ConsensusErrorCode`] so the caller can react to them verbatim.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConsensusError {
    /// The operation is not valid for the current role, lifecycle state, or
    /// term binding.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A malformed config change, a bad OpId sequence, or similar caller error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unknown peer, or an OpId not present in the log.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was cancelled due to a leader change or shutdown.
    #[error("aborted: {0}")]
    Aborted(String),

    /// An election, RPC, or wait deadline expired.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Shutting down, the message queue is full, or the tablet is under
    /// memory pressure.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Log or metadata persistence failed. This is fatal for the tablet: the
    /// core stops accepting writes and signals upward via the dirty callback.
    #[error("io error: {0}")]
    Io(anyhow::Error),
}

impl From<anyhow::Error> for ConsensusError {
    fn from(src: anyhow::Error) -> Self {
        ConsensusError::Io(src)
    }
}

impl ConsensusError {
    /// True if this error indicates the tablet can no longer make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::Io(_))
    }
}

/// Wire-level consensus error codes.
///
/// These travel inside `AppendEntriesResponse` and `VoteResponse` and are
/// reported to higher layers without translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusErrorCode {
    /// The request's term is behind the responder's.
    InvalidTerm,
    /// The responder has recently heard from a live leader and withholds its
    /// vote.
    LeaderIsAlive,
    /// The responder already voted for a different candidate in this term.
    AlreadyVoted,
    /// The candidate's log does not contain all of the responder's entries.
    LastOpIdTooOld,
    /// The responder is currently processing another vote or append and
    /// cannot serve this request.
    ConsensusBusy,
    /// A different leader has already been observed in this term.
    LeaderConflict,
    /// The preceding entry in an AppendEntries request did not match the
    /// responder's log; the leader must back off.
    PrecedingEntryDidntMatch,
}

impl std::fmt::Display for ConsensusErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
