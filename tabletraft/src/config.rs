//! Consensus runtime configuration.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default number of missed heartbeats after which a follower considers the
/// leader failed.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
/// Default cap on the exponential election backoff, in milliseconds.
pub const DEFAULT_BACKOFF_CAP: u64 = 10_000;
/// Default memory budget for the per-tablet message buffer, in bytes.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 4 * 1024 * 1024;
/// Default maximum number of operations per AppendEntries payload.
pub const DEFAULT_MAX_PAYLOAD_OPS: u64 = 300;
/// Default timeout for a single peer RPC, in milliseconds.
pub const DEFAULT_RPC_TIMEOUT: u64 = 1000;

/// The runtime configuration for one consensus instance.
///
/// The failure-detection window is derived rather than configured directly:
/// its base is `heartbeat_interval * max_missed_heartbeats`, and each arming
/// of the detector draws a uniformly random period in `[base, 2 * base]`.
/// Keep the inequality `broadcastTime ≪ electionTimeout ≪ MTBF` from the Raft
/// spec (§5.6) in mind when tuning these values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusOptions {
    /// The interval, in milliseconds, at which a leader sends heartbeats to
    /// its peers. This is also the default pacing of the per-peer outbound
    /// workers.
    pub heartbeat_interval: u64,
    /// How many heartbeat intervals may elapse without leader contact before
    /// the failure detector fires.
    pub max_missed_heartbeats: u32,
    /// Upper bound, in milliseconds, on the exponential backoff applied after
    /// repeated failed elections.
    pub backoff_cap: u64,
    /// Memory budget, in bytes, for the retained replicate-message buffer.
    /// When exceeded, entries still needed by a lagging peer may be evicted,
    /// failing that peer.
    pub memory_limit_bytes: u64,
    /// Whether candidates run a non-persistent pre-vote round before
    /// incrementing their term.
    pub enable_pre_vote: bool,
    /// The maximum number of operations transmitted in a single
    /// AppendEntries payload.
    pub max_payload_ops: u64,
    /// Timeout, in milliseconds, for a single outbound peer RPC.
    pub rpc_timeout: u64,
}

impl ConsensusOptions {
    /// Start the builder process for a new `ConsensusOptions` instance. Call
    /// `validate` when done.
    pub fn build() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// The base failure-detection period, in milliseconds.
    pub fn base_failure_period(&self) -> u64 {
        self.heartbeat_interval * self.max_missed_heartbeats as u64
    }

    /// Generate a new random election period, uniform in `[base, 2 * base]`.
    pub fn new_rand_election_period(&self) -> Duration {
        let base = self.base_failure_period();
        let ms = rand::thread_rng().gen_range(base..=base * 2);
        Duration::from_millis(ms)
    }

    /// Additional snooze applied to the failure detector after
    /// `failed_elections` consecutive unsuccessful elections, capped by
    /// `backoff_cap`.
    pub fn election_backoff(&self, failed_elections: u64) -> Duration {
        let exp = failed_elections.min(6) as u32;
        let ms = self
            .base_failure_period()
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap);
        Duration::from_millis(ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        // The defaults always validate.
        Self::build().validate().unwrap()
    }
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum OptionsError {
    /// The heartbeat interval must be positive.
    #[error("heartbeat_interval must be greater than 0")]
    InvalidHeartbeatInterval,

    /// Fewer than two tolerated missed heartbeats makes a single delayed
    /// heartbeat trigger an election.
    #[error("max_missed_heartbeats must be at least 2")]
    MaxMissedHeartbeatsTooSmall,

    /// The message buffer needs a non-zero budget.
    #[error("memory_limit_bytes must be greater than 0")]
    InvalidMemoryLimit,

    /// The given value for max_payload_ops is too small, must be > 0.
    #[error("the given value for max_payload_ops is too small, must be > 0")]
    MaxPayloadOpsTooSmall,

    /// A backoff cap below the base failure period would make backoff a no-op.
    #[error("backoff_cap must be at least heartbeat_interval * max_missed_heartbeats")]
    BackoffCapTooSmall,
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OptionsBuilder {
    pub heartbeat_interval: Option<u64>,
    pub max_missed_heartbeats: Option<u32>,
    pub backoff_cap: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub enable_pre_vote: Option<bool>,
    pub max_payload_ops: Option<u64>,
    pub rpc_timeout: Option<u64>,
}

impl OptionsBuilder {
    /// Set the desired value for `heartbeat_interval`, in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_missed_heartbeats`.
    pub fn max_missed_heartbeats(mut self, val: u32) -> Self {
        self.max_missed_heartbeats = Some(val);
        self
    }

    /// Set the desired value for `backoff_cap`, in milliseconds.
    pub fn backoff_cap(mut self, val: u64) -> Self {
        self.backoff_cap = Some(val);
        self
    }

    /// Set the desired value for `memory_limit_bytes`.
    pub fn memory_limit_bytes(mut self, val: u64) -> Self {
        self.memory_limit_bytes = Some(val);
        self
    }

    /// Enable or disable the pre-vote phase.
    pub fn enable_pre_vote(mut self, val: bool) -> Self {
        self.enable_pre_vote = Some(val);
        self
    }

    /// Set the desired value for `max_payload_ops`.
    pub fn max_payload_ops(mut self, val: u64) -> Self {
        self.max_payload_ops = Some(val);
        self
    }

    /// Set the desired value for `rpc_timeout`, in milliseconds.
    pub fn rpc_timeout(mut self, val: u64) -> Self {
        self.rpc_timeout = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new
    /// `ConsensusOptions` instance if valid.
    pub fn validate(self) -> Result<ConsensusOptions, OptionsError> {
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval == 0 {
            return Err(OptionsError::InvalidHeartbeatInterval);
        }
        let max_missed_heartbeats = self.max_missed_heartbeats.unwrap_or(DEFAULT_MAX_MISSED_HEARTBEATS);
        if max_missed_heartbeats < 2 {
            return Err(OptionsError::MaxMissedHeartbeatsTooSmall);
        }
        let backoff_cap = self.backoff_cap.unwrap_or(DEFAULT_BACKOFF_CAP);
        if backoff_cap < heartbeat_interval * max_missed_heartbeats as u64 {
            return Err(OptionsError::BackoffCapTooSmall);
        }
        let memory_limit_bytes = self.memory_limit_bytes.unwrap_or(DEFAULT_MEMORY_LIMIT_BYTES);
        if memory_limit_bytes == 0 {
            return Err(OptionsError::InvalidMemoryLimit);
        }
        let max_payload_ops = self.max_payload_ops.unwrap_or(DEFAULT_MAX_PAYLOAD_OPS);
        if max_payload_ops == 0 {
            return Err(OptionsError::MaxPayloadOpsTooSmall);
        }
        let rpc_timeout = self.rpc_timeout.unwrap_or(DEFAULT_RPC_TIMEOUT);
        Ok(ConsensusOptions {
            heartbeat_interval,
            max_missed_heartbeats,
            backoff_cap,
            memory_limit_bytes,
            enable_pre_vote: self.enable_pre_vote.unwrap_or(true),
            max_payload_ops,
            rpc_timeout,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let opts = ConsensusOptions::build().validate().unwrap();

        assert_eq!(opts.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(opts.max_missed_heartbeats, DEFAULT_MAX_MISSED_HEARTBEATS);
        assert_eq!(opts.backoff_cap, DEFAULT_BACKOFF_CAP);
        assert_eq!(opts.memory_limit_bytes, DEFAULT_MEMORY_LIMIT_BYTES);
        assert_eq!(opts.max_payload_ops, DEFAULT_MAX_PAYLOAD_OPS);
        assert!(opts.enable_pre_vote);
    }

    #[test]
    fn test_options_with_specified_values() {
        let opts = ConsensusOptions::build()
            .heartbeat_interval(500)
            .max_missed_heartbeats(6)
            .backoff_cap(60_000)
            .memory_limit_bytes(1024)
            .enable_pre_vote(false)
            .max_payload_ops(10)
            .rpc_timeout(250)
            .validate()
            .unwrap();

        assert_eq!(opts.heartbeat_interval, 500);
        assert_eq!(opts.max_missed_heartbeats, 6);
        assert_eq!(opts.base_failure_period(), 3000);
        assert!(!opts.enable_pre_vote);
    }

    #[test]
    fn test_invalid_options() {
        assert_eq!(
            ConsensusOptions::build().heartbeat_interval(0).validate().unwrap_err(),
            OptionsError::InvalidHeartbeatInterval,
        );
        assert_eq!(
            ConsensusOptions::build().max_missed_heartbeats(1).validate().unwrap_err(),
            OptionsError::MaxMissedHeartbeatsTooSmall,
        );
        assert_eq!(
            ConsensusOptions::build().backoff_cap(10).validate().unwrap_err(),
            OptionsError::BackoffCapTooSmall,
        );
        assert_eq!(
            ConsensusOptions::build().max_payload_ops(0).validate().unwrap_err(),
            OptionsError::MaxPayloadOpsTooSmall,
        );
    }

    #[test]
    fn test_rand_election_period_within_bounds() {
        let opts = ConsensusOptions::default();
        let base = opts.base_failure_period();
        for _ in 0..50 {
            let period = opts.new_rand_election_period().as_millis() as u64;
            assert!(period >= base && period <= base * 2);
        }
    }

    #[test]
    fn test_election_backoff_is_capped() {
        let opts = ConsensusOptions::build().backoff_cap(1000).heartbeat_interval(100).validate().unwrap();
        assert_eq!(opts.election_backoff(20), Duration::from_millis(1000));
        assert!(opts.election_backoff(0) >= Duration::from_millis(opts.base_failure_period()));
    }
}
