//! Per-call policies.
use std::time::Duration;

use crate::retry::RetryConfig;

/// How many replicas take part in a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// Read from the master replica only.
    #[default]
    One,
    /// Consult every replica.
    All,
}

/// Policy of reads and batch reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Bound on one attempt (connect, send and receive). `None` waits forever.
    pub timeout: Option<Duration>,

    /// Additional attempts after a transient failure.
    pub max_retries: u32,

    /// Pause before each additional attempt.
    pub sleep_between_retries: Duration,

    /// Passed through to the server unchanged.
    pub consistency: ConsistencyLevel,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timeout: None,
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(500),
            consistency: ConsistencyLevel::One,
        }
    }
}

impl Policy {
    /// Retry settings derived from this policy.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            sleep_between_retries: self.sleep_between_retries,
        }
    }
}

/// Policy of writes and deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritePolicy {
    /// Timeout and retry settings.
    pub policy: Policy,

    /// Record time to live in seconds, 0 means never expire.
    pub expiration: u32,
}
