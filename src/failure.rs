//! Error classification and retry policy for stage executions.
use std::time::Duration;
use thiserror::Error;

/// A collaborator failure, classified by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Network timeout, rate limit, expired session. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Malformed content, permanent rejection, content policy. Never retried.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        StageError::Terminal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    /// The bare reason without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            StageError::Transient(r) | StageError::Terminal(r) => r,
        }
    }
}

/// What a stage executor reports back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    /// The side effect happened (now or earlier); carries its result.
    Succeeded(String),
    /// Nothing to do for this stage; carries the reason.
    Skipped(String),
    /// Transient failure with attempts left.
    Retry(String),
    /// Terminal failure or retries exhausted.
    Failed(String),
}

/// Bounded exponential backoff for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1_u32 << exp);
        delay.min(self.max_delay)
    }

    /// `attempt` is the last one allowed.
    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(300))
    }
}
