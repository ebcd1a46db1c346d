//! Retry policy: decides retry vs dead-letter, and the backoff delay.

use std::time::Duration;

use super::DeadLetterReason;
use crate::domain::{ErrorKind, Failure};

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job after `delay`.
    Retry { delay: Duration },
    /// Give up and dead-letter the job.
    DeadLetter { reason: DeadLetterReason },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::Retry { delay } => Some(*delay),
            RetryDecision::DeadLetter { .. } => None,
        }
    }
}

/// Retry policy for failed jobs.
///
/// # 判定
/// 1. 最終的な retryable = `caller_retryable && !is_always_fatal(failure)`
/// 2. retryable かつ `attempt < max_attempts` なら retry
///    - delay = `backoff[min(attempt - 1, backoff.len() - 1)]`
/// 3. それ以外は dead-letter
///
/// `max_attempts`・`backoff`・常に fatal な kind の集合はすべて設定値です
/// （`EngineConfig` から組み立てる）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub fatal_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
            fatal_kinds: vec![
                ErrorKind::ValidationError,
                ErrorKind::SecurityDenied,
                ErrorKind::NotFound,
            ],
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_fatal_kinds(mut self, fatal_kinds: Vec<ErrorKind>) -> Self {
        self.fatal_kinds = fatal_kinds;
        self
    }

    /// Contract mismatches and the configured fatal kinds never retry.
    pub fn is_always_fatal(&self, failure: &Failure) -> bool {
        failure.code.is_some_and(|code| code.is_always_fatal())
            || self.fatal_kinds.contains(&failure.kind)
    }

    /// Backoff before the next attempt. `attempt` is 1-based; 0 is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let Some(last) = self.backoff.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt.saturating_sub(1) as usize).min(last);
        self.backoff[index]
    }

    /// Decide what happens to a job that just failed on its `attempt`-th claim.
    pub fn decide(&self, failure: &Failure, caller_retryable: bool, attempt: u32) -> RetryDecision {
        if !caller_retryable || self.is_always_fatal(failure) {
            return RetryDecision::DeadLetter {
                reason: DeadLetterReason::Fatal,
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::DeadLetter {
                reason: DeadLetterReason::Exhausted,
            };
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }
}
