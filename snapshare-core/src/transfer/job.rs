use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::TransferError;

/// Identifier of one user-initiated bulk action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BatchId(pub Uuid);

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Queued,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl JobState {
    pub fn is_resolved(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedTerminal)
    }
}

/// What the owning coordinator should do with a job after a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobTransition {
    /// Put the job back at the end of the queue.
    Requeue,
    /// Retries are exhausted or the error cannot be retried.
    Terminal,
}

/// Retry cap and backoff for transfer jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    /// Delay before running a job that has already been retried
    /// `attempt_count` times: nothing for the first run, then the base
    /// doubled per retry, capped.
    pub fn delay_before(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 || self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let exp = (attempt_count - 1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base: cfg.backoff_base(),
            backoff_max: cfg.backoff_max(),
        }
    }
}

/// One queued unit of work inside a batch.
///
/// `attempt_count` counts retries granted so far and never exceeds the
/// policy's `max_retries`.
#[derive(Clone, Debug)]
pub struct TransferJob<S> {
    source: S,
    state: JobState,
    attempt_count: u32,
    owner_batch: BatchId,
    /// Remote URL once the bytes have landed; a retry then only needs to
    /// persist the record.
    uploaded_url: Option<String>,
    last_error: Option<String>,
}

impl<S> TransferJob<S> {
    pub fn new(source: S, owner_batch: BatchId) -> Self {
        Self {
            source,
            state: JobState::Queued,
            attempt_count: 0,
            owner_batch,
            uploaded_url: None,
            last_error: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn owner_batch(&self) -> BatchId {
        self.owner_batch
    }

    pub fn uploaded_url(&self) -> Option<&str> {
        self.uploaded_url.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_uploaded_url(&mut self, url: String) {
        self.uploaded_url = Some(url);
    }

    pub fn start(&mut self) {
        debug_assert!(
            matches!(self.state, JobState::Queued | JobState::FailedRetryable),
            "job started from {:?}",
            self.state
        );
        self.state = JobState::InFlight;
    }

    pub fn succeed(&mut self) {
        self.state = JobState::Succeeded;
        self.last_error = None;
    }

    /// Record a failed attempt and decide whether the job goes back on the
    /// queue.
    pub fn fail(
        &mut self,
        error: &TransferError,
        policy: &RetryPolicy,
    ) -> JobTransition {
        self.last_error = Some(error.to_string());
        if error.is_retryable() && self.attempt_count < policy.max_retries {
            self.attempt_count += 1;
            self.state = JobState::FailedRetryable;
            JobTransition::Requeue
        } else {
            self.state = JobState::FailedTerminal;
            JobTransition::Terminal
        }
    }
}
