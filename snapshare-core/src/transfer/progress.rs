//! Batch bookkeeping and the smoothed progress bar.
//!
//! Progress here is an approximation for the UI: byte-level progress is not
//! available, so the bar creeps toward a ceiling on a timer and snaps to 1.0
//! once every job has resolved. Only monotonicity and the final snap are
//! guaranteed.

use crate::config::ProgressConfig;
use crate::transfer::job::BatchId;

/// How a finished batch went, as shown to the user.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchOutcome {
    AllSucceeded,
    PartiallySucceeded { completed: usize, failed: usize },
    AllFailed,
}

impl BatchOutcome {
    pub fn from_counts(completed: usize, failed: usize) -> Self {
        match (completed, failed) {
            (_, 0) => BatchOutcome::AllSucceeded,
            (0, _) => BatchOutcome::AllFailed,
            (completed, failed) => {
                BatchOutcome::PartiallySucceeded { completed, failed }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BatchPhase {
    Running,
    /// Every job resolved; the handle lingers so the UI can show the result.
    Completed(BatchOutcome),
    /// The handle has been retired.
    Retired(BatchOutcome),
}

/// UI-facing view of one batch operation.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Smoothed 0..=1 value; not a literal fraction of work done.
    pub reported_progress: f32,
    pub phase: BatchPhase,
}

impl BatchSnapshot {
    pub fn new(batch_id: BatchId, total: usize) -> Self {
        Self {
            batch_id,
            total,
            completed: 0,
            failed: 0,
            reported_progress: 0.0,
            phase: BatchPhase::Running,
        }
    }

    pub fn resolved(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, BatchPhase::Running)
    }
}

/// Asymptotic progress: each tick closes a fixed fraction of the gap to the
/// ceiling.
#[derive(Clone, Copy, Debug)]
pub struct ProgressSmoother {
    ceiling: f32,
    factor: f32,
}

impl ProgressSmoother {
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            ceiling: config.ceiling,
            factor: config.smoothing_factor,
        }
    }

    pub fn next(&self, current: f32) -> f32 {
        if current >= self.ceiling {
            return current;
        }
        (current + (self.ceiling - current) * self.factor).min(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_is_monotonic_and_stays_below_ceiling() {
        let smoother = ProgressSmoother::new(&ProgressConfig::default());
        let mut value = 0.0;
        for _ in 0..500 {
            let next = smoother.next(value);
            assert!(next >= value);
            assert!(next <= 0.95);
            value = next;
        }
        assert!(value > 0.9);
    }

    #[test]
    fn value_above_ceiling_is_left_alone() {
        let smoother = ProgressSmoother::new(&ProgressConfig::default());
        assert_eq!(smoother.next(1.0), 1.0);
    }

    #[test]
    fn outcomes_are_three_way() {
        assert_eq!(BatchOutcome::from_counts(3, 0), BatchOutcome::AllSucceeded);
        assert_eq!(BatchOutcome::from_counts(0, 2), BatchOutcome::AllFailed);
        assert_eq!(
            BatchOutcome::from_counts(3, 2),
            BatchOutcome::PartiallySucceeded {
                completed: 3,
                failed: 2
            }
        );
        assert_eq!(BatchOutcome::from_counts(0, 0), BatchOutcome::AllSucceeded);
    }
}
