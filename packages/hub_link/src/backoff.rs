//! Retry timing for reconnect attempts.
//!
//! A [`BackoffSchedule`] maps a consecutive-failure count to a wait. Past the
//! end of the schedule the last entry repeats, which gives the steady-state
//! retry interval. A [`RetryPolicy`] adds an optional attempt cap on top.

use std::time::Duration;

/// Default schedule: immediate, 2s, 10s, then every 30s.
pub const DEFAULT_DELAYS_MS: [u64; 4] = [0, 2_000, 10_000, 30_000];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("backoff schedule must contain at least one delay")]
    Empty,

    #[error("backoff schedule must be non-decreasing: entry {index} ({delay_ms}ms) is below its predecessor")]
    Decreasing { index: usize, delay_ms: u64 },
}

/// Ordered, non-decreasing wait durations indexed by attempt number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(delays: Vec<Duration>) -> Result<Self, BackoffError> {
        if delays.is_empty() {
            return Err(BackoffError::Empty);
        }
        for (index, pair) in delays.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return Err(BackoffError::Decreasing {
                    index: index + 1,
                    delay_ms: pair[1].as_millis() as u64,
                });
            }
        }
        Ok(Self { delays })
    }

    pub fn from_millis(delays_ms: &[u64]) -> Result<Self, BackoffError> {
        Self::new(delays_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// Wait before retry number `attempt` (0-based). Clamps at the last entry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn steady_state(&self) -> Duration {
        self.delays[self.delays.len() - 1]
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            delays: DEFAULT_DELAYS_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

/// Backoff schedule plus an optional cap on consecutive attempts.
///
/// `max_attempts: None` retries forever at the steady-state interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub schedule: BackoffSchedule,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(schedule: BackoffSchedule, max_attempts: Option<u32>) -> Self {
        Self {
            schedule,
            max_attempts,
        }
    }

    /// Wait before retry `attempt`, or `None` once the policy is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt >= max => None,
            _ => Some(self.schedule.delay_for(attempt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_curve() {
        let s = BackoffSchedule::default();
        assert_eq!(s.delay_for(0), Duration::ZERO);
        assert_eq!(s.delay_for(1), Duration::from_secs(2));
        assert_eq!(s.delay_for(2), Duration::from_secs(10));
        assert_eq!(s.delay_for(3), Duration::from_secs(30));
    }

    #[test]
    fn fifth_failure_clamps_to_steady_state() {
        let s = BackoffSchedule::from_millis(&[0, 2000, 10000, 30000]).unwrap();
        // fifth consecutive failure is attempt index 4
        assert_eq!(s.delay_for(4), Duration::from_millis(30000));
        assert_eq!(s.delay_for(u32::MAX), s.steady_state());
    }

    #[test]
    fn rejects_empty_and_decreasing() {
        assert_eq!(BackoffSchedule::new(vec![]), Err(BackoffError::Empty));
        assert_eq!(
            BackoffSchedule::from_millis(&[0, 5000, 1000]),
            Err(BackoffError::Decreasing {
                index: 2,
                delay_ms: 1000
            })
        );
    }

    #[test]
    fn flat_schedule_is_valid() {
        let s = BackoffSchedule::from_millis(&[500, 500, 500]).unwrap();
        assert_eq!(s.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn unbounded_policy_never_exhausts() {
        let p = RetryPolicy::default();
        assert_eq!(p.next_delay(1_000_000), Some(Duration::from_secs(30)));
    }

    #[test]
    fn bounded_policy_exhausts() {
        let p = RetryPolicy::new(BackoffSchedule::default(), Some(2));
        assert_eq!(p.next_delay(0), Some(Duration::ZERO));
        assert_eq!(p.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(p.next_delay(2), None);
    }
}
