//! # Retry
//!
//! Budget and backoff for resubmitting failed filter/map tasks and checkpoint
//! sends.
use std::time::Duration;

use crate::subscriber::Attempt;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<Duration>,
    /// Retries allowed per record, not counting the first attempt.
    pub max_retry_times: u32,
    /// Retries stop once this much time has passed since the first attempt.
    pub max_retry_window: Duration,
}

/// Why a record stopped being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    GiveUp,
    Exhausted,
    RetryDisabled,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::GiveUp => "give_up",
            AbandonReason::Exhausted => "exhausted",
            AbandonReason::RetryDisabled => "retry_disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resubmit after waiting `backoff`, carrying the bumped attempt.
    Retry { attempt: Attempt, backoff: Duration },
    Abandon(AbandonReason),
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Backoff before the given retry attempt (1-based).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let candidate = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate, self.maximum_interval) {
            (Some(interval), Some(max_interval)) => std::cmp::min(interval, max_interval),
            (Some(interval), None) => interval,
            (None, Some(max_interval)) => max_interval,
            (None, None) => Duration::MAX,
        }
    }

    pub fn within_budget(&self, attempt: &Attempt) -> bool {
        attempt.retry_times < self.max_retry_times
            && attempt.retry_begin.elapsed() < self.max_retry_window
    }

    /// Give-up short-circuits the budget; otherwise retry while the tier
    /// allows it and both the count and the window have room.
    pub fn decide(&self, attempt: Attempt, give_up: bool, retry_enabled: bool) -> RetryDecision {
        if give_up {
            return RetryDecision::Abandon(AbandonReason::GiveUp);
        }
        if !retry_enabled {
            return RetryDecision::Abandon(AbandonReason::RetryDisabled);
        }
        if !self.within_budget(&attempt) {
            return RetryDecision::Abandon(AbandonReason::Exhausted);
        }

        let next = attempt.next();
        RetryDecision::Retry {
            attempt: next,
            backoff: self.retry_interval(next.retry_times),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Option<Duration>,
    pub max_retry_times: u32,
    pub max_retry_window: Duration,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: None,
            max_retry_times: 3,
            max_retry_window: Duration::from_secs(60),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_retry_times(mut self, times: u32) -> RetryPolicyBuilder {
        self.max_retry_times = times;
        self
    }

    pub fn max_retry_window(mut self, window: Duration) -> RetryPolicyBuilder {
        self.max_retry_window = window;
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_retry_times: self.max_retry_times,
            max_retry_window: self.max_retry_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, Duration::from_secs(2))
            .maximum_interval(Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(200), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_until_count_exhausted() {
        let policy = RetryPolicy::build(2, Duration::from_millis(10))
            .max_retry_times(2)
            .provide();

        let mut attempt = Attempt::first();
        let mut backoffs = vec![];
        loop {
            match policy.decide(attempt, false, true) {
                RetryDecision::Retry { attempt: next, backoff } => {
                    backoffs.push(backoff);
                    attempt = next;
                }
                RetryDecision::Abandon(reason) => {
                    assert_eq!(reason, AbandonReason::Exhausted);
                    break;
                }
            }
        }

        assert_eq!(attempt.retry_times, 2);
        assert_eq!(
            backoffs,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[test]
    fn test_window_exhaustion() {
        let policy = RetryPolicy::build(1, Duration::from_millis(1))
            .max_retry_times(100)
            .max_retry_window(Duration::from_secs(5))
            .provide();
        let stale = Attempt {
            retry_begin: Instant::now() - Duration::from_secs(6),
            retry_times: 0,
        };

        assert_eq!(
            policy.decide(stale, false, true),
            RetryDecision::Abandon(AbandonReason::Exhausted)
        );
    }

    #[test]
    fn test_give_up_bypasses_budget() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(Attempt::first(), true, true),
            RetryDecision::Abandon(AbandonReason::GiveUp)
        );
        assert_eq!(
            policy.decide(Attempt::first(), false, false),
            RetryDecision::Abandon(AbandonReason::RetryDisabled)
        );
    }
}
