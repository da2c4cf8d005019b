//! Retry scheduling with exponential backoff
//!
//! The delay before the next attempt grows as
//! `base_delay * multiplier ^ attempt_count`, optionally capped by a ceiling.
//! `attempt_count` is the number of attempts already made for a platform, so
//! with `max_attempts = 3` a platform is tried at most three times.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use crate::config::RetryConfig;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry no earlier than this instant
    At(DateTime<Utc>),
    /// The retry budget is spent; the failure is permanent for this item
    Exhausted,
}

impl RetryDecision {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            RetryDecision::At(at) => Some(*at),
            RetryDecision::Exhausted => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 3,
            max_delay: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_secs),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            max_delay: config.max_delay_secs.map(Duration::from_secs),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given number of attempts already made
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(ceiling) => delay.min(ceiling),
            None => delay,
        }
    }

    /// Compute when a platform that has failed `attempt_count` times may be retried
    pub fn next_retry_at(&self, attempt_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::Exhausted;
        }

        let delay = TimeDelta::from_std(self.backoff_delay(attempt_count)).unwrap_or(TimeDelta::MAX);
        let at = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::At(at)
    }
}

/// Free-function form of [`RetryPolicy::next_retry_at`] without a ceiling
pub fn next_retry_at(
    now: DateTime<Utc>,
    attempt_count: u32,
    base_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
) -> RetryDecision {
    RetryPolicy {
        base_delay,
        multiplier,
        max_attempts,
        max_delay: None,
    }
    .next_retry_at(attempt_count, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(decision: RetryDecision) -> DateTime<Utc> {
        decision.at().expect("expected a retry time")
    }

    #[test]
    fn test_backoff_grows_until_exhausted() {
        let now = Utc::now();
        let base = Duration::from_secs(60);

        let first = at(next_retry_at(now, 0, base, 2.0, 3));
        let second = at(next_retry_at(now, 1, base, 2.0, 3));
        let third = at(next_retry_at(now, 2, base, 2.0, 3));

        assert!(first < second);
        assert!(second < third);
        assert_eq!(next_retry_at(now, 3, base, 2.0, 3), RetryDecision::Exhausted);
        assert_eq!(next_retry_at(now, 7, base, 2.0, 3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_backoff_delay_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(120));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(240));
    }

    #[test]
    fn test_next_retry_is_offset_from_now() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_retry_at(1, now),
            RetryDecision::At(now + TimeDelta::seconds(120))
        );
    }

    #[test]
    fn test_ceiling_caps_delay() {
        let policy = RetryPolicy {
            max_delay: Some(Duration::from_secs(90)),
            max_attempts: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(90));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(90));
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            ..RetryPolicy::default()
        };
        let now = Utc::now();
        let decision = policy.next_retry_at(5000, now);
        assert!(at(decision) > now);
    }

    #[test]
    fn test_zero_attempt_budget_is_exhausted_immediately() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_retry_at(0, Utc::now()), RetryDecision::Exhausted);
    }

    #[test]
    fn test_flat_multiplier_keeps_constant_delay() {
        let policy = RetryPolicy {
            multiplier: 1.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(0), policy.backoff_delay(2));
    }
}
