use std::time;

use rand::Rng;

use crate::error::ErrorKind;

/// The retry policy consulted by the enrichment processor and the sink
/// consumer to decide whether and when a failed operation runs again.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval before the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
    /// Total attempts allowed, the first one included.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            backoff_coefficient,
            initial_interval,
            ..Default::default()
        }
    }

    /// Whether a failure of `kind` should be attempted again, given that
    /// `attempt` attempts have already been made.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before the retry following `attempt` completed attempts:
    /// exponential, capped at the maximum interval, with multiplicative
    /// jitter so retries across workers do not synchronize.
    pub fn backoff_duration(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));
        let capped = std::cmp::min(candidate, self.maximum_interval);

        capped.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern to provide a `RetryPolicy`.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: time::Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(100),
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn maximum_interval(mut self, interval: time::Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially_within_jitter() {
        let policy = RetryPolicy::build(2, time::Duration::from_millis(100))
            .maximum_interval(time::Duration::from_secs(60))
            .provide();

        for (attempt, expected_ms) in [(1u32, 100u64), (2, 200), (3, 400), (4, 800)] {
            let backoff = policy.backoff_duration(attempt);
            let expected = time::Duration::from_millis(expected_ms);
            assert!(backoff <= expected, "attempt {attempt}: {backoff:?}");
            assert!(backoff >= expected.mul_f64(0.5), "attempt {attempt}: {backoff:?}");
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::build(2, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(2))
            .provide();

        assert!(policy.backoff_duration(10) <= time::Duration::from_secs(2));
    }

    #[test]
    fn test_should_retry_respects_kind_and_bound() {
        let policy = RetryPolicy::build(2, time::Duration::from_millis(10))
            .max_attempts(3)
            .provide();

        assert!(policy.should_retry(1, ErrorKind::TransientStore));
        assert!(policy.should_retry(2, ErrorKind::LookupMiss));
        assert!(!policy.should_retry(3, ErrorKind::TransientStore));
        assert!(!policy.should_retry(1, ErrorKind::Schema));
        assert!(!policy.should_retry(1, ErrorKind::PermanentStore));
    }

    #[test]
    fn test_large_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        let backoff = policy.backoff_duration(u32::MAX);
        assert!(backoff <= time::Duration::from_secs(100));
    }
}
