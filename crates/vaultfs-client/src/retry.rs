//! Retry policy for transfer jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed-interval retry with an optional attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay between attempts in milliseconds (default 5000).
    pub interval_ms: u64,
    /// Total attempts allowed; `None` retries forever (default).
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Unbounded retries every `interval`.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            max_attempts: None,
        }
    }

    /// Unbounded retries without delay.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Caps the number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay between attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unbounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval(), Duration::from_secs(5));
        assert!(policy.allows_retry(1_000_000));
    }

    #[test]
    fn test_bounded() {
        let policy = RetryPolicy::immediate().with_max_attempts(3);
        assert_eq!(policy.interval(), Duration::ZERO);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_deserialize_partial() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 4}"#).unwrap();
        assert_eq!(policy.interval_ms, 5000);
        assert_eq!(policy.max_attempts, Some(4));
    }
}
