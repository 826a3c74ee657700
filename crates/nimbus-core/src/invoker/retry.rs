//! Retry policy for throttled invocations

use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::ExecutionConfig;

/// How throttled invocations are retried
///
/// Each retry sleeps for a duration picked uniformly at random from a
/// discrete set of candidates, which spreads retries of concurrent calls
/// without a growing backoff.
///
/// # Example
///
/// ```
/// use nimbus_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_secs(1), 3)
///     .with_sleeps(vec![Duration::from_secs(1), Duration::from_secs(5)]);
///
/// assert!(policy.has_attempts_remaining(2));
/// assert!(!policy.has_attempts_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Whether throttled invocations are retried at all
    pub enabled: bool,

    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Candidate sleeps between attempts
    #[serde(with = "duration_millis_vec")]
    pub sleeps: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::new(crate::config::BackendKind::Localhost))
    }
}

impl RetryPolicy {
    /// Build the policy from the execution group
    ///
    /// `retries` is the attempt budget including the first attempt.
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            enabled: config.invocation_retry,
            max_attempts: config.retries,
            sleeps: config
                .retry_sleeps
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            sleeps: Vec::new(),
        }
    }

    /// Create a policy with a single fixed sleep
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts,
            sleeps: vec![interval],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the candidate sleeps
    pub fn with_sleeps(mut self, sleeps: Vec<Duration>) -> Self {
        self.sleeps = sleeps;
        self
    }

    /// Attempts a call gets in total; never less than one
    pub fn effective_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.effective_attempts()
    }

    /// Pick the sleep before the next attempt
    pub fn next_sleep(&self) -> Duration {
        self.sleeps
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Serde support for a list of durations as milliseconds
mod duration_millis_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        durations
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, RETRIES_DEFAULT};

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::from_config(&ExecutionConfig::new(BackendKind::Localhost));
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, RETRIES_DEFAULT);
        assert_eq!(policy.sleeps.len(), 5);
        assert_eq!(policy.sleeps[0], Duration::from_secs(1));
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.effective_attempts(), 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_disabled_policy_makes_one_attempt() {
        let mut config = ExecutionConfig::new(BackendKind::Localhost);
        config.invocation_retry = false;
        config.retries = 10;

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.effective_attempts(), 1);
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1), 0);
        assert_eq!(policy.effective_attempts(), 1);
    }

    #[test]
    fn test_next_sleep_is_a_candidate() {
        let candidates = vec![Duration::from_secs(1), Duration::from_secs(5)];
        let policy = RetryPolicy::fixed(Duration::ZERO, 3).with_sleeps(candidates.clone());

        for _ in 0..50 {
            assert!(candidates.contains(&policy.next_sleep()));
        }
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1500), 3);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["sleeps"], serde_json::json!([1500]));

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);
    }
}
