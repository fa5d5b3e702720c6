//! Retry policy and throttling classification

use async_trait::async_trait;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::RemoteError;

/// Signature the record store uses when provisioned throughput is exhausted
const CAPACITY_SIGNATURE: &str = "Throughput exceeds the current capacity";

/// Error type emitted by the storage backend when it throttles
const BACKEND_EXCEPTION: &str = "DynamoDbException";

/// Classify an error as remote throttling
///
/// Throttling is transient and worth retrying; anything else (authorization,
/// malformed queries) is not.
pub fn is_throttling_error(error: &RemoteError) -> bool {
    let in_message = |m: &Option<String>| {
        m.as_deref()
            .map(|m| m.contains(CAPACITY_SIGNATURE))
            .unwrap_or(false)
    };

    if in_message(&error.message) {
        return true;
    }

    if error.errors.iter().any(|e| {
        in_message(&e.message)
            || e.error_type
                .as_deref()
                .map(|t| t.contains(BACKEND_EXCEPTION))
                .unwrap_or(false)
    }) {
        return true;
    }

    serde_json::to_string(error)
        .map(|s| s.to_ascii_lowercase().contains("throttling"))
        .unwrap_or(false)
}

/// Retry policy with exponential backoff
///
/// Controls how throttled fetches are retried.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    /// Default: 3
    pub max_retries: u32,

    /// Initial delay between retries
    /// Default: 1 second
    pub initial_delay: Duration,

    /// Maximum delay between retries
    /// Default: 30 seconds
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    /// Default: 2.0
    pub multiplier: f64,

    /// Add random jitter to delays
    /// Default: false
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Calculate delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            delay_ms * (1.0 + jitter)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if we should retry after the given attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Asynchronous sleep, injectable so tests can skip real delays
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspend for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorDetail;

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));

        // Should cap at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_jitter_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_capacity_message_is_throttling() {
        let err = RemoteError::message(
            "Throughput exceeds the current capacity of your table or index.",
        );
        assert!(is_throttling_error(&err));
    }

    #[test]
    fn test_backend_exception_type_is_throttling() {
        let err = RemoteError::typed("DynamoDB:DynamoDbException", "request failed");
        assert!(is_throttling_error(&err));
    }

    #[test]
    fn test_throttling_anywhere_case_insensitive() {
        let err = RemoteError {
            message: None,
            errors: vec![RemoteErrorDetail {
                error_type: Some("ThrottlingException".to_string()),
                message: None,
            }],
        };
        assert!(is_throttling_error(&err));
        assert!(is_throttling_error(&RemoteError::message("Rate exceeded: THROTTLING")));
    }

    #[test]
    fn test_authorization_error_is_not_throttling() {
        let err = RemoteError::typed("Unauthorized", "Not Authorized to access listItems");
        assert!(!is_throttling_error(&err));
        assert!(!is_throttling_error(&RemoteError::default()));
    }
}
