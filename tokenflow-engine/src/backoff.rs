//! Retry backoff for failed jobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Computes how long a failed job waits before it becomes due again.
pub trait BackoffPolicy: Send + Sync {
    /// `attempt` is the number of failures so far, starting at 1.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Configurable backoff curves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryBackoff {
    /// Same delay after every failure.
    Fixed { delay_ms: u64 },
    /// `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Fixed { delay_ms: 5_000 }
    }
}

impl BackoffPolicy for RetryBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryBackoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RetryBackoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let ms = initial_ms as f64 * multiplier.max(1.0).powi(exponent);
                Duration::from_millis(ms.min(max_ms as f64) as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed() {
        let policy = RetryBackoff::Fixed { delay_ms: 250 };
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_caps() {
        let policy = RetryBackoff::Exponential {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 1_000,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_yaml_shape() {
        let policy: RetryBackoff =
            serde_yaml::from_str("type: exponential\ninitial_ms: 10\nmultiplier: 3.0\nmax_ms: 90\n")
                .unwrap();
        assert_eq!(policy.delay(3), Duration::from_millis(90));
    }
}
