//! Backoff computation and retry gating.
//!
//! Retries are durable: a failed attempt writes `run_after = now + delay`
//! on the node row and the dispatch pass picks it up later. This module
//! only computes the delays; it holds no timers and no state.

use chrono::{DateTime, Duration, Utc};
use taskforge_types::error::EngineError;
use taskforge_types::workflow::RetryPolicy;

/// Stateless backoff calculator.
pub struct Backoff;

impl Backoff {
    /// Delay before retry attempt `attempt` (1-based: the delay after the
    /// first failure is attempt 1).
    ///
    /// - Fixed: always `delay_ms`.
    /// - Exponential: `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    pub fn delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
        match policy {
            RetryPolicy::Fixed { delay_ms } => *delay_ms,
            RetryPolicy::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => {
                // Clamp the exponent so the shift cannot overflow.
                let exp = attempt.saturating_sub(1).min(31);
                let delay = base_delay_ms.saturating_mul(1u64 << exp);
                match max_delay_ms {
                    Some(max) => delay.min(*max),
                    None => delay,
                }
            }
        }
    }

    /// Whether another attempt is allowed.
    ///
    /// `retry_count` is the number of retries already consumed; the error
    /// must be retryable and budget must remain.
    pub fn should_retry(max_retries: u32, retry_count: u32, error: &EngineError) -> bool {
        error.is_retryable() && retry_count < max_retries
    }

    /// The absolute time the next attempt becomes eligible.
    pub fn next_run_after(policy: &RetryPolicy, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = Self::delay_ms(policy, attempt);
        now + Duration::milliseconds(delay.min(i64::MAX as u64) as i64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------
    // delay_ms
    // -------------------------------------------------------------------

    #[test]
    fn test_fixed_delay_constant() {
        let policy = RetryPolicy::Fixed { delay_ms: 750 };
        for attempt in 1..=5 {
            assert_eq!(Backoff::delay_ms(&policy, attempt), 750);
        }
    }

    #[test]
    fn test_exponential_delay_doubles_until_cap() {
        let policy = RetryPolicy::Exponential {
            base_delay_ms: 1000,
            max_delay_ms: Some(8000),
        };
        assert_eq!(Backoff::delay_ms(&policy, 1), 1000);
        assert_eq!(Backoff::delay_ms(&policy, 2), 2000);
        assert_eq!(Backoff::delay_ms(&policy, 3), 4000);
        assert_eq!(Backoff::delay_ms(&policy, 4), 8000);
        assert_eq!(Backoff::delay_ms(&policy, 5), 8000);
    }

    #[test]
    fn test_exponential_uncapped() {
        let policy = RetryPolicy::Exponential {
            base_delay_ms: 100,
            max_delay_ms: None,
        };
        assert_eq!(Backoff::delay_ms(&policy, 6), 3200);
    }

    #[test]
    fn test_exponential_no_overflow_on_large_attempt() {
        let policy = RetryPolicy::Exponential {
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: None,
        };
        // Saturates instead of panicking.
        assert_eq!(Backoff::delay_ms(&policy, 64), u64::MAX);
    }

    // -------------------------------------------------------------------
    // should_retry
    // -------------------------------------------------------------------

    fn retryable_error() -> EngineError {
        EngineError::Execution {
            message: "upstream 503".to_string(),
            retryable: true,
        }
    }

    #[test]
    fn test_should_retry_within_budget() {
        assert!(Backoff::should_retry(3, 0, &retryable_error()));
        assert!(Backoff::should_retry(3, 2, &retryable_error()));
    }

    #[test]
    fn test_should_not_retry_when_budget_exhausted() {
        assert!(!Backoff::should_retry(3, 3, &retryable_error()));
        assert!(!Backoff::should_retry(0, 0, &retryable_error()));
    }

    #[test]
    fn test_should_not_retry_non_retryable_error() {
        let err = EngineError::Execution {
            message: "bad input".to_string(),
            retryable: false,
        };
        assert!(!Backoff::should_retry(3, 0, &err));
        assert!(!Backoff::should_retry(
            3,
            0,
            &EngineError::Validation("x".to_string())
        ));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = EngineError::Timeout {
            scope: "node fetch".to_string(),
            elapsed_secs: 30,
        };
        assert!(Backoff::should_retry(1, 0, &err));
    }

    // -------------------------------------------------------------------
    // next_run_after
    // -------------------------------------------------------------------

    #[test]
    fn test_next_run_after_offsets_from_now() {
        let now = Utc::now();
        let policy = RetryPolicy::Fixed { delay_ms: 1500 };
        let at = Backoff::next_run_after(&policy, 1, now);
        assert_eq!(at - now, Duration::milliseconds(1500));
    }
}
