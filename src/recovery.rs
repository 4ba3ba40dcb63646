//! Retry policies and backoff strategies
//!
//! Part uploads, initiation, list-parts and completion all retry transient
//! transport failures. The delay between attempts comes from a
//! [`BackoffStrategy`], a plain function of the attempt number; the attempt
//! budget comes from a [`RetryPolicy`], which is a value type so two policies
//! compare equal exactly when their parameters do.
//!
//! # Examples
//!
//! ```
//! use orbit_multipart::recovery::{Backoff, BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 5,
//!     backoff: Backoff::Exponential { initial_ms: 100, max_ms: 1_000 },
//! };
//! assert_eq!(policy.backoff.next_delay(1), Duration::from_millis(100));
//! assert_eq!(policy.backoff.next_delay(3), Duration::from_millis(400));
//! assert_eq!(policy.backoff.next_delay(10), Duration::from_millis(1_000));
//! ```

use crate::error::TransportError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Delay to wait before the next attempt
///
/// `attempt` is the number of the attempt that just failed, starting at 1.
pub trait BackoffStrategy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn next_delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Built-in backoff strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },

    /// Linear increase in delay
    Linear { initial_ms: u64, max_ms: u64 },

    /// Exponential increase in delay (2^n)
    Exponential { initial_ms: u64, max_ms: u64 },

    /// Exponential with up to `jitter_percent` extra random delay
    ExponentialWithJitter {
        initial_ms: u64,
        max_ms: u64,
        jitter_percent: u8,
    },
}

impl Backoff {
    /// Retry without waiting
    pub fn immediate() -> Self {
        Backoff::Fixed { delay_ms: 0 }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::ExponentialWithJitter {
            initial_ms: 200,
            max_ms: 20_000,
            jitter_percent: 30,
        }
    }
}

impl BackoffStrategy for Backoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Linear { initial_ms, max_ms } => {
                Duration::from_millis(initial_ms.saturating_mul(attempt as u64).min(max_ms))
            }
            Backoff::Exponential { initial_ms, max_ms } => {
                Duration::from_millis(exponential_ms(initial_ms, attempt).min(max_ms))
            }
            Backoff::ExponentialWithJitter {
                initial_ms,
                max_ms,
                jitter_percent,
            } => {
                let capped = exponential_ms(initial_ms, attempt).min(max_ms);
                let jitter = if jitter_percent == 0 || capped == 0 {
                    0
                } else {
                    let span = capped.saturating_mul(jitter_percent as u64) / 100;
                    rand::rng().random_range(0..=span)
                };
                Duration::from_millis(capped.saturating_add(jitter))
            }
        }
    }
}

fn exponential_ms(initial_ms: u64, attempt: u32) -> u64 {
    let shift = (attempt - 1).min(32);
    initial_ms.saturating_mul(1u64 << shift)
}

/// Attempt budget plus backoff parameters for one kind of remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay between attempts
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Policy for network-flaky scenarios
    pub fn network() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::ExponentialWithJitter {
                initial_ms: 100,
                max_ms: 30_000,
                jitter_percent: 50,
            },
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::immediate(),
        }
    }
}

/// A retried call that ran out of attempts or hit a fatal error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    /// Attempts made before giving up
    pub attempts: u32,

    /// Error from the last attempt
    pub error: TransportError,
}

/// Execute a transport call, retrying transient failures
///
/// Fatal errors are returned after the attempt that produced them.
pub async fn with_retry<F, Fut, T>(
    max_attempts: u32,
    backoff: &dyn BackoffStrategy,
    operation: &str,
    mut call: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match call().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        error,
                    });
                }

                let delay = backoff.next_delay(attempt);
                tracing::warn!(operation, attempt, ?delay, %error, "retrying transient failure");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_calculation() {
        let backoff = Backoff::Exponential {
            initial_ms: 100,
            max_ms: 10_000,
        };

        assert_eq!(backoff.next_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        let backoff = Backoff::Exponential {
            initial_ms: 1_000,
            max_ms: 5_000,
        };
        assert_eq!(backoff.next_delay(10), Duration::from_millis(5_000));
        assert_eq!(backoff.next_delay(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = Backoff::Linear {
            initial_ms: 100,
            max_ms: 60_000,
        };
        assert_eq!(backoff.next_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::ExponentialWithJitter {
            initial_ms: 100,
            max_ms: 1_000,
            jitter_percent: 50,
        };
        for _ in 0..50 {
            let delay = backoff.next_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_closure_strategy() {
        let strategy = |attempt: u32| Duration::from_millis(attempt as u64 * 7);
        assert_eq!(strategy.next_delay(3), Duration::from_millis(21));
    }

    #[test]
    fn test_policy_value_equality() {
        let a = RetryPolicy::new(3, Backoff::Fixed { delay_ms: 10 });
        let b = RetryPolicy::new(3, Backoff::Fixed { delay_ms: 10 });
        let c = RetryPolicy::new(4, Backoff::Fixed { delay_ms: 10 });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_with_success() {
        let attempts = AtomicU32::new(0);

        let result = with_retry(3, &Backoff::immediate(), "test", || {
            let current = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if current < 3 {
                    Err(TransportError::transient("blip"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_fails_immediately() {
        let attempts = AtomicU32::new(0);

        let result = with_retry(5, &Backoff::immediate(), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransportError::fatal("InvalidRequest", "bad")) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(!err.error.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let attempts = AtomicU32::new(0);

        let result = with_retry(3, &Backoff::immediate(), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransportError::transient("down")) }
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_toml_roundtrip() {
        let policy = RetryPolicy::network();
        let text = toml::to_string(&policy).expect("serialize policy");
        assert!(text.contains("exponential_with_jitter"));
        let back: RetryPolicy = toml::from_str(&text).expect("parse policy");
        assert_eq!(back, policy);
    }
}
