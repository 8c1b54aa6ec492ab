//! Bounded retry with exponential backoff, jitter and per-attempt timeouts
//!
//! # Overview
//!
//! [`RetryHandler`] runs a zero-argument async operation up to
//! `max_attempts` times. After each failure the error is classified against
//! the policy's `retryable_errors` list (matched against the error's name,
//! code, status code and message; numeric entries match the status code
//! only) and a set of generic network/timeout keywords. Retryable failures sleep for
//! `min(max_delay, base_delay × multiplier^(attempt-1))`, plus up to 50%
//! uniform jitter when enabled.
//!
//! When attempts run out, or a failure is not retryable, the loop returns
//! [`RetryExhausted`] carrying the last error and the attempt trace.
//!
//! # Example
//!
//! ```no_run
//! use lifeline_core_resilience::{RetryHandler, RetryPolicy, TimeoutError};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let handler = RetryHandler::new(RetryPolicy {
//!     max_attempts: 5,
//!     base_delay: Duration::from_millis(100),
//!     ..Default::default()
//! });
//!
//! let result = handler
//!     .execute_with_timeout(|| async { Ok::<_, TimeoutError>(42) }, Duration::from_secs(2))
//!     .await;
//! # }
//! ```

use super::error::{ErrorSignature, RetryContext, RetryExhausted, TimeoutError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Message fragments that mark an error as a transient network/timeout failure
const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "socket hang up",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
];

/// Codes retried when no explicit list is configured
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "EPIPE",
    "ENOTFOUND",
    "EAI_AGAIN",
    "408",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay (before jitter)
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Add up to +50% uniform jitter to each delay
    pub jitter: bool,
    /// Codes, status codes or message fragments that are worth retrying
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_errors: DEFAULT_RETRYABLE_ERRORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay for the given 1-based attempt number
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        // powi overflows to +inf for large exponents; min() still caps it
        Duration::from_millis(millis.min(cap).max(0.0) as u64)
    }

    /// Delay to sleep after the given 1-based attempt failed
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let jitter = rand::rng().random_range(0.0..=0.5);
        base + base.mul_f64(jitter)
    }

    /// Check whether an error is worth retrying
    pub fn is_retryable<E: ErrorSignature + ?Sized>(&self, error: &E) -> bool {
        let name = error.name();
        let code = error.code();
        let status = error.status_code().map(|s| s.to_string());
        let message = error.to_string();

        // Status codes only match exactly; "500" must not match "processed 500 records"
        let configured = self.retryable_errors.iter().any(|candidate| {
            candidate.as_str() == name
                || code.as_deref() == Some(candidate.as_str())
                || status.as_deref() == Some(candidate.as_str())
                || (!is_status_code(candidate) && message.contains(candidate.as_str()))
        });
        if configured {
            return true;
        }

        let lowered = message.to_lowercase();
        TRANSIENT_KEYWORDS.iter().any(|kw| lowered.contains(kw))
            || name.to_lowercase().contains("timeout")
    }
}

fn is_status_code(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit())
}

/// Executes operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// See [`RetryPolicy::calculate_delay`]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.policy.calculate_delay(attempt)
    }

    /// See [`RetryPolicy::is_retryable`]
    pub fn is_retryable<E: ErrorSignature + ?Sized>(&self, error: &E) -> bool {
        self.policy.is_retryable(error)
    }

    /// Run `op` until it succeeds, attempts run out, or it fails non-retryably
    pub async fn execute<F, Fut, T, E>(&self, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorSignature,
    {
        let started_at = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delays = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let retryable = self.policy.is_retryable(&error);
            if !retryable || attempt >= max_attempts {
                if retryable {
                    warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
                } else {
                    debug!(attempt, error = %error, "Error is not retryable");
                }
                return Err(RetryExhausted {
                    last_error: error,
                    context: RetryContext {
                        attempts: attempt,
                        delays,
                        started_at,
                        elapsed: started_at.elapsed(),
                    },
                });
            }

            let delay = self.policy.calculate_delay(attempt);
            debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );
            delays.push(delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Like [`execute`](Self::execute), but each attempt is bounded by `timeout`
    ///
    /// A timed-out attempt produces `E::from(TimeoutError)` and goes through
    /// the same classification and backoff as any other failure. There is no
    /// deadline across attempts.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        mut op: F,
        timeout: Duration,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorSignature + From<TimeoutError>,
    {
        self.execute(|| {
            let attempt = op();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(E::from(TimeoutError { timeout })),
                }
            }
        })
        .await
    }
}
