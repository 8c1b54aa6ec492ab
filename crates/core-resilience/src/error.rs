//! Error types shared by the resilience primitives

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised by the resilience primitives themselves
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// The circuit breaker is rejecting traffic
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Breaker name (usually the connector id)
        name: String,
    },

    /// A single attempt exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Token bucket is empty or the concurrency cap is reached, and queueing is disabled
    #[error("rate limit exceeded for '{name}', retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Limiter name
        name: String,
        /// Estimated time until a token becomes available
        retry_after: Duration,
    },

    /// A queued acquirer waited longer than `queue_timeout`
    #[error("timed out after {waited:?} waiting in rate limit queue for '{name}'")]
    RateLimitTimeout {
        /// Limiter name
        name: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// The wait queue is at `max_queue_size`
    #[error("rate limit queue for '{name}' is full ({capacity} waiters)")]
    QueueFull {
        /// Limiter name
        name: String,
        /// Configured queue capacity
        capacity: usize,
    },

    /// Invalid primitive configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Check whether this error signals throttling rather than a dependency failure
    pub fn is_throttling(&self) -> bool {
        matches!(
            self,
            ResilienceError::RateLimitExceeded { .. }
                | ResilienceError::RateLimitTimeout { .. }
                | ResilienceError::QueueFull { .. }
        )
    }
}

/// Raised when a single attempt does not finish within its deadline
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("attempt timed out after {}ms", timeout.as_millis())]
pub struct TimeoutError {
    /// The deadline that elapsed
    pub timeout: Duration,
}

/// Trace of a retry loop, attached to [`RetryExhausted`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    /// Number of attempts actually made
    pub attempts: u32,
    /// Delays slept between attempts, in order
    pub delays: Vec<Duration>,
    /// When the first attempt started
    pub started_at: Instant,
    /// Total wall time spent in the retry loop
    pub elapsed: Duration,
}

/// All attempts failed, or the last failure was not retryable
#[derive(Error, Debug)]
#[error("retry exhausted after {} attempt(s): {last_error}", context.attempts)]
pub struct RetryExhausted<E> {
    /// The error returned by the final attempt
    pub last_error: E,
    /// Attempt trace
    pub context: RetryContext,
}

impl<E> RetryExhausted<E> {
    /// Consume and return the last underlying error
    pub fn into_last_error(self) -> E {
        self.last_error
    }
}

/// Fields the retry classifier inspects on an error
///
/// Classification is data-driven: a [`crate::RetryPolicy`] compares its
/// `retryable_errors` list against these fields and the display message.
pub trait ErrorSignature: fmt::Display {
    /// Short type-like name, e.g. `"TimeoutError"`
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("Error")
    }

    /// Machine-readable code, e.g. `"ECONNRESET"`
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    /// HTTP status code, when the failure came from a response
    fn status_code(&self) -> Option<u16> {
        None
    }
}

impl ErrorSignature for TimeoutError {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("TimeoutError")
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed("ETIMEDOUT"))
    }
}

impl ErrorSignature for ResilienceError {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(match self {
            ResilienceError::CircuitOpen { .. } => "CircuitBreakerOpenError",
            ResilienceError::Timeout(_) => "TimeoutError",
            ResilienceError::RateLimitExceeded { .. } => "RateLimitExceededError",
            ResilienceError::RateLimitTimeout { .. } | ResilienceError::QueueFull { .. } => {
                "RateLimitTimeoutError"
            }
            ResilienceError::InvalidConfig(_) => "ConfigError",
        })
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        let code = match self {
            ResilienceError::CircuitOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            ResilienceError::Timeout(_) => "ETIMEDOUT",
            ResilienceError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ResilienceError::RateLimitTimeout { .. } => "RATE_LIMIT_TIMEOUT",
            ResilienceError::QueueFull { .. } => "RATE_LIMIT_QUEUE_FULL",
            ResilienceError::InvalidConfig(_) => "INVALID_CONFIG",
        };
        Some(Cow::Borrowed(code))
    }
}

impl From<TimeoutError> for ResilienceError {
    fn from(err: TimeoutError) -> Self {
        ResilienceError::Timeout(err.timeout)
    }
}
