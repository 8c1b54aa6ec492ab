//! Lifeline Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks every Lifeline connector uses to
//! survive unreliable, rate-limited third-party services. It includes:
//!
//! - **Circuit Breaker**: Stops calling a failing dependency and probes for recovery
//! - **Retry Handler**: Bounded retries with exponential backoff, jitter and per-attempt timeouts
//! - **Rate Limiter**: Token bucket with concurrency cap and optional FIFO queueing
//! - **Response Cache**: LRU cache with TTL, tag/pattern invalidation and stale-while-revalidate
//! - **Registry**: Per-id shared instances so callers of one connector share state
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - HTTP, authentication or any transport
//! - Credential storage
//! - Application-specific concerns
//!
//! All time arithmetic uses `tokio::time::Instant`, so a paused Tokio clock
//! drives cooldowns, refills, TTLs and backoff sleeps in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Connector                       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Respect third-party quotas
//! │  (Token bucket, FIFO wait queue)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Response Cache                    │  ← Idempotent reads
//! │  (LRU, TTL, stale-while-revalidate)     │
//! └─────────────┬───────────────────────────┘
//!               │ miss
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Handler                     │  ← Transient failures
//! │  (Backoff + jitter, per-attempt timeout)│
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Service
//!   (hospital, border, morgue, transit)
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use lifeline_core_resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, RetryHandler, RetryPolicy, TimeoutError,
//! };
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("coroner-db", CircuitBreakerConfig::default());
//! let retry = RetryHandler::new(RetryPolicy::default());
//!
//! if let Some(permit) = breaker.admit().await {
//!     let outcome = retry
//!         .execute_with_timeout(|| async { Ok::<_, TimeoutError>("ok") }, Duration::from_secs(5))
//!         .await;
//!     match outcome {
//!         Ok(_) => permit.record_success().await,
//!         Err(_) => permit.record_failure().await,
//!     }
//! }
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod error;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

// Re-export main types for convenience
pub use cache::{CacheConfig, CacheEntry, CacheHit, CacheStats, ResponseCache, SetOptions};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    StateTransition,
};
pub use error::{ErrorSignature, ResilienceError, RetryContext, RetryExhausted, TimeoutError};
pub use rate_limiter::{
    AcquireResult, RateLimitConfig, RateLimiterMetrics, RatePermit, TokenBucketRateLimiter,
};
pub use registry::Registry;
pub use retry::{RetryHandler, RetryPolicy, DEFAULT_RETRYABLE_ERRORS};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use lifeline_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::cache::{CacheConfig, ResponseCache, SetOptions};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::{ErrorSignature, ResilienceError, RetryExhausted, TimeoutError};
    pub use super::rate_limiter::{RateLimitConfig, TokenBucketRateLimiter};
    pub use super::registry::Registry;
    pub use super::retry::{RetryHandler, RetryPolicy};
}
