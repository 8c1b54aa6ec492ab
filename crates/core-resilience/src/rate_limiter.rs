//! Token bucket rate limiting with optional FIFO queueing
//!
//! Tokens refill continuously at `max_requests_per_second` up to the bucket
//! capacity (`bucket_size`, or twice the per-second rate when unset). Every
//! admitted request consumes one token and holds one concurrency slot until
//! [`TokenBucketRateLimiter::release`] is called, or until the [`RatePermit`]
//! returned by [`TokenBucketRateLimiter::acquire_permit`] is dropped.
//!
//! When queueing is enabled, callers of [`TokenBucketRateLimiter::acquire`]
//! that cannot be admitted immediately wait in a bounded FIFO queue. The
//! queue is drained on every `release()` and by a single scheduled wake-up
//! timed for the next token.
//!
//! # Example
//!
//! ```no_run
//! use lifeline_core_resilience::{RateLimitConfig, ResilienceError, TokenBucketRateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError> {
//!     let limiter = TokenBucketRateLimiter::new("border-agency", RateLimitConfig::per_second(10.0));
//!
//!     limiter.execute(|| async {
//!         Ok::<_, ResilienceError>(42)
//!     }).await?;
//!
//!     Ok(())
//! }
//! ```

use super::error::ResilienceError;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Configuration for a token bucket
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Steady-state refill rate
    pub max_requests_per_second: f64,
    /// Cap on requests admitted and not yet released (None = unlimited)
    pub max_concurrent_requests: Option<usize>,
    /// Bucket capacity (None = 2 × max_requests_per_second)
    pub bucket_size: Option<f64>,
    /// Queue callers instead of rejecting them
    pub enable_queueing: bool,
    /// Maximum number of queued callers
    pub max_queue_size: usize,
    /// Maximum time a queued caller waits
    pub queue_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 10.0,
            max_concurrent_requests: None,
            bucket_size: None,
            enable_queueing: true,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    /// Queueing limiter refilling at `rate` tokens per second
    pub fn per_second(rate: f64) -> Self {
        Self {
            max_requests_per_second: rate,
            ..Default::default()
        }
    }

    /// Effective bucket capacity
    pub fn capacity(&self) -> f64 {
        self.bucket_size
            .unwrap_or(self.max_requests_per_second * 2.0)
            .max(1.0)
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(self.max_requests_per_second > 0.0) || !self.max_requests_per_second.is_finite() {
            return Err(ResilienceError::InvalidConfig(
                "max_requests_per_second must be a positive number".to_string(),
            ));
        }
        if matches!(self.bucket_size, Some(size) if !(size >= 1.0)) {
            return Err(ResilienceError::InvalidConfig(
                "bucket_size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_requests == Some(0) {
            return Err(ResilienceError::InvalidConfig(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of an acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquireResult {
    /// Whether a token and concurrency slot were granted
    pub allowed: bool,
    /// Tokens left in the bucket after this attempt
    pub remaining_tokens: f64,
    /// Time spent waiting in the queue
    pub wait_time: Duration,
    /// When denied, the estimated time until a token is available
    pub retry_after: Option<Duration>,
}

/// An admitted request's concurrency slot
///
/// The slot goes back to the limiter when the permit is dropped, including
/// when the future holding it is cancelled or the operation panics.
#[must_use = "the concurrency slot is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct RatePermit {
    limiter: TokenBucketRateLimiter,
    result: AcquireResult,
}

impl RatePermit {
    /// The acquisition that granted this permit
    pub fn result(&self) -> &AcquireResult {
        &self.result
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Counters exposed by [`TokenBucketRateLimiter::metrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub queued_requests: u64,
    pub average_wait_time_ms: f64,
    pub current_concurrency: usize,
    pub queue_depth: usize,
    pub available_tokens: f64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<AcquireResult>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    concurrency: usize,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    drain_scheduled: bool,
    total_requests: u64,
    allowed_requests: u64,
    throttled_requests: u64,
    queued_requests: u64,
    total_wait: Duration,
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: RateLimitConfig,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // No code path panics while holding the lock; recover anyway
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tokens_per_ms(&self) -> f64 {
        self.config.max_requests_per_second / 1000.0
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(state.last_refill).as_secs_f64() * 1000.0;
        if elapsed_ms > 0.0 {
            state.tokens = (state.tokens + elapsed_ms * self.tokens_per_ms()).min(self.capacity);
            state.last_refill = now;
        }
    }

    fn concurrency_full(&self, state: &BucketState) -> bool {
        self.config
            .max_concurrent_requests
            .is_some_and(|max| state.concurrency >= max)
    }

    fn can_grant(&self, state: &BucketState) -> bool {
        !self.concurrency_full(state) && state.tokens >= 1.0
    }

    fn time_until_token(&self, state: &BucketState) -> Duration {
        let missing = (1.0 - state.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.tokens_per_ms() / 1000.0)
    }

    fn grant(&self, state: &mut BucketState, wait_time: Duration) -> AcquireResult {
        state.tokens -= 1.0;
        state.concurrency += 1;
        state.allowed_requests += 1;
        state.total_wait += wait_time;
        AcquireResult {
            allowed: true,
            remaining_tokens: state.tokens,
            wait_time,
            retry_after: None,
        }
    }

    /// Hand tokens to queued waiters in FIFO order
    fn process_queue(self: &Arc<Self>) {
        let mut state = self.lock();
        self.refill(&mut state);

        while !state.queue.is_empty() && self.can_grant(&state) {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            let wait_time = waiter.enqueued_at.elapsed();
            let result = self.grant(&mut state, wait_time);
            if waiter.tx.send(result).is_err() {
                // Receiver gave up between timeout and removal; undo the grant
                state.tokens += 1.0;
                state.concurrency -= 1;
                state.allowed_requests -= 1;
                state.total_wait -= wait_time;
            }
        }

        // Concurrency-bound waiters are woken by release(); only token
        // starvation needs a timer.
        if !state.queue.is_empty()
            && !self.concurrency_full(&state)
            && state.tokens < 1.0
            && !state.drain_scheduled
        {
            let delay = self.time_until_token(&state);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    state.drain_scheduled = true;
                    let shared = Arc::clone(self);
                    trace!(limiter = %self.name, delay_ms = delay.as_millis() as u64, "Scheduling queue drain");
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        shared.lock().drain_scheduled = false;
                        shared.process_queue();
                    });
                }
                Err(_) => {
                    debug!(limiter = %self.name, "No runtime available to schedule queue drain");
                }
            }
        }
    }
}

/// Token bucket rate limiter shared by every caller of one connector
///
/// Cloning is cheap and yields a handle onto the same bucket.
#[derive(Debug, Clone)]
pub struct TokenBucketRateLimiter {
    shared: Arc<Shared>,
}

impl TokenBucketRateLimiter {
    /// Create a full bucket
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let capacity = config.capacity();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                capacity,
                state: Mutex::new(BucketState {
                    tokens: capacity,
                    last_refill: Instant::now(),
                    concurrency: 0,
                    queue: VecDeque::new(),
                    next_waiter_id: 0,
                    drain_scheduled: false,
                    total_requests: 0,
                    allowed_requests: 0,
                    throttled_requests: 0,
                    queued_requests: 0,
                    total_wait: Duration::ZERO,
                }),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.shared.config
    }

    /// Bucket capacity in tokens
    pub fn capacity(&self) -> f64 {
        self.shared.capacity
    }

    /// Tokens currently available (after refill)
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.shared.lock();
        self.shared.refill(&mut state);
        state.tokens
    }

    /// Try to take a token without waiting
    pub fn try_acquire(&self) -> AcquireResult {
        let shared = &self.shared;
        let mut state = shared.lock();
        shared.refill(&mut state);
        state.total_requests += 1;

        // Queued callers keep their place in line
        if state.queue.is_empty() && shared.can_grant(&state) {
            return shared.grant(&mut state, Duration::ZERO);
        }

        state.throttled_requests += 1;
        debug!(
            limiter = %shared.name,
            tokens = state.tokens,
            concurrency = state.concurrency,
            "Request throttled"
        );
        AcquireResult {
            allowed: false,
            remaining_tokens: state.tokens,
            wait_time: Duration::ZERO,
            retry_after: Some(shared.time_until_token(&state)),
        }
    }

    /// Take a token, waiting in the queue when queueing is enabled
    pub async fn acquire(&self) -> Result<AcquireResult, ResilienceError> {
        let shared = &self.shared;
        let (id, mut rx) = {
            let mut state = shared.lock();
            shared.refill(&mut state);
            state.total_requests += 1;

            if state.queue.is_empty() && shared.can_grant(&state) {
                return Ok(shared.grant(&mut state, Duration::ZERO));
            }

            if !shared.config.enable_queueing {
                state.throttled_requests += 1;
                return Err(ResilienceError::RateLimitExceeded {
                    name: shared.name.clone(),
                    retry_after: shared.time_until_token(&state),
                });
            }

            if state.queue.len() >= shared.config.max_queue_size {
                state.throttled_requests += 1;
                return Err(ResilienceError::QueueFull {
                    name: shared.name.clone(),
                    capacity: shared.config.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.queued_requests += 1;
            state.queue.push_back(Waiter {
                id,
                enqueued_at: Instant::now(),
                tx,
            });
            debug!(limiter = %shared.name, queue_depth = state.queue.len(), "Request queued");
            (id, rx)
        };

        // The head may already be servable (e.g. only the concurrency cap was hit
        // and a token is free); this also arms the wake-up timer.
        shared.process_queue();

        let started = Instant::now();
        match tokio::time::timeout(shared.config.queue_timeout, &mut rx).await {
            Ok(Ok(result)) => Ok(result),
            // Sender dropped: the limiter was reset while we waited
            Ok(Err(_)) => Err(ResilienceError::RateLimitTimeout {
                name: shared.name.clone(),
                waited: started.elapsed(),
            }),
            Err(_) => {
                let mut state = shared.lock();
                if let Some(pos) = state.queue.iter().position(|w| w.id == id) {
                    state.queue.remove(pos);
                    state.throttled_requests += 1;
                    return Err(ResilienceError::RateLimitTimeout {
                        name: shared.name.clone(),
                        waited: started.elapsed(),
                    });
                }
                drop(state);
                // Granted concurrently with the timeout firing; the grant was
                // sent while the lock was held, so it is already in the channel.
                rx.try_recv()
                    .map_err(|_| ResilienceError::RateLimitTimeout {
                        name: shared.name.clone(),
                        waited: started.elapsed(),
                    })
            }
        }
    }

    /// [`acquire`](Self::acquire), with the slot tied to the returned permit
    pub async fn acquire_permit(&self) -> Result<RatePermit, ResilienceError> {
        let result = self.acquire().await?;
        Ok(RatePermit {
            limiter: self.clone(),
            result,
        })
    }

    /// Return a concurrency slot and serve queued callers
    pub fn release(&self) {
        {
            let mut state = self.shared.lock();
            state.concurrency = state.concurrency.saturating_sub(1);
        }
        self.shared.process_queue();
    }

    /// Acquire, run `op`, then release regardless of the outcome
    ///
    /// The slot is also released when the returned future is dropped
    /// before `op` completes.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let _permit = self.acquire_permit().await?;
        op().await
    }

    /// Snapshot of counters
    pub fn metrics(&self) -> RateLimiterMetrics {
        let mut state = self.shared.lock();
        self.shared.refill(&mut state);
        let average_wait_time_ms = if state.allowed_requests == 0 {
            0.0
        } else {
            state.total_wait.as_secs_f64() * 1000.0 / state.allowed_requests as f64
        };

        RateLimiterMetrics {
            total_requests: state.total_requests,
            allowed_requests: state.allowed_requests,
            throttled_requests: state.throttled_requests,
            queued_requests: state.queued_requests,
            average_wait_time_ms,
            current_concurrency: state.concurrency,
            queue_depth: state.queue.len(),
            available_tokens: state.tokens,
        }
    }

    /// Refill the bucket, zero the counters and fail all queued callers
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        state.tokens = self.shared.capacity;
        state.last_refill = Instant::now();
        state.concurrency = 0;
        // Dropping the senders wakes every waiter with an error
        state.queue.clear();
        state.total_requests = 0;
        state.allowed_requests = 0;
        state.throttled_requests = 0;
        state.queued_requests = 0;
        state.total_wait = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, bucket: f64, queueing: bool) -> TokenBucketRateLimiter {
        TokenBucketRateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_second: rate,
                bucket_size: Some(bucket),
                enable_queueing: queueing,
                max_queue_size: 2,
                queue_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_default_capacity_is_twice_rate() {
        let config = RateLimitConfig::per_second(10.0);
        assert_eq!(config.capacity(), 20.0);
        assert!(config.validate().is_ok());
        assert!(RateLimitConfig::per_second(0.0).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_bounded_by_bucket_then_refills() {
        let limiter = limiter(10.0, 20.0, false);

        for _ in 0..20 {
            assert!(limiter.try_acquire().allowed);
            limiter.release();
        }
        let denied = limiter.try_acquire();
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_capped_after_idle() {
        let limiter = limiter(10.0, 5.0, false);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.available_tokens(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_and_release_floor() {
        let limiter = TokenBucketRateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_second: 100.0,
                max_concurrent_requests: Some(2),
                enable_queueing: false,
                ..Default::default()
            },
        );

        assert!(limiter.try_acquire().allowed);
        assert!(limiter.try_acquire().allowed);
        assert!(!limiter.try_acquire().allowed);

        limiter.release();
        limiter.release();
        limiter.release();
        assert_eq!(limiter.metrics().current_concurrency, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_without_queueing_rejects() {
        let limiter = limiter(1.0, 1.0, false);
        limiter.acquire().await.unwrap();

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, ResilienceError::RateLimitExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_acquire_is_served_when_token_refills() {
        let limiter = limiter(10.0, 1.0, true);
        limiter.acquire().await.unwrap();

        let started = Instant::now();
        let result = limiter.acquire().await.unwrap();
        assert!(result.allowed);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(result.wait_time >= Duration::from_millis(100));

        let metrics = limiter.metrics();
        assert_eq!(metrics.queued_requests, 1);
        assert_eq!(metrics.allowed_requests, 2);
        assert!(metrics.average_wait_time_ms > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_wakes_concurrency_bound_waiter() {
        let limiter = TokenBucketRateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_second: 100.0,
                max_concurrent_requests: Some(1),
                ..Default::default()
            },
        );
        limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.metrics().queue_depth, 1);

        limiter.release();
        let result = waiter.await.unwrap().unwrap();
        assert!(result.allowed);
        assert_eq!(limiter.metrics().current_concurrency, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_and_timeout() {
        let limiter = TokenBucketRateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_second: 100.0,
                max_concurrent_requests: Some(1),
                max_queue_size: 1,
                queue_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        limiter.acquire().await.unwrap();

        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;

        let full = limiter.acquire().await.unwrap_err();
        assert!(matches!(full, ResilienceError::QueueFull { capacity: 1, .. }));

        let timed_out = queued.await.unwrap().unwrap_err();
        assert!(matches!(timed_out, ResilienceError::RateLimitTimeout { .. }));
        assert_eq!(limiter.metrics().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_holds_until_release() {
        let limiter = TokenBucketRateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_second: 1000.0,
                max_concurrent_requests: Some(20),
                enable_queueing: false,
                ..Default::default()
            },
        );

        for n in 0..20 {
            assert!(limiter.try_acquire().allowed, "slot {n} should be free");
        }
        assert!(!limiter.try_acquire().allowed);
        assert_eq!(limiter.metrics().current_concurrency, 20);

        limiter.release();
        assert!(limiter.try_acquire().allowed);
        assert!(!limiter.try_acquire().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_execute_returns_slot() {
        let limiter = TokenBucketRateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_second: 100.0,
                max_concurrent_requests: Some(1),
                enable_queueing: false,
                ..Default::default()
            },
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ResilienceError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(limiter.metrics().current_concurrency, 0);
        assert!(limiter.try_acquire().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_released_on_drop_wakes_waiter() {
        let limiter = TokenBucketRateLimiter::new(
            "test",
            RateLimitConfig {
                max_requests_per_second: 100.0,
                max_concurrent_requests: Some(1),
                ..Default::default()
            },
        );

        let permit = limiter.acquire_permit().await.unwrap();
        assert!(permit.result().allowed);
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .acquire_permit()
                    .await
                    .map(|permit| permit.result().wait_time)
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(limiter.metrics().queue_depth, 1);

        drop(permit);
        let waited = waiter.await.unwrap().unwrap();
        assert!(waited >= Duration::from_millis(30));
        assert_eq!(limiter.metrics().current_concurrency, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_releases_slot() {
        let limiter = limiter(10.0, 10.0, true);
        let value = limiter
            .execute(|| async { Ok::<_, ResilienceError>(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(limiter.metrics().current_concurrency, 0);
    }
}
