//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker stops calling a dependency after repeated failures and
//! periodically lets trial traffic through to detect recovery. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Dependency is unhealthy, requests are rejected without being attempted
//! - HalfOpen: A bounded number of trial requests probe for recovery
//!
//! The open → half-open transition is evaluated lazily whenever the state is
//! read, so no background timer is needed.

use super::error::ResilienceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the state-transition broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing dependency recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name (`closed`, `open`, `half-open`)
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures while closed before opening the circuit
    pub failure_threshold: u32,
    /// Number of successes in half-open needed to close the circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub cooldown: Duration,
    /// Span of the rolling outcome window used for the failure-rate metric
    pub monitoring_period: Duration,
    /// Maximum number of concurrent trial requests while half-open
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
            half_open_max_attempts: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Reject configurations that could never trip or never recover
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "success_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_attempts == 0 {
            return Err(ResilienceError::InvalidConfig(
                "half_open_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A state change published to [`CircuitBreaker::subscribe`] receivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// Name of the breaker that changed
    pub breaker: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Wall-clock time of the change
    pub at: DateTime<Utc>,
}

impl StateTransition {
    /// True when this transition opened the circuit
    pub fn is_trip(&self) -> bool {
        self.to == CircuitState::Open
    }
}

/// Point-in-time view of a breaker, for metrics and health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_trips: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
    /// Failures / outcomes inside the monitoring window (0.0 - 1.0)
    pub failure_rate: f64,
    /// Outcomes currently inside the monitoring window
    pub window_size: usize,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    /// Failures counted while closed (reset on any success)
    failure_count: u32,
    /// Successes counted while half-open
    success_count: u32,
    /// Trial requests admitted and not yet reported while half-open
    half_open_attempts: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_state_change_at: DateTime<Utc>,
    total_trips: u64,
    /// Rolling window of (timestamp, failed) outcomes
    window: VecDeque<(Instant, bool)>,
    /// Bumped on every transition; ties a trial slot to one half-open period
    generation: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_attempts: 0,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
            last_state_change_at: Utc::now(),
            total_trips: 0,
            window: VecDeque::new(),
            generation: 0,
        }
    }

    fn push_outcome(&mut self, failed: bool, period: Duration) {
        let now = Instant::now();
        self.window.push_back((now, failed));
        self.prune_window(now, period);
    }

    fn prune_window(&mut self, now: Instant, period: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > period {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Which half-open trial slot a reported outcome frees
#[derive(Debug, Clone, Copy)]
enum Slot {
    /// Outcome reported directly after `is_allowed`
    Any,
    /// Outcome reported through a [`CallPermit`] admitted in this generation
    Held(Option<u64>),
}

impl Slot {
    fn frees(self, state: &CircuitBreakerState) -> bool {
        match self {
            Slot::Any => true,
            Slot::Held(generation) => generation == Some(state.generation),
        }
    }
}

/// Admission to one protected call, returned by [`CircuitBreaker::admit`]
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). A permit dropped without an
/// outcome (cancelled future, timeout, panic) gives its half-open trial slot
/// back instead of holding it forever.
#[must_use = "dropping the permit abandons the call"]
#[derive(Debug)]
pub struct CallPermit {
    breaker: CircuitBreaker,
    /// Half-open generation whose trial slot this permit holds
    trial: Option<u64>,
    reported: bool,
}

impl CallPermit {
    /// True when the call was admitted as a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub async fn record_success(mut self) {
        self.breaker.on_success(Slot::Held(self.trial)).await;
        self.reported = true;
    }

    pub async fn record_failure(mut self) {
        self.breaker.record_failure().await;
        self.reported = true;
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let Some(generation) = self.trial.filter(|_| !self.reported) else {
            return;
        };
        match self.breaker.state.try_lock() {
            Ok(mut state) => self.breaker.free_slot(&mut state, generation),
            Err(_) => {
                let breaker = self.breaker.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let mut state = breaker.state.lock().await;
                            breaker.free_slot(&mut state, generation);
                        });
                    }
                    Err(_) => {
                        warn!(breaker = %breaker.name, "No runtime to free abandoned trial slot");
                    }
                }
            }
        }
    }
}

/// Circuit breaker protecting one external dependency
///
/// Cloning is cheap and yields a handle onto the same state.
///
/// # Example
/// ```no_run
/// use lifeline_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("hospital-registry", CircuitBreakerConfig::default());
///
///     let result = breaker.execute(|| async {
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
            events,
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to state transitions
    ///
    /// Receivers that fall behind by more than the channel capacity observe
    /// `RecvError::Lagged` and continue from the oldest retained event.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    /// Get the current state, applying a due open → half-open transition
    pub async fn state(&self) -> CircuitState {
        let mut state = self.state.lock().await;
        self.refresh(&mut state);
        state.state
    }

    /// Check whether a request may be attempted right now
    ///
    /// In half-open state each `true` result reserves one trial slot, which is
    /// freed again when the outcome is recorded.
    pub async fn is_allowed(&self) -> bool {
        let mut state = self.state.lock().await;
        self.try_admit(&mut state).is_some()
    }

    /// Like [`is_allowed`](Self::is_allowed), returning a permit that frees
    /// its trial slot if the call is abandoned
    pub async fn admit(&self) -> Option<CallPermit> {
        let mut state = self.state.lock().await;
        let trial = self.try_admit(&mut state)?;
        Some(CallPermit {
            breaker: self.clone(),
            trial,
            reported: false,
        })
    }

    /// `None` when rejected, `Some(Some(generation))` for a half-open trial
    fn try_admit(&self, state: &mut CircuitBreakerState) -> Option<Option<u64>> {
        self.refresh(state);

        match state.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if state.half_open_attempts < self.config.half_open_max_attempts {
                    state.half_open_attempts += 1;
                    Some(Some(state.generation))
                } else {
                    None
                }
            }
        }
    }

    /// Get current failure count
    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    /// Get current half-open success count
    pub async fn success_count(&self) -> u32 {
        self.state.lock().await.success_count
    }

    /// Failure rate over the monitoring window (advisory only)
    pub async fn failure_rate(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.prune_window(Instant::now(), self.config.monitoring_period);
        state.failure_rate()
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        self.on_success(Slot::Any).await;
    }

    async fn on_success(&self, slot: Slot) {
        let mut state = self.state.lock().await;
        self.refresh(&mut state);
        state.last_success_at = Some(Utc::now());
        state.push_outcome(false, self.config.monitoring_period);

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                if slot.frees(&state) {
                    state.half_open_attempts = state.half_open_attempts.saturating_sub(1);
                }
                state.success_count += 1;
                debug!(
                    breaker = %self.name,
                    successes = state.success_count,
                    needed = self.config.success_threshold,
                    "Trial request succeeded"
                );
                if state.success_count >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            // A straggler admitted before the trip finished; it proves nothing
            // about recovery, so the cooldown still applies.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        self.refresh(&mut state);
        state.last_failure_at = Some(Utc::now());
        state.push_outcome(true, self.config.monitoring_period);

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Give back an admitted call without recording an outcome
    ///
    /// For calls abandoned by the caller (cancellation); frees the half-open
    /// trial slot reserved by [`is_allowed`](Self::is_allowed).
    pub async fn release_trial(&self) {
        let mut state = self.state.lock().await;
        let generation = state.generation;
        self.free_slot(&mut state, generation);
    }

    fn free_slot(&self, state: &mut CircuitBreakerState, generation: u64) {
        if state.state == CircuitState::HalfOpen && state.generation == generation {
            state.half_open_attempts = state.half_open_attempts.saturating_sub(1);
            debug!(breaker = %self.name, in_flight = state.half_open_attempts, "Trial slot released");
        }
    }

    /// Run `op` if the breaker allows it and record the outcome
    ///
    /// Returns [`ResilienceError::CircuitOpen`] (converted into `E`) without
    /// invoking `op` when traffic is not allowed.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let Some(permit) = self.admit().await else {
            return Err(ResilienceError::CircuitOpen {
                name: self.name.to_string(),
            }
            .into());
        };

        match op().await {
            Ok(result) => {
                permit.record_success().await;
                Ok(result)
            }
            Err(e) => {
                permit.record_failure().await;
                Err(e)
            }
        }
    }

    /// Reset the circuit breaker to closed state
    ///
    /// Trip count and the outcome window are kept; they are history, not state.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
        state.failure_count = 0;
        state.success_count = 0;
        state.half_open_attempts = 0;
    }

    /// Open the circuit immediately, e.g. for a known maintenance window
    pub async fn force_open(&self) {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Open {
            self.transition(&mut state, CircuitState::Open);
        } else {
            state.opened_at = Some(Instant::now());
        }
    }

    /// Snapshot of counters and timestamps
    pub async fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock().await;
        self.refresh(&mut state);
        state.prune_window(Instant::now(), self.config.monitoring_period);

        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_trips: state.total_trips,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            last_state_change_at: state.last_state_change_at,
            failure_rate: state.failure_rate(),
            window_size: state.window.len(),
        }
    }

    /// Apply the lazy open → half-open transition when the cooldown has passed
    fn refresh(&self, state: &mut CircuitBreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() >= self.config.cooldown {
                self.transition(state, CircuitState::HalfOpen);
            }
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.generation += 1;
        state.last_state_change_at = Utc::now();

        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                state.total_trips += 1;
                state.failure_count = 0;
                state.success_count = 0;
                state.half_open_attempts = 0;
                warn!(
                    breaker = %self.name,
                    from = %from,
                    trips = state.total_trips,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                state.success_count = 0;
                state.half_open_attempts = 0;
                info!(breaker = %self.name, "Circuit breaker half-open, admitting trial requests");
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.failure_count = 0;
                state.success_count = 0;
                state.half_open_attempts = 0;
                info!(breaker = %self.name, from = %from, "Circuit breaker closed");
            }
        }

        // No receivers is the common case and not an error
        let _ = self.events.send(StateTransition {
            breaker: self.name.to_string(),
            from,
            to,
            at: state.last_state_change_at,
        });
    }
}
