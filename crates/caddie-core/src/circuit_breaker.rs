//! Circuit breaker for isolating failing upstreams.
//!
//! One breaker guards one service (or one scraped domain) so that a dead
//! dependency fails fast instead of tying up workers needed elsewhere.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N consecutive failures]--> OPEN --[reset_timeout]--> HALF_OPEN (one trial)
//!                                        ^                            |
//!                                        +---------[failure]----------+
//!                                                                     |
//! CLOSED <--------------------------[success]-------------------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without being invoked.
    Open,
    /// A single trial call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call is allowed.
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,

    /// Failures further apart than this do not accumulate.
    #[serde(rename = "monitoring_period_ms", with = "duration_ms")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_error_message: Option<String>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
            last_error_message: None,
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
        }
    }

    fn retry_after(&self, reset_timeout: Duration) -> Duration {
        self.opened_at
            .map(|t| reset_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(reset_timeout)
    }
}

/// Snapshot of a breaker for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub last_error: Option<String>,
    pub time_until_half_open_ms: Option<u64>,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - the operation was not invoked.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { name, retry_after } => {
                AppError::CircuitOpen { name, retry_after }
            }
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Thread-safe circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

/// Releases the half-open trial slot if the trial future is dropped early.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.breaker.lock_inner().trial_in_flight = false;
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// True unless the circuit is open or its half-open trial is taken.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open_ms = (inner.state == CircuitState::Open)
            .then(|| inner.retry_after(self.config.reset_timeout).as_millis() as u64);

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
            last_error: inner.last_error_message.clone(),
            time_until_half_open_ms,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `CircuitBreakerError::Open` immediately
    /// - HalfOpen: the first caller runs as the trial, others are rejected
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let is_trial = {
            let mut inner = self.lock_inner();
            self.maybe_transition_to_half_open(&mut inner);

            let admitted = match inner.state {
                CircuitState::Closed => Some(false),
                CircuitState::HalfOpen if !inner.trial_in_flight => {
                    inner.trial_in_flight = true;
                    Some(true)
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            };

            match admitted {
                Some(is_trial) => is_trial,
                None => {
                    inner.rejected += 1;
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: inner.retry_after(self.config.reset_timeout),
                    });
                }
            }
        };

        let _guard = is_trial.then(|| TrialGuard { breaker: self });

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(is_trial),
            Err(e) if e.should_trip_circuit() => self.on_failure(e, is_trial),
            Err(_) => {}
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    /// Record a success from outside [`CircuitBreaker::call`]. In the
    /// half-open state this counts as the trial.
    pub fn record_success(&self) {
        self.on_success(true);
    }

    /// Record a tripping failure from outside [`CircuitBreaker::call`].
    pub fn record_failure(&self, error: &AppError) {
        self.on_failure(error, true);
    }

    /// Only the admitted trial may move a half-open circuit. A call that was
    /// admitted while closed and finishes after the circuit opened is just
    /// counted.
    fn on_success(&self, is_trial: bool) {
        let mut inner = self.lock_inner();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::HalfOpen if !is_trial => {
                tracing::debug!(circuit = %self.name, "Ignoring stale success while half-open");
            }
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful trial");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.last_error_message = None;
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &AppError, is_trial: bool) {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        inner.total_failures += 1;
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                if inner
                    .last_failure_at
                    .is_some_and(|t| now.duration_since(t) > self.config.monitoring_period)
                {
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;
                inner.last_failure_at = Some(now);

                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen if !is_trial => {
                tracing::debug!(circuit = %self.name, "Ignoring stale failure while half-open");
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker trial failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.last_failure_at = Some(now);
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new();
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.reset_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }
}
