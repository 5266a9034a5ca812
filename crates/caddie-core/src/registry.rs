//! Registry of named external services.
//!
//! Every outbound call to a weather, Wikipedia or OSM endpoint goes through
//! [`ServiceRegistry::call`], which applies the service's rate limiter,
//! circuit breaker and timeout, then folds the outcome into rolling health
//! metrics. The registry reports one attempt per call; retrying is up to the
//! caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::config::ServiceConfig;
use crate::error::{AppError, ErrorKind};
use crate::rate_limit::{RateLimiterStats, ServiceLimiter};
use crate::response::ApiResponse;

/// Weight of the newest sample in the response-time moving average.
const RESPONSE_TIME_WEIGHT: f64 = 0.3;
const ERROR_RATE_DECAY: f64 = 0.1;
const ERROR_RATE_PENALTY: f64 = 0.2;
const DEGRADED_ERROR_RATE: f64 = 0.2;
const UNHEALTHY_ERROR_RATE: f64 = 0.5;
const SLOW_RESPONSE_MS: f64 = 10_000.0;

/// Coarse health of a service, a cache, or the whole registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }

    /// Worst state of a set; healthy when empty.
    pub fn worst(states: impl IntoIterator<Item = HealthState>) -> HealthState {
        states.into_iter().max().unwrap_or(HealthState::Healthy)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-call switches for [`ServiceRegistry::call`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub skip_rate_limit: bool,
    pub skip_circuit_breaker: bool,
}

impl CallOptions {
    pub fn skip_rate_limit(mut self) -> Self {
        self.skip_rate_limit = true;
        self
    }

    pub fn skip_circuit_breaker(mut self) -> Self {
        self.skip_circuit_breaker = true;
        self
    }
}

#[derive(Debug)]
struct HealthMetrics {
    response_time_ms: Option<f64>,
    error_rate: f64,
    last_check: DateTime<Utc>,
    status: HealthState,
    requests: u64,
    successes: u64,
    failures: u64,
    rate_limited: u64,
    circuit_rejected: u64,
    last_error: Option<String>,
    errors_by_kind: HashMap<ErrorKind, u64>,
}

impl HealthMetrics {
    fn new() -> Self {
        Self {
            response_time_ms: None,
            error_rate: 0.0,
            last_check: Utc::now(),
            status: HealthState::Healthy,
            requests: 0,
            successes: 0,
            failures: 0,
            rate_limited: 0,
            circuit_rejected: 0,
            last_error: None,
            errors_by_kind: HashMap::new(),
        }
    }

    fn record_response_time(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.response_time_ms = Some(match self.response_time_ms {
            Some(avg) => RESPONSE_TIME_WEIGHT * sample + (1.0 - RESPONSE_TIME_WEIGHT) * avg,
            None => sample,
        });
    }

    fn record_success(&mut self, elapsed: Duration) -> Option<(HealthState, HealthState)> {
        self.requests += 1;
        self.successes += 1;
        self.record_response_time(elapsed);
        self.error_rate = (self.error_rate - ERROR_RATE_DECAY).max(0.0);
        self.refresh()
    }

    /// Upstream failure: counts against the error rate.
    fn record_failure(
        &mut self,
        error: &AppError,
        elapsed: Option<Duration>,
    ) -> Option<(HealthState, HealthState)> {
        self.requests += 1;
        self.failures += 1;
        if let Some(elapsed) = elapsed {
            self.record_response_time(elapsed);
        }
        self.error_rate = (self.error_rate + ERROR_RATE_PENALTY).min(1.0);
        self.note_error(error);
        self.refresh()
    }

    /// Denied locally before reaching the upstream.
    fn record_denial(&mut self, error: &AppError) {
        self.requests += 1;
        match error {
            AppError::RateLimitExceeded { .. } => self.rate_limited += 1,
            AppError::CircuitOpen { .. } => self.circuit_rejected += 1,
            _ => {}
        }
        self.note_error(error);
    }

    fn note_error(&mut self, error: &AppError) {
        *self.errors_by_kind.entry(error.kind()).or_default() += 1;
        self.last_error = Some(error.to_string());
    }

    fn derive_status(&self) -> HealthState {
        if self.error_rate > UNHEALTHY_ERROR_RATE {
            HealthState::Unhealthy
        } else if self.error_rate > DEGRADED_ERROR_RATE
            || self.response_time_ms.unwrap_or(0.0) > SLOW_RESPONSE_MS
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn refresh(&mut self) -> Option<(HealthState, HealthState)> {
        self.last_check = Utc::now();
        let next = self.derive_status();
        let previous = std::mem::replace(&mut self.status, next);
        (previous != next).then_some((previous, next))
    }
}

/// One registered external service and the protections bound to it.
pub struct ServiceInstance {
    config: ServiceConfig,
    limiter: ServiceLimiter,
    breaker: CircuitBreaker,
    health: Mutex<HealthMetrics>,
}

impl ServiceInstance {
    fn new(config: ServiceConfig) -> Self {
        let limiter = ServiceLimiter::from_config(&config.name, &config.rate_limit);
        let breaker = CircuitBreaker::new(config.name.clone(), config.circuit_breaker.clone());
        Self {
            config,
            limiter,
            breaker,
            health: Mutex::new(HealthMetrics::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ServiceLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn lock_health(&self) -> std::sync::MutexGuard<'_, HealthMetrics> {
        self.health.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(service = %self.config.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn log_transition(&self, transition: Option<(HealthState, HealthState)>) {
        if let Some((from, to)) = transition {
            tracing::warn!(
                service = %self.config.name,
                %from,
                %to,
                "Service health changed"
            );
        }
    }

    fn health(&self) -> ServiceHealth {
        let health = self.lock_health();
        ServiceHealth {
            name: self.config.name.clone(),
            status: health.status,
            response_time_ms: health.response_time_ms.unwrap_or(0.0),
            error_rate: health.error_rate,
            last_check: health.last_check,
            circuit_state: self.breaker.state(),
            remaining_requests: self.limiter.remaining(),
        }
    }

    fn stats(&self) -> ServiceStats {
        let health = self.lock_health();
        ServiceStats {
            name: self.config.name.clone(),
            base_url: self.config.base_url.clone(),
            status: health.status,
            requests: health.requests,
            successes: health.successes,
            failures: health.failures,
            rate_limited: health.rate_limited,
            circuit_rejected: health.circuit_rejected,
            avg_response_time_ms: health.response_time_ms.unwrap_or(0.0),
            error_rate: health.error_rate,
            last_error: health.last_error.clone(),
            errors_by_kind: health.errors_by_kind.clone(),
            rate_limit: self.limiter.minute().stats(),
            hourly_rate_limit: self.limiter.hourly().map(|l| l.stats()),
            circuit_breaker: self.breaker.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: HealthState,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub last_check: DateTime<Utc>,
    pub circuit_state: CircuitState,
    pub remaining_requests: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub overall: HealthState,
    pub services: Vec<ServiceHealth>,
    pub timestamp: DateTime<Utc>,
    pub uptime_ms: u64,
    /// Health sweeps completed since startup.
    pub health_sweeps: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub name: String,
    pub base_url: String,
    pub status: HealthState,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub circuit_rejected: u64,
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
    pub last_error: Option<String>,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub rate_limit: RateLimiterStats,
    pub hourly_rate_limit: Option<RateLimiterStats>,
    pub circuit_breaker: CircuitBreakerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub circuit_rejected_requests: u64,
    pub success_rate: f64,
    pub uptime_ms: u64,
    pub services: Vec<ServiceStats>,
}

#[derive(Default)]
struct Totals {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
}

impl Totals {
    fn reset(&self) {
        for counter in [
            &self.requests,
            &self.successes,
            &self.failures,
            &self.rate_limited,
            &self.circuit_rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

struct RegistryInner {
    services: HashMap<String, ServiceInstance>,
    started_at: Instant,
    totals: Totals,
    sweeps: AtomicU64,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Guarded entry point for all calls to pre-registered services.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    /// Build the registry from static configuration.
    pub fn new(configs: impl IntoIterator<Item = ServiceConfig>) -> Result<Self, AppError> {
        let mut services = HashMap::new();
        for config in configs {
            config.validate()?;
            if services.contains_key(&config.name) {
                return Err(AppError::ConfigError(format!(
                    "service '{}' registered twice",
                    config.name
                )));
            }
            tracing::debug!(
                service = %config.name,
                rpm = config.rate_limit.requests_per_minute,
                "Registering service"
            );
            services.insert(config.name.clone(), ServiceInstance::new(config));
        }

        Ok(Self {
            inner: Arc::new(RegistryInner {
                services,
                started_at: Instant::now(),
                totals: Totals::default(),
                shutdown: CancellationToken::new(),
                sweeps: AtomicU64::new(0),
                monitor: Mutex::new(None),
            }),
        })
    }

    /// Registry with the weather, wikipedia and osm presets.
    pub fn with_defaults() -> Result<Self, AppError> {
        Self::new([
            ServiceConfig::weather(),
            ServiceConfig::wikipedia(),
            ServiceConfig::osm(),
        ])
    }

    pub fn service(&self, name: &str) -> Option<&ServiceInstance> {
        self.inner.services.get(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `operation` against `service` with rate limiting, circuit
    /// breaking and the service timeout applied.
    pub async fn call<T, F, Fut>(
        &self,
        service: &str,
        operation: F,
        options: CallOptions,
    ) -> ApiResponse<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let totals = &self.inner.totals;
        totals.requests.fetch_add(1, Ordering::Relaxed);

        let Some(instance) = self.inner.services.get(service) else {
            tracing::warn!(%request_id, %service, "Call to unregistered service");
            totals.failures.fetch_add(1, Ordering::Relaxed);
            let mut response =
                ApiResponse::new(Err(AppError::UnregisteredService(service.into())), request_id);
            response.processing_time_ms = started.elapsed().as_millis() as u64;
            return response;
        };

        tracing::debug!(%request_id, %service, "Call started");
        let result = self.guarded_call(instance, operation, options).await;

        let result = match result {
            Outcome::Success(value, elapsed) => {
                totals.successes.fetch_add(1, Ordering::Relaxed);
                let transition = instance.lock_health().record_success(elapsed);
                instance.log_transition(transition);
                tracing::debug!(
                    %request_id,
                    %service,
                    elapsed_ms = %elapsed.as_millis(),
                    "Call succeeded"
                );
                Ok(value)
            }
            Outcome::Denied(error) => {
                totals.failures.fetch_add(1, Ordering::Relaxed);
                match &error {
                    AppError::RateLimitExceeded { .. } => {
                        totals.rate_limited.fetch_add(1, Ordering::Relaxed);
                    }
                    AppError::CircuitOpen { .. } => {
                        totals.circuit_rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                instance.lock_health().record_denial(&error);
                tracing::info!(%request_id, %service, error = %error, "Call denied");
                Err(error)
            }
            Outcome::Failed(error, elapsed) => {
                totals.failures.fetch_add(1, Ordering::Relaxed);
                let transition = instance.lock_health().record_failure(&error, elapsed);
                instance.log_transition(transition);
                tracing::warn!(
                    %request_id,
                    %service,
                    error = %error,
                    retryable = error.is_retryable(),
                    "Call failed"
                );
                Err(error)
            }
        };

        ApiResponse {
            result,
            cached: false,
            request_id,
            processing_time_ms: started.elapsed().as_millis() as u64,
            remaining_requests: Some(instance.limiter.remaining()),
            reset_at: Some(instance.limiter.reset_at()),
        }
    }

    async fn guarded_call<T, F, Fut>(
        &self,
        instance: &ServiceInstance,
        operation: F,
        options: CallOptions,
    ) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let config = &instance.config;

        if !options.skip_rate_limit
            && tokio::time::timeout(config.rate_limit.max_wait, instance.limiter.acquire())
                .await
                .is_err()
        {
            return Outcome::Denied(AppError::RateLimitExceeded {
                service: config.name.clone(),
                retry_after: instance.limiter.reset_in(),
            });
        }

        let timeout = config.timeout;
        let upstream_started = Instant::now();
        let timed = || async move {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(timeout.as_millis() as u64)),
            }
        };

        let result = if options.skip_circuit_breaker {
            timed().await
        } else {
            instance.breaker.call(timed).await.map_err(AppError::from)
        };

        match result {
            Ok(value) => Outcome::Success(value, upstream_started.elapsed()),
            Err(error @ AppError::CircuitOpen { .. }) => Outcome::Denied(error),
            Err(error) => Outcome::Failed(error, Some(upstream_started.elapsed())),
        }
    }

    pub fn health(&self) -> RegistryHealth {
        let services: Vec<_> = self
            .service_names()
            .iter()
            .filter_map(|name| self.inner.services.get(name))
            .map(ServiceInstance::health)
            .collect();

        RegistryHealth {
            overall: HealthState::worst(services.iter().map(|s| s.status)),
            services,
            timestamp: Utc::now(),
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            health_sweeps: self.inner.sweeps.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let totals = &self.inner.totals;
        let total_requests = totals.requests.load(Ordering::Relaxed);
        let successful_requests = totals.successes.load(Ordering::Relaxed);
        let success_rate = if total_requests == 0 {
            0.0
        } else {
            successful_requests as f64 / total_requests as f64
        };

        RegistryStats {
            total_requests,
            successful_requests,
            failed_requests: totals.failures.load(Ordering::Relaxed),
            rate_limited_requests: totals.rate_limited.load(Ordering::Relaxed),
            circuit_rejected_requests: totals.circuit_rejected.load(Ordering::Relaxed),
            success_rate,
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            services: self
                .service_names()
                .iter()
                .filter_map(|name| self.inner.services.get(name))
                .map(ServiceInstance::stats)
                .collect(),
        }
    }

    /// Zero counters and health metrics. Rate-limit windows and breaker
    /// state are kept: they mirror upstream limits, not bookkeeping.
    pub fn reset_stats(&self) {
        self.inner.totals.reset();
        for instance in self.inner.services.values() {
            *instance.lock_health() = HealthMetrics::new();
        }
        tracing::info!("Registry statistics reset");
    }

    /// Re-derive every service's health once.
    pub fn sweep_health(&self) {
        for instance in self.inner.services.values() {
            let transition = instance.lock_health().refresh();
            instance.log_transition(transition);
            if instance.breaker.state() == CircuitState::Open {
                tracing::debug!(service = %instance.config.name, "Circuit open during health sweep");
            }
        }
        self.inner.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Start the background health sweep. Calling it again is a no-op.
    pub fn spawn_health_monitor(&self, interval: Duration) {
        let mut monitor = self.inner.monitor.lock().unwrap_or_else(|p| p.into_inner());
        if monitor.is_some() {
            return;
        }

        let registry = self.clone();
        let shutdown = self.inner.shutdown.clone();
        *monitor = Some(tokio::spawn(async move {
            tracing::debug!(interval_ms = %interval.as_millis(), "Health monitor started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => registry.sweep_health(),
                    () = shutdown.cancelled() => break,
                }
            }
            tracing::debug!("Health monitor stopped");
        }));
    }

    /// Stop background work.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

enum Outcome<T> {
    Success(T, Duration),
    /// Refused by the limiter or the breaker; the upstream was not called.
    Denied(AppError),
    Failed(AppError, Option<Duration>),
}
