//! Static configuration for services, cache namespaces and the scrape queue.
//!
//! Every struct deserializes from JSON (durations are written in
//! milliseconds) and has sensible defaults, so a config file only needs to
//! list what it overrides. Environment variables are applied on top by
//! [`CaddieConfig::apply_env`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;

/// Serde adapter writing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Admission limits for one service or domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    /// Optional second, longer window.
    pub requests_per_hour: Option<u32>,
    /// Headroom above the steady rate the provider tolerates. Informational:
    /// the limiter keeps a single counter per window.
    pub burst_allowance: u32,
    /// Longest a caller may wait for a slot before the call is refused.
    #[serde(rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: None,
            burst_allowance: 10,
            max_wait: Duration::from_secs(65),
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            ..Default::default()
        }
    }

    pub fn with_hourly_limit(mut self, requests_per_hour: u32) -> Self {
        self.requests_per_hour = Some(requests_per_hour);
        self
    }

    pub fn with_burst(mut self, burst_allowance: u32) -> Self {
        self.burst_allowance = burst_allowance;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Retry configuration with capped exponential backoff.
///
/// `delay(attempt) = min(base_delay * backoff_base^attempt, max_delay)`,
/// with `attempt` counted from 1 for the first retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    pub backoff_base: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_base: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let factor = self.backoff_base.max(1.0).powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }
}

/// Everything needed to build one registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub base_url: String,
    #[serde(rename = "timeout_ms", with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout: default_timeout(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    /// OpenWeatherMap-compatible current conditions and forecasts.
    pub fn weather() -> Self {
        Self::new("weather", "https://api.openweathermap.org/data/2.5")
            .with_rate_limit(
                RateLimitConfig::per_minute(60)
                    .with_hourly_limit(1000)
                    .with_burst(10),
            )
    }

    /// MediaWiki action API.
    pub fn wikipedia() -> Self {
        Self::new("wikipedia", "https://en.wikipedia.org/w/api.php")
            .with_timeout(Duration::from_secs(15))
            .with_rate_limit(RateLimitConfig::per_minute(100).with_burst(20))
    }

    /// Overpass API over OpenStreetMap data.
    pub fn osm() -> Self {
        Self::new("osm", "https://overpass-api.de/api/interpreter")
            .with_timeout(Duration::from_secs(30))
            .with_rate_limit(
                RateLimitConfig::per_minute(10)
                    .with_hourly_limit(300)
                    .with_burst(2),
            )
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(120),
                ..Default::default()
            })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ConfigError("service name must not be empty".into()));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(AppError::ConfigError(format!(
                "service '{}': requests_per_minute must be at least 1",
                self.name
            )));
        }
        if self.rate_limit.requests_per_hour == Some(0) {
            return Err(AppError::ConfigError(format!(
                "service '{}': requests_per_hour must be at least 1",
                self.name
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::ConfigError(format!(
                "service '{}': failure_threshold must be at least 1",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(AppError::ConfigError(format!(
                "service '{}': timeout must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// One independently expiring cache namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(rename = "ttl_seconds", with = "duration_secs")]
    pub ttl: Duration,
    pub max_entries: u64,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>, ttl: Duration, max_entries: u64) -> Self {
        Self {
            name: name.into(),
            ttl,
            max_entries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub namespaces: Vec<NamespaceConfig>,
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    /// Current conditions go stale fast, course history hardly ever.
    fn default() -> Self {
        Self {
            namespaces: vec![
                NamespaceConfig::new("current", Duration::from_secs(10 * 60), 1_000),
                NamespaceConfig::new("forecast", Duration::from_secs(60 * 60), 1_000),
                NamespaceConfig::new("golf", Duration::from_secs(6 * 60 * 60), 5_000),
                NamespaceConfig::new("historical", Duration::from_secs(24 * 60 * 60), 5_000),
            ],
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Scrape queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_requests: usize,
    /// Politeness gap between two requests to the same domain.
    #[serde(rename = "default_crawl_delay_ms", with = "duration_ms")]
    pub default_crawl_delay: Duration,
    /// Random extra delay (uniform `[0, jitter)`) on top of the crawl delay.
    #[serde(rename = "jitter_ms", with = "duration_ms")]
    pub jitter: Duration,
    pub exponential_backoff_base: f64,
    #[serde(rename = "base_retry_delay_ms", with = "duration_ms")]
    pub base_retry_delay: Duration,
    #[serde(rename = "max_retry_delay_ms", with = "duration_ms")]
    pub max_retry_delay: Duration,
    pub max_retries: u32,
    pub domain_requests_per_minute: u32,
    pub domain_circuit_breaker: CircuitBreakerConfig,
    pub user_agent: String,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 3,
            default_crawl_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
            exponential_backoff_base: 2.0,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            max_retries: 3,
            domain_requests_per_minute: 30,
            domain_circuit_breaker: CircuitBreakerConfig::default(),
            user_agent: "Caddie/0.3 (golf course data aggregator)".into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_retry_delay,
            backoff_base: self.exponential_backoff_base,
            max_delay: self.max_retry_delay,
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn with_crawl_delay(mut self, delay: Duration) -> Self {
        self.default_crawl_delay = delay;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_retry_delay = base;
        self.max_retry_delay = max;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrent_requests == 0 {
            return Err(AppError::ConfigError(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.domain_requests_per_minute == 0 {
            return Err(AppError::ConfigError(
                "domain_requests_per_minute must be at least 1".into(),
            ));
        }
        if self.exponential_backoff_base < 1.0 {
            return Err(AppError::ConfigError(format!(
                "exponential_backoff_base {} must be >= 1.0",
                self.exponential_backoff_base
            )));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaddieConfig {
    pub services: Vec<ServiceConfig>,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
}

impl Default for CaddieConfig {
    fn default() -> Self {
        Self {
            services: vec![
                ServiceConfig::weather(),
                ServiceConfig::wikipedia(),
                ServiceConfig::osm(),
            ],
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl CaddieConfig {
    /// Read a JSON config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        let mut config: CaddieConfig = serde_json::from_str(&raw)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from environment variables.
    ///
    /// - `CADDIE_MAX_CONCURRENT` (positive integer)
    /// - `CADDIE_CRAWL_DELAY_MS` (integer milliseconds)
    /// - `CADDIE_USER_AGENT`
    /// - `CADDIE_<SERVICE>_RPM`, e.g. `CADDIE_WEATHER_RPM`
    pub fn apply_env(&mut self) -> Result<(), AppError> {
        if let Some(max) = env_number::<usize>("CADDIE_MAX_CONCURRENT")? {
            self.queue.max_concurrent_requests = max;
        }
        if let Some(ms) = env_number::<u64>("CADDIE_CRAWL_DELAY_MS")? {
            self.queue.default_crawl_delay = Duration::from_millis(ms);
        }
        if let Ok(agent) = std::env::var("CADDIE_USER_AGENT")
            && !agent.trim().is_empty()
        {
            self.queue.user_agent = agent;
        }
        for service in &mut self.services {
            let key = format!("CADDIE_{}_RPM", service.name.to_uppercase().replace('-', "_"));
            if let Some(rpm) = env_number::<u32>(&key)? {
                service.rate_limit.requests_per_minute = rpm;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        for service in &self.services {
            service.validate()?;
        }
        self.queue.validate()
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(None),
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
        }),
    }
}
