//! Fixed-window admission control.
//!
//! A [`RateLimiter`] admits at most `max_requests` calls per `window`.
//! Callers of [`RateLimiter::acquire`] queue on an async mutex and the one at
//! the head sleeps out the rest of a saturated window, so admission is FIFO
//! and no window ever sees more than `max_requests` admissions.
//!
//! Introspection ([`remaining`](RateLimiter::remaining),
//! [`reset_at`](RateLimiter::reset_at)) never waits behind a sleeping caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct WindowState {
    requests_in_window: u32,
    window_started_at: Instant,
    total_admitted: u64,
    total_delayed: u64,
}

impl WindowState {
    fn roll(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_started_at) >= window {
            self.requests_in_window = 0;
            self.window_started_at = now;
        }
    }
}

/// Snapshot of a limiter for health reporting and client back-off hints.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub max_requests: u32,
    pub window_ms: u64,
    pub burst_allowance: u32,
    pub remaining: u32,
    pub reset_in_ms: u64,
    pub total_admitted: u64,
    pub total_delayed: u64,
}

/// Single-window rate limiter owned by one service or domain.
#[derive(Clone)]
pub struct RateLimiter {
    name: String,
    window: Duration,
    max_requests: u32,
    burst_allowance: u32,
    admission: Arc<tokio::sync::Mutex<()>>,
    state: Arc<Mutex<WindowState>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests: max_requests.max(1),
            burst_allowance: 0,
            admission: Arc::new(tokio::sync::Mutex::new(())),
            state: Arc::new(Mutex::new(WindowState {
                requests_in_window: 0,
                window_started_at: Instant::now(),
                total_admitted: 0,
                total_delayed: 0,
            })),
        }
    }

    pub fn per_minute(name: impl Into<String>, max_requests: u32) -> Self {
        Self::new(name, max_requests, Duration::from_secs(60))
    }

    pub fn with_burst_allowance(mut self, burst_allowance: u32) -> Self {
        self.burst_allowance = burst_allowance;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(limiter = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Consume a slot if one is free, otherwise return how long until the
    /// window resets.
    fn admit(&self) -> Result<(), Duration> {
        let mut state = self.lock_state();
        let now = Instant::now();
        state.roll(now, self.window);

        if state.requests_in_window < self.max_requests {
            state.requests_in_window += 1;
            state.total_admitted += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(state.window_started_at);
            Err(self.window.saturating_sub(elapsed))
        }
    }

    /// Wait for a slot, then consume it.
    ///
    /// Dropping the returned future before it completes consumes nothing.
    pub async fn acquire(&self) {
        let _turn = self.admission.lock().await;

        let wait = match self.admit() {
            Ok(()) => return,
            Err(wait) => wait,
        };

        tracing::debug!(
            limiter = %self.name,
            wait_ms = %wait.as_millis(),
            "Rate limit reached, waiting for next window"
        );
        tokio::time::sleep(wait).await;

        // The full window has been waited out: start a fresh one.
        let mut state = self.lock_state();
        state.requests_in_window = 1;
        state.window_started_at = Instant::now();
        state.total_admitted += 1;
        state.total_delayed += 1;
    }

    /// Consume a slot only if one is free right now and nobody is queued.
    pub fn try_acquire(&self) -> bool {
        match self.admission.try_lock() {
            Ok(_turn) => self.admit().is_ok(),
            Err(_) => false,
        }
    }

    /// Non-blocking check: true iff a slot is currently free.
    pub fn can_make_request(&self) -> bool {
        self.remaining() > 0
    }

    pub fn remaining(&self) -> u32 {
        let state = self.lock_state();
        if Instant::now().duration_since(state.window_started_at) >= self.window {
            self.max_requests
        } else {
            self.max_requests.saturating_sub(state.requests_in_window)
        }
    }

    /// Time until the current window ends.
    pub fn reset_in(&self) -> Duration {
        let state = self.lock_state();
        self.window
            .saturating_sub(Instant::now().duration_since(state.window_started_at))
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        let reset_in = chrono::TimeDelta::from_std(self.reset_in()).unwrap_or_default();
        Utc::now() + reset_in
    }

    pub fn stats(&self) -> RateLimiterStats {
        let remaining = self.remaining();
        let reset_in = self.reset_in();
        let state = self.lock_state();
        RateLimiterStats {
            name: self.name.clone(),
            max_requests: self.max_requests,
            window_ms: self.window.as_millis() as u64,
            burst_allowance: self.burst_allowance,
            remaining,
            reset_in_ms: reset_in.as_millis() as u64,
            total_admitted: state.total_admitted,
            total_delayed: state.total_delayed,
        }
    }

    /// Forget all admissions and start a fresh window.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.requests_in_window = 0;
        state.window_started_at = Instant::now();
        state.total_admitted = 0;
        state.total_delayed = 0;
    }
}

/// Per-minute limiter with an optional hourly ceiling, as configured for a
/// registered service.
#[derive(Clone)]
pub struct ServiceLimiter {
    minute: RateLimiter,
    hourly: Option<RateLimiter>,
}

impl ServiceLimiter {
    pub fn from_config(name: &str, config: &RateLimitConfig) -> Self {
        let minute = RateLimiter::per_minute(format!("{name}/minute"), config.requests_per_minute)
            .with_burst_allowance(config.burst_allowance);
        let hourly = config.requests_per_hour.map(|limit| {
            RateLimiter::new(format!("{name}/hour"), limit, Duration::from_secs(60 * 60))
        });
        Self { minute, hourly }
    }

    /// Wait for both windows. The hourly slot is taken first so a long
    /// hourly wait never burns a minute slot.
    pub async fn acquire(&self) {
        if let Some(hourly) = &self.hourly {
            hourly.acquire().await;
        }
        self.minute.acquire().await;
    }

    pub fn can_make_request(&self) -> bool {
        self.minute.can_make_request()
            && self.hourly.as_ref().is_none_or(RateLimiter::can_make_request)
    }

    pub fn remaining(&self) -> u32 {
        match &self.hourly {
            Some(hourly) => self.minute.remaining().min(hourly.remaining()),
            None => self.minute.remaining(),
        }
    }

    /// When the binding window resets.
    pub fn reset_in(&self) -> Duration {
        match &self.hourly {
            Some(hourly) if hourly.remaining() == 0 => hourly.reset_in(),
            _ => self.minute.reset_in(),
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        match &self.hourly {
            Some(hourly) if hourly.remaining() == 0 => hourly.reset_at(),
            _ => self.minute.reset_at(),
        }
    }

    pub fn minute(&self) -> &RateLimiter {
        &self.minute
    }

    pub fn hourly(&self) -> Option<&RateLimiter> {
        self.hourly.as_ref()
    }

    pub fn reset(&self) {
        self.minute.reset();
        if let Some(hourly) = &self.hourly {
            hourly.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_max_immediately() {
        let limiter = RateLimiter::per_minute("test", 3);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.remaining(), 0);
        assert!(!limiter.can_make_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_waits_for_next_window() {
        let limiter = RateLimiter::per_minute("test", 3);
        let start = Instant::now();
        let mut admitted_at = Vec::new();

        for _ in 0..5 {
            limiter.acquire().await;
            admitted_at.push(start.elapsed());
        }

        assert!(admitted_at[..3].iter().all(|d| *d == Duration::ZERO));
        assert!(admitted_at[3] >= Duration::from_secs(60));
        assert!(admitted_at[4] >= Duration::from_secs(60));
        assert!(admitted_at[4] < Duration::from_secs(120));

        // Nothing admitted in the second window beyond max.
        let second_window = admitted_at
            .iter()
            .filter(|d| **d >= Duration::from_secs(60) && **d < Duration::from_secs(120))
            .count();
        assert!(second_window <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_window() {
        let limiter = RateLimiter::per_minute("test", 4);
        let start = Instant::now();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    start.elapsed()
                })
            })
            .collect();

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }

        let first = times.iter().filter(|d| **d < Duration::from_secs(60)).count();
        assert_eq!(first, 4);
        for window in 0..3u64 {
            let lo = Duration::from_secs(60 * window);
            let hi = Duration::from_secs(60 * (window + 1));
            let in_window = times.iter().filter(|d| **d >= lo && **d < hi).count();
            assert!(in_window <= 4, "window {window} admitted {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let limiter = RateLimiter::per_minute("test", 2);
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.remaining(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(limiter.remaining(), 2);
        assert!(limiter.try_acquire());
        assert_eq!(limiter.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_wait_resets_window_unconditionally() {
        let limiter = RateLimiter::per_minute("test", 1);
        limiter.acquire().await;
        limiter.acquire().await;

        // The waited-out call opened a fresh window holding just itself.
        let stats = limiter.stats();
        assert_eq!(stats.remaining, 0);
        assert_eq!(stats.total_admitted, 2);
        assert_eq!(stats.total_delayed, 1);
        assert_eq!(stats.reset_in_ms, 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_does_not_wait() {
        let limiter = RateLimiter::per_minute("test", 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_consumes_nothing() {
        let limiter = RateLimiter::per_minute("test", 1);
        limiter.acquire().await;

        let waited = tokio::time::timeout(Duration::from_secs(5), limiter.acquire()).await;
        assert!(waited.is_err());

        assert_eq!(limiter.stats().total_admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_limiter_respects_hourly_ceiling() {
        let config = RateLimitConfig::per_minute(10).with_hourly_limit(2);
        let limiter = ServiceLimiter::from_config("osm", &config);

        limiter.acquire().await;
        limiter.acquire().await;

        assert_eq!(limiter.remaining(), 0);
        assert!(!limiter.can_make_request());
        assert!(limiter.reset_in() > Duration::from_secs(60));
        assert_eq!(limiter.minute().remaining(), 8);
    }
}
