//! Per-domain politeness spacing for the scrape queue.
//!
//! Two requests to the same domain are kept at least `delay` (plus optional
//! jitter) apart. Each caller reserves its slot before sleeping, so
//! concurrent workers hitting one domain are spread out rather than released
//! together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use caddie_core::throttle::{DomainThrottle, ThrottleConfig};
//!
//! # async fn run() {
//! let throttle = DomainThrottle::new(
//!     ThrottleConfig::new(Duration::from_secs(1)).with_jitter(Duration::from_millis(250)),
//! );
//! throttle.wait("example.com").await;
//! throttle.wait("example.com").await; // ~1s later
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Spacing between requests to one domain.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive requests to the same domain.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter)).
    /// `Duration::ZERO` disables it.
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = rand_jitter_ms(self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Tracks the next free slot per domain.
#[derive(Debug, Clone)]
pub struct DomainThrottle {
    config: ThrottleConfig,
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl DomainThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Reserve the next slot for `domain` and sleep until it comes up.
    /// Returns how long the caller slept.
    pub async fn wait(&self, domain: &str) -> Duration {
        let now = Instant::now();
        let slot = {
            let mut slots = self.next_slot.lock().unwrap_or_else(|p| p.into_inner());
            let slot = slots.get(domain).map_or(now, |&next| next.max(now));
            slots.insert(domain.to_string(), slot + self.config.effective_delay());
            slot
        };

        let wait = slot.saturating_duration_since(now);
        if !wait.is_zero() {
            tracing::debug!(
                domain = %domain,
                sleep_ms = %wait.as_millis(),
                "Throttling request"
            );
            tokio::time::sleep_until(slot).await;
        }
        wait
    }

    /// Push the domain's next slot out by `extra`, e.g. for a robots.txt
    /// crawl delay longer than the default.
    pub fn extend(&self, domain: &str, extra: Duration) {
        let mut slots = self.next_slot.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let next = slots.entry(domain.to_string()).or_insert(now);
        *next = (*next).max(now) + extra;
    }

    pub fn forget(&self, domain: &str) {
        self.next_slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(domain);
    }

    pub fn clear(&self) {
        self.next_slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

/// Jitter in `[0, max_ms)` from an xorshift seeded by the wall clock.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
