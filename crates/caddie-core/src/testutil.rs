//! Test utilities: mock implementations of the queue's collaborators.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::models::{FetchMode, ProcessingResult, RobotsVerdict, ScrapeOptions, ScrapeTarget};
use crate::queue::{QueueEvent, QueueReporter};
use crate::traits::{Fetcher, RobotsChecker};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that records every call.
///
/// Each call pops the next queued response; once the queue is empty it
/// returns a page whose content names the URL.
#[derive(Clone)]
pub struct MockFetcher {
    mode: FetchMode,
    delay: Duration,
    responses: Arc<Mutex<VecDeque<Result<ProcessingResult, AppError>>>>,
    calls: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::with_mode(FetchMode::Static)
    }

    pub fn dynamic() -> Self {
        Self::with_mode(FetchMode::Dynamic)
    }

    fn with_mode(mode: FetchMode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            responses: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_responses(self, responses: Vec<Result<ProcessingResult, AppError>>) -> Self {
        *self.responses.lock().unwrap() = responses.into();
        self
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|(url, _)| url).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls().into_iter().map(|(_, at)| at).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        target: &ScrapeTarget,
        _options: &ScrapeOptions,
    ) -> Result<ProcessingResult, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((target.url.clone(), Instant::now()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(ProcessingResult::new(
                &target.url,
                format!("# {}", target.url),
                self.mode,
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// MockRobotsChecker
// ---------------------------------------------------------------------------

/// Robots checker driven by URL-prefix rules; unmatched URLs are allowed.
#[derive(Clone, Default)]
pub struct MockRobotsChecker {
    rules: Arc<Vec<(String, RobotsVerdict)>>,
    checked: Arc<Mutex<Vec<String>>>,
}

impl MockRobotsChecker {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn with_rule(self, prefix: &str, verdict: RobotsVerdict) -> Self {
        let mut rules = (*self.rules).clone();
        rules.push((prefix.to_string(), verdict));
        Self {
            rules: Arc::new(rules),
            checked: self.checked,
        }
    }

    pub fn checked(&self) -> Vec<String> {
        self.checked.lock().unwrap().clone()
    }
}

impl RobotsChecker for MockRobotsChecker {
    async fn can_scrape(&self, url: &str, _user_agent: &str) -> RobotsVerdict {
        self.checked.lock().unwrap().push(url.to_string());
        self.rules
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, verdict)| verdict.clone())
            .unwrap_or_else(RobotsVerdict::allow)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event names in order.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl QueueReporter for MockReporter {
    fn report(&self, event: QueueEvent<'_>) {
        let name = match event {
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::WorkerStarted { .. } => "worker_started",
            QueueEvent::JobStarted { .. } => "job_started",
            QueueEvent::RobotsBlocked { .. } => "robots_blocked",
            QueueEvent::CrawlDelay { .. } => "crawl_delay",
            QueueEvent::JobCompleted { .. } => "job_completed",
            QueueEvent::JobFailed { .. } => "job_failed",
            QueueEvent::ShuttingDown { .. } => "shutting_down",
            QueueEvent::WorkerStopped { .. } => "worker_stopped",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}
