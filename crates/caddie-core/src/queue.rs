//! Priority queue for website scrape jobs.
//!
//! Jobs are ordered by priority, then by arrival. A fixed pool of workers
//! pulls from the queue and, per target domain, applies a rate limiter,
//! robots.txt rules, politeness spacing and a circuit breaker before handing
//! the target to a fetcher. Failed attempts are retried with exponential
//! backoff unless the error says retrying is pointless.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{QueueConfig, RetryPolicy};
use crate::error::AppError;
use crate::models::{FetchMode, ProcessingResult, ScrapeOptions, ScrapeTarget, domain_key};
use crate::rate_limit::RateLimiter;
use crate::throttle::{DomainThrottle, ThrottleConfig};
use crate::traits::{Fetcher, RobotsChecker};

type JobResult = Result<ProcessingResult, AppError>;

/// Events emitted by the queue for monitoring/logging.
#[derive(Debug, Clone)]
pub enum QueueEvent<'a> {
    Enqueued {
        job_id: Uuid,
        url: &'a str,
        priority: u8,
        depth: usize,
    },
    WorkerStarted {
        worker: usize,
    },
    JobStarted {
        job_id: Uuid,
        url: &'a str,
        attempt: u32,
    },
    RobotsBlocked {
        job_id: Uuid,
        url: &'a str,
        reason: &'a str,
    },
    CrawlDelay {
        domain: &'a str,
        extra: Duration,
    },
    JobCompleted {
        job_id: Uuid,
        url: &'a str,
        fetch_mode: FetchMode,
        elapsed: Duration,
    },
    JobFailed {
        job_id: Uuid,
        url: &'a str,
        error: &'a str,
        retry_in: Option<Duration>,
    },
    ShuttingDown {
        abandoned: usize,
    },
    WorkerStopped {
        worker: usize,
    },
}

/// Trait for receiving queue events (decoupled logging).
pub trait QueueReporter: Send + Sync + 'static {
    fn report(&self, event: QueueEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingQueueReporter;

impl QueueReporter for TracingQueueReporter {
    fn report(&self, event: QueueEvent<'_>) {
        match event {
            QueueEvent::Enqueued {
                job_id,
                url,
                priority,
                depth,
            } => {
                tracing::debug!(%job_id, %url, %priority, %depth, "Job enqueued");
            }
            QueueEvent::WorkerStarted { worker } => {
                tracing::debug!(%worker, "Queue worker started");
            }
            QueueEvent::JobStarted {
                job_id,
                url,
                attempt,
            } => {
                tracing::info!(%job_id, %url, %attempt, "Processing job");
            }
            QueueEvent::RobotsBlocked {
                job_id,
                url,
                reason,
            } => {
                tracing::warn!(%job_id, %url, %reason, "Blocked by robots.txt");
            }
            QueueEvent::CrawlDelay { domain, extra } => {
                tracing::debug!(%domain, extra_ms = %extra.as_millis(), "Honouring robots crawl delay");
            }
            QueueEvent::JobCompleted {
                job_id,
                url,
                fetch_mode,
                elapsed,
            } => {
                tracing::info!(
                    %job_id,
                    %url,
                    ?fetch_mode,
                    elapsed_ms = %elapsed.as_millis(),
                    "Job completed"
                );
            }
            QueueEvent::JobFailed {
                job_id,
                url,
                error,
                retry_in,
            } => match retry_in {
                Some(delay) => tracing::warn!(
                    %job_id,
                    %url,
                    %error,
                    retry_in_ms = %delay.as_millis(),
                    "Job failed, will retry"
                ),
                None => tracing::warn!(%job_id, %url, %error, "Job failed"),
            },
            QueueEvent::ShuttingDown { abandoned } => {
                tracing::info!(%abandoned, "Queue shutting down");
            }
            QueueEvent::WorkerStopped { worker } => {
                tracing::debug!(%worker, "Queue worker stopped");
            }
        }
    }
}

/// Whether a failed attempt is worth another try.
///
/// Policy violations, missing or forbidden pages, bad URLs and
/// configuration mistakes will fail the same way again.
pub fn should_retry(error: &AppError) -> bool {
    match error {
        AppError::RobotsDisallowed { .. }
        | AppError::InvalidUrl(_)
        | AppError::ConfigError(_)
        | AppError::QueueClosed => false,
        AppError::HttpStatus { status, .. } => !matches!(status, 403 | 404),
        _ => true,
    }
}

/// Caller's handle on an enqueued job.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    url: String,
    receiver: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for the job's final outcome, after any retries.
    pub async fn wait(self) -> JobResult {
        self.receiver.await.unwrap_or(Err(AppError::QueueClosed))
    }
}

struct QueuedRequest {
    id: Uuid,
    seq: u64,
    priority: u8,
    target: ScrapeTarget,
    options: ScrapeOptions,
    domain: String,
    retry_count: u32,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    completion: oneshot::Sender<JobResult>,
}

impl QueuedRequest {
    fn resolve(self, result: JobResult) {
        // The caller may have dropped its handle.
        let _ = self.completion.send(result);
    }
}

// Max-heap: higher priority first, then lower sequence number (FIFO).
impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

/// Per-domain request statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_time_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    timed_requests: u64,
}

impl DomainStats {
    fn record(&mut self, success: bool, elapsed: Option<Duration>) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if let Some(elapsed) = elapsed {
            self.timed_requests += 1;
            let sample = elapsed.as_secs_f64() * 1000.0;
            self.avg_response_time_ms +=
                (sample - self.avg_response_time_ms) / self.timed_requests as f64;
        }
        self.last_request_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub waiting_retry: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub domains: BTreeMap<String, DomainStats>,
}

#[derive(Clone)]
struct DomainGuards {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

#[derive(Default)]
struct Pending {
    heap: BinaryHeap<QueuedRequest>,
    closed: bool,
}

struct QueueInner<S, D, R, Rep> {
    config: QueueConfig,
    retry: RetryPolicy,
    static_fetcher: S,
    dynamic_fetcher: D,
    robots: R,
    reporter: Rep,
    pending: Mutex<Pending>,
    notify: Notify,
    next_seq: AtomicU64,
    guards: Mutex<HashMap<String, DomainGuards>>,
    domain_stats: Mutex<HashMap<String, DomainStats>>,
    throttle: DomainThrottle,
    processing: AtomicUsize,
    waiting_retry: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

/// Priority scrape queue with a bounded worker pool.
///
/// `S` fetches plain pages, `D` renders JavaScript-heavy ones.
pub struct RequestQueue<S, D, R, Rep = TracingQueueReporter> {
    inner: Arc<QueueInner<S, D, R, Rep>>,
}

impl<S, D, R, Rep> Clone for RequestQueue<S, D, R, Rep> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, D, R, Rep> RequestQueue<S, D, R, Rep>
where
    S: Fetcher,
    D: Fetcher,
    R: RobotsChecker,
    Rep: QueueReporter,
{
    pub fn new(
        config: QueueConfig,
        static_fetcher: S,
        dynamic_fetcher: D,
        robots: R,
        reporter: Rep,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let throttle = DomainThrottle::new(
            ThrottleConfig::new(config.default_crawl_delay).with_jitter(config.jitter),
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                retry: config.retry_policy(),
                config,
                static_fetcher,
                dynamic_fetcher,
                robots,
                reporter,
                pending: Mutex::new(Pending::default()),
                notify: Notify::new(),
                next_seq: AtomicU64::new(0),
                guards: Mutex::new(HashMap::new()),
                domain_stats: Mutex::new(HashMap::new()),
                throttle,
                processing: AtomicUsize::new(0),
                waiting_retry: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Add a target. Jobs may be enqueued before [`RequestQueue::start`].
    pub fn enqueue(
        &self,
        target: ScrapeTarget,
        options: ScrapeOptions,
    ) -> Result<JobHandle, AppError> {
        let domain = domain_key(&target.url)?;
        let (completion, receiver) = oneshot::channel();
        let now = Utc::now();
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            priority: target.priority_score(),
            domain,
            retry_count: 0,
            created_at: now,
            scheduled_at: now,
            completion,
            target,
            options,
        };
        let handle = JobHandle {
            id: request.id,
            url: request.target.url.clone(),
            receiver,
        };

        let (priority, depth) = (request.priority, self.inner.push(request)?);
        self.inner.reporter.report(QueueEvent::Enqueued {
            job_id: handle.id,
            url: &handle.url,
            priority,
            depth,
        });
        Ok(handle)
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = lock(&self.inner.workers);
        if !workers.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }
        for worker in 0..self.inner.config.max_concurrent_requests {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move { inner.worker_loop(worker).await }));
        }
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.inner.workers).is_empty() && !self.inner.shutdown.is_cancelled()
    }

    /// Jobs waiting for a worker.
    pub fn len(&self) -> usize {
        lock(&self.inner.pending).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let completed = self.inner.completed.load(Ordering::Relaxed);
        let failed = self.inner.failed.load(Ordering::Relaxed);
        let finished = completed + failed;

        QueueStats {
            pending: self.len(),
            waiting_retry: self.inner.waiting_retry.load(Ordering::Relaxed),
            processing: self.inner.processing.load(Ordering::Relaxed),
            completed,
            failed,
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
            domains: lock(&self.inner.domain_stats)
                .iter()
                .map(|(domain, stats)| (domain.clone(), stats.clone()))
                .collect(),
        }
    }

    pub fn domain_stats(&self, domain: &str) -> Option<DomainStats> {
        lock(&self.inner.domain_stats).get(domain).cloned()
    }

    pub fn reset_domain_stats(&self) {
        lock(&self.inner.domain_stats).clear();
    }

    /// Stop the workers. Jobs still queued or waiting to retry resolve
    /// with [`AppError::QueueClosed`].
    pub async fn shutdown(&self) {
        let abandoned = {
            let mut pending = lock(&self.inner.pending);
            pending.closed = true;
            pending.heap.drain().collect::<Vec<_>>()
        };
        self.inner.shutdown.cancel();

        self.inner.reporter.report(QueueEvent::ShuttingDown {
            abandoned: abandoned.len(),
        });
        for request in abandoned {
            request.resolve(Err(AppError::QueueClosed));
        }

        let workers: Vec<_> = lock(&self.inner.workers).drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl<S, D, R, Rep> QueueInner<S, D, R, Rep>
where
    S: Fetcher,
    D: Fetcher,
    R: RobotsChecker,
    Rep: QueueReporter,
{
    /// Returns the new depth.
    fn push(&self, request: QueuedRequest) -> Result<usize, AppError> {
        let depth = {
            let mut pending = lock(&self.pending);
            if pending.closed {
                drop(pending);
                request.resolve(Err(AppError::QueueClosed));
                return Err(AppError::QueueClosed);
            }
            pending.heap.push(request);
            pending.heap.len()
        };
        self.notify.notify_one();
        Ok(depth)
    }

    fn pop(&self) -> Option<QueuedRequest> {
        lock(&self.pending).heap.pop()
    }

    fn guards_for(&self, domain: &str) -> DomainGuards {
        lock(&self.guards)
            .entry(domain.to_string())
            .or_insert_with(|| DomainGuards {
                limiter: RateLimiter::per_minute(domain, self.config.domain_requests_per_minute),
                breaker: CircuitBreaker::new(
                    format!("domain:{domain}"),
                    self.config.domain_circuit_breaker.clone(),
                ),
            })
            .clone()
    }

    fn record(&self, domain: &str, success: bool, elapsed: Option<Duration>) {
        lock(&self.domain_stats)
            .entry(domain.to_string())
            .or_default()
            .record(success, elapsed);
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        self.reporter.report(QueueEvent::WorkerStarted { worker });

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.pop() {
                Some(request) => {
                    self.processing.fetch_add(1, Ordering::Relaxed);
                    let outcome = tokio::select! {
                        result = self.attempt(&request) => Some(result),
                        () = self.shutdown.cancelled() => None,
                    };
                    self.processing.fetch_sub(1, Ordering::Relaxed);

                    match outcome {
                        Some(result) => self.settle(request, result),
                        None => request.resolve(Err(AppError::QueueClosed)),
                    }
                }
                None => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.reporter.report(QueueEvent::WorkerStopped { worker });
    }

    /// One pass through the domain's protections and a fetcher.
    async fn attempt(&self, request: &QueuedRequest) -> JobResult {
        let QueuedRequest {
            id, target, domain, ..
        } = request;
        let options = &request.options;

        self.reporter.report(QueueEvent::JobStarted {
            job_id: *id,
            url: &target.url,
            attempt: request.retry_count + 1,
        });

        let guards = self.guards_for(domain);
        guards.limiter.acquire().await;

        let user_agent = options
            .user_agent
            .as_deref()
            .unwrap_or(&self.config.user_agent);
        let verdict = self.robots.can_scrape(&target.url, user_agent).await;
        if !verdict.allowed {
            let reason = verdict
                .reason
                .unwrap_or_else(|| "disallowed for this user agent".into());
            self.reporter.report(QueueEvent::RobotsBlocked {
                job_id: *id,
                url: &target.url,
                reason: &reason,
            });
            self.record(domain, false, None);
            return Err(AppError::RobotsDisallowed {
                url: target.url.clone(),
                reason,
            });
        }

        if let Some(crawl_delay) = verdict.crawl_delay
            && crawl_delay > self.config.default_crawl_delay
        {
            let extra = crawl_delay - self.config.default_crawl_delay;
            self.reporter
                .report(QueueEvent::CrawlDelay { domain, extra });
            self.throttle.extend(domain, extra);
        }
        self.throttle.wait(domain).await;

        let mode = FetchMode::for_target(target, options);
        let timeout = options.timeout;
        let started = Instant::now();
        let result = guards
            .breaker
            .call(|| async {
                let fetch = async {
                    match mode {
                        FetchMode::Static => self.static_fetcher.fetch(target, options).await,
                        FetchMode::Dynamic => self.dynamic_fetcher.fetch(target, options).await,
                    }
                };
                match tokio::time::timeout(timeout, fetch).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Timeout(timeout.as_millis() as u64)),
                }
            })
            .await
            .map_err(AppError::from);

        let elapsed = started.elapsed();
        let fetched = !matches!(result, Err(AppError::CircuitOpen { .. }));
        self.record(domain, result.is_ok(), fetched.then_some(elapsed));

        result.map(|page| {
            if page.processing_time_ms == 0 {
                page.with_processing_time(elapsed)
            } else {
                page
            }
        })
    }

    fn settle(self: &Arc<Self>, mut request: QueuedRequest, result: JobResult) {
        let error = match result {
            Ok(page) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.reporter.report(QueueEvent::JobCompleted {
                    job_id: request.id,
                    url: &request.target.url,
                    fetch_mode: page.fetch_mode,
                    elapsed: Duration::from_millis(page.processing_time_ms),
                });
                request.resolve(Ok(page));
                return;
            }
            Err(error) => error,
        };

        let retry_in = (should_retry(&error) && request.retry_count < self.retry.max_retries)
            .then(|| self.retry.delay_for_attempt(request.retry_count + 1));

        let message = error.to_string();
        self.reporter.report(QueueEvent::JobFailed {
            job_id: request.id,
            url: &request.target.url,
            error: &message,
            retry_in,
        });

        match retry_in {
            Some(delay) => {
                request.retry_count += 1;
                self.schedule_retry(request, delay);
            }
            None => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                request.resolve(Err(error));
            }
        }
    }

    /// Put the request back after `delay` without holding a worker.
    fn schedule_retry(self: &Arc<Self>, mut request: QueuedRequest, delay: Duration) {
        self.waiting_retry.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let slept = tokio::select! {
                () = tokio::time::sleep(delay) => true,
                () = inner.shutdown.cancelled() => false,
            };
            inner.waiting_retry.fetch_sub(1, Ordering::Relaxed);

            if !slept {
                request.resolve(Err(AppError::QueueClosed));
                return;
            }
            request.seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
            request.scheduled_at = Utc::now();
            tracing::debug!(
                job_id = %request.id,
                retry = request.retry_count,
                queued_for_ms = (request.scheduled_at - request.created_at).num_milliseconds(),
                "Re-queueing job"
            );
            // A closed queue resolves the job itself.
            let _ = inner.push(request);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PriorityHint, RobotsVerdict, SourceType};
    use crate::testutil::{MockFetcher, MockReporter, MockRobotsChecker};
    use crate::traits::AllowAll;

    type TestQueue<R = AllowAll> = RequestQueue<MockFetcher, MockFetcher, R, MockReporter>;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_max_concurrent(1)
            .with_crawl_delay(Duration::ZERO)
            .with_retry_delays(Duration::from_secs(1), Duration::from_secs(60))
    }

    fn queue_with<R: RobotsChecker>(
        config: QueueConfig,
        fetcher: MockFetcher,
        dynamic: MockFetcher,
        robots: R,
    ) -> TestQueue<R> {
        RequestQueue::new(config, fetcher, dynamic, robots, MockReporter::default()).unwrap()
    }

    fn queue(config: QueueConfig, fetcher: MockFetcher) -> TestQueue {
        queue_with(config, fetcher, MockFetcher::dynamic(), AllowAll)
    }

    fn target(url: &str, priority: PriorityHint) -> ScrapeTarget {
        ScrapeTarget::new(url).with_priority(priority)
    }

    #[test]
    fn test_should_retry_classification() {
        assert!(!should_retry(&AppError::RobotsDisallowed {
            url: "u".into(),
            reason: "r".into()
        }));
        assert!(!should_retry(&AppError::HttpStatus {
            status: 404,
            message: String::new()
        }));
        assert!(!should_retry(&AppError::HttpStatus {
            status: 403,
            message: String::new()
        }));
        assert!(!should_retry(&AppError::InvalidUrl("x".into())));
        assert!(!should_retry(&AppError::ConfigError("x".into())));
        assert!(should_retry(&AppError::HttpStatus {
            status: 500,
            message: String::new()
        }));
        assert!(should_retry(&AppError::Timeout(10)));
        assert!(should_retry(&AppError::NetworkError("reset".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_in_priority_order() {
        let fetcher = MockFetcher::new();
        let queue = queue(config(), fetcher.clone());

        let handles = vec![
            queue
                .enqueue(target("https://a.test/low", PriorityHint::Low), ScrapeOptions::default())
                .unwrap(),
            queue
                .enqueue(target("https://b.test/high", PriorityHint::High), ScrapeOptions::default())
                .unwrap(),
            queue
                .enqueue(
                    target("https://c.test/medium", PriorityHint::Medium),
                    ScrapeOptions::default(),
                )
                .unwrap(),
        ];
        queue.start();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(
            fetcher.urls(),
            vec!["https://b.test/high", "https://c.test/medium", "https://a.test/low"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_official_boost_and_fifo_within_tier() {
        let fetcher = MockFetcher::new();
        let queue = queue(config(), fetcher.clone());

        let mut handles = Vec::new();
        for url in ["https://a.test/1", "https://b.test/2"] {
            handles.push(
                queue
                    .enqueue(target(url, PriorityHint::Medium), ScrapeOptions::default())
                    .unwrap(),
            );
        }
        // medium + official (7) outranks plain medium (5), not high (8).
        handles.push(
            queue
                .enqueue(
                    target("https://c.test/official", PriorityHint::Medium)
                        .with_source_type(SourceType::Official),
                    ScrapeOptions::default(),
                )
                .unwrap(),
        );
        handles.push(
            queue
                .enqueue(target("https://d.test/high", PriorityHint::High), ScrapeOptions::default())
                .unwrap(),
        );

        queue.start();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(
            fetcher.urls(),
            vec![
                "https://d.test/high",
                "https://c.test/official",
                "https://a.test/1",
                "https://b.test/2",
            ]
        );
    }

    #[test]
    fn test_enqueue_rejects_invalid_url() {
        let queue = queue(config(), MockFetcher::new());
        let result = queue.enqueue(ScrapeTarget::new("ftp://example.com"), ScrapeOptions::default());
        assert!(matches!(result, Err(AppError::InvalidUrl(_))));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_robots_disallowed_never_fetches() {
        let fetcher = MockFetcher::new();
        let robots = MockRobotsChecker::allow_all()
            .with_rule("https://private.test/", RobotsVerdict::deny("Disallow: /"));
        let queue = queue_with(config(), fetcher.clone(), MockFetcher::dynamic(), robots.clone());
        queue.start();

        let result = queue
            .enqueue(ScrapeTarget::new("https://private.test/members"), ScrapeOptions::default())
            .unwrap()
            .wait()
            .await;

        assert!(matches!(result, Err(AppError::RobotsDisallowed { .. })));
        assert_eq!(fetcher.call_count(), 0);
        assert_eq!(robots.checked(), vec!["https://private.test/members"]);
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(queue.stats().domains["private.test"].failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_backoff() {
        let unavailable = || {
            Err(AppError::HttpStatus {
                status: 503,
                message: "unavailable".into(),
            })
        };
        let fetcher = MockFetcher::new().with_responses(vec![unavailable(), unavailable()]);
        let queue = queue(config(), fetcher.clone());
        queue.start();

        let page = queue
            .enqueue(ScrapeTarget::new("https://flaky.test/"), ScrapeOptions::default())
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(page.url, "https://flaky.test/");
        let times = fetcher.call_times();
        assert_eq!(times.len(), 3);
        assert_eq!(times[1] - times[0], Duration::from_secs(2));
        assert_eq!(times[2] - times[1], Duration::from_secs(4));

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.domains["flaky.test"].requests, 3);
        assert_eq!(stats.domains["flaky.test"].successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let fetcher = MockFetcher::new().with_responses(vec![Err(AppError::HttpStatus {
            status: 404,
            message: "gone".into(),
        })]);
        let queue = queue(config(), fetcher.clone());
        queue.start();

        let result = queue
            .enqueue(ScrapeTarget::new("https://a.test/missing"), ScrapeOptions::default())
            .unwrap()
            .wait()
            .await;

        assert!(matches!(result, Err(AppError::HttpStatus { status: 404, .. })));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_resolve_with_last_error() {
        let fetcher = MockFetcher::new().with_responses(
            (0..3)
                .map(|_| Err(AppError::NetworkError("connection reset".into())))
                .collect(),
        );
        let queue = queue(config().with_max_retries(2), fetcher.clone());
        queue.start();

        let result = queue
            .enqueue(ScrapeTarget::new("https://down.test/"), ScrapeOptions::default())
            .unwrap()
            .wait()
            .await;

        assert!(matches!(result, Err(AppError::NetworkError(_))));
        assert_eq!(fetcher.call_count(), 3);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_hold_worker() {
        let fetcher = MockFetcher::new().with_responses(vec![Err(AppError::Timeout(5))]);
        let queue = queue(config(), fetcher.clone());

        let flaky = queue
            .enqueue(ScrapeTarget::new("https://flaky.test/"), ScrapeOptions::default())
            .unwrap();
        let steady = queue
            .enqueue(ScrapeTarget::new("https://steady.test/"), ScrapeOptions::default())
            .unwrap();
        queue.start();

        steady.wait().await.unwrap();
        // The steady job finished while the flaky one sat out its backoff.
        assert_eq!(queue.stats().waiting_retry, 1);
        flaky.wait().await.unwrap();
        assert_eq!(
            fetcher.urls(),
            vec!["https://flaky.test/", "https://steady.test/", "https://flaky.test/"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_retried() {
        let fetcher = MockFetcher::new().with_delay(Duration::from_secs(10));
        let queue = queue(config().with_max_retries(1), fetcher.clone());
        queue.start();

        let result = queue
            .enqueue(
                ScrapeTarget::new("https://slow.test/"),
                ScrapeOptions::default().with_timeout(Duration::from_secs(1)),
            )
            .unwrap()
            .wait()
            .await;

        assert!(matches!(result, Err(AppError::Timeout(1000))));
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_javascript_targets_use_dynamic_fetcher() {
        let fetcher = MockFetcher::new();
        let dynamic = MockFetcher::dynamic();
        let queue = queue_with(config(), fetcher.clone(), dynamic.clone(), AllowAll);
        queue.start();

        let page = queue
            .enqueue(
                ScrapeTarget::new("https://spa.test/").requiring_javascript(),
                ScrapeOptions::default(),
            )
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(page.fetch_mode, FetchMode::Dynamic);
        assert_eq!(dynamic.call_count(), 1);
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_domain_requests_are_spaced() {
        let fetcher = MockFetcher::new();
        let queue = queue(
            config()
                .with_max_concurrent(2)
                .with_crawl_delay(Duration::from_secs(1)),
            fetcher.clone(),
        );
        let a = queue
            .enqueue(ScrapeTarget::new("https://course.test/a"), ScrapeOptions::default())
            .unwrap();
        let b = queue
            .enqueue(ScrapeTarget::new("https://course.test/b"), ScrapeOptions::default())
            .unwrap();
        let other = queue
            .enqueue(ScrapeTarget::new("https://other.test/"), ScrapeOptions::default())
            .unwrap();
        queue.start();
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        other.wait().await.unwrap();

        let calls = fetcher.calls();
        let course: Vec<_> = calls
            .iter()
            .filter(|(url, _)| url.contains("course.test"))
            .map(|(_, at)| *at)
            .collect();
        assert!(course[1] - course[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_robots_crawl_delay_extends_spacing() {
        let fetcher = MockFetcher::new();
        let robots = MockRobotsChecker::allow_all().with_rule(
            "https://slow.test/",
            RobotsVerdict::allow().with_crawl_delay(Duration::from_secs(5)),
        );
        let queue = queue_with(
            config().with_crawl_delay(Duration::from_secs(1)),
            fetcher.clone(),
            MockFetcher::dynamic(),
            robots,
        );
        queue.start();

        for path in ["a", "b"] {
            queue
                .enqueue(
                    ScrapeTarget::new(format!("https://slow.test/{path}")),
                    ScrapeOptions::default(),
                )
                .unwrap()
                .wait()
                .await
                .unwrap();
        }

        let times = fetcher.call_times();
        assert!(times[1] - times[0] >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_domain_rate_limit_applies() {
        let fetcher = MockFetcher::new();
        let mut config = config();
        config.domain_requests_per_minute = 1;
        let queue = queue(config, fetcher.clone());
        queue.start();

        for path in ["a", "b"] {
            queue
                .enqueue(
                    ScrapeTarget::new(format!("https://limited.test/{path}")),
                    ScrapeOptions::default(),
                )
                .unwrap()
                .wait()
                .await
                .unwrap();
        }

        let times = fetcher.call_times();
        assert!(times[1] - times[0] >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_resolves_queued_jobs() {
        let fetcher = MockFetcher::new();
        let queue = queue(config(), fetcher.clone());
        let handle = queue
            .enqueue(ScrapeTarget::new("https://a.test/"), ScrapeOptions::default())
            .unwrap();

        queue.shutdown().await;

        assert!(matches!(handle.wait().await, Err(AppError::QueueClosed)));
        assert!(matches!(
            queue.enqueue(ScrapeTarget::new("https://a.test/"), ScrapeOptions::default()),
            Err(AppError::QueueClosed)
        ));
        assert_eq!(fetcher.call_count(), 0);
        assert!(!queue.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retry() {
        let fetcher = MockFetcher::new().with_responses(vec![Err(AppError::Timeout(1))]);
        let queue = queue(config(), fetcher.clone());
        queue.start();
        let handle = queue
            .enqueue(ScrapeTarget::new("https://a.test/"), ScrapeOptions::default())
            .unwrap();

        while queue.stats().waiting_retry == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.shutdown().await;

        assert!(matches!(handle.wait().await, Err(AppError::QueueClosed)));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_domain_stats_and_events() {
        let reporter = MockReporter::default();
        let queue = RequestQueue::new(
            config(),
            MockFetcher::new(),
            MockFetcher::dynamic(),
            AllowAll,
            reporter.clone(),
        )
        .unwrap();
        queue.start();
        queue
            .enqueue(ScrapeTarget::new("https://a.test/"), ScrapeOptions::default())
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(queue.domain_stats("a.test").is_some());
        queue.reset_domain_stats();
        assert!(queue.stats().domains.is_empty());
        assert_eq!(queue.stats().completed, 1);

        let events = reporter.events();
        assert!(events.contains(&"enqueued".to_string()));
        assert!(events.contains(&"job_completed".to_string()));
        queue.shutdown().await;
    }
}
