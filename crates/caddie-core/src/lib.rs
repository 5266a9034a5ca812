pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod models;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod response;
pub mod throttle;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheKey, CacheManager, PreloadReport, TtlCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{CaddieConfig, QueueConfig, RateLimitConfig, RetryPolicy, ServiceConfig};
pub use error::AppError;
pub use models::{
    FetchMode, PriorityHint, ProcessingResult, RobotsVerdict, ScrapeOptions, ScrapeTarget,
    SourceType, compute_hash,
};
pub use queue::{JobHandle, QueueReporter, RequestQueue, TracingQueueReporter};
pub use rate_limit::{RateLimiter, ServiceLimiter};
pub use registry::{CallOptions, HealthState, ServiceRegistry};
pub use response::ApiResponse;
pub use traits::{AllowAll, Fetcher, RobotsChecker};
