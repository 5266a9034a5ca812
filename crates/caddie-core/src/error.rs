use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Caddie.
#[derive(Error, Debug)]
pub enum AppError {
    /// The requested service name was never registered.
    #[error("Service '{0}' is not registered")]
    UnregisteredService(String),

    /// The service's rate limiter could not admit the call in time.
    #[error("Rate limit exceeded for '{service}', retry after {}ms", .retry_after.as_millis())]
    RateLimitExceeded {
        service: String,
        retry_after: Duration,
    },

    /// The circuit breaker rejected the call without invoking it.
    #[error("Circuit breaker '{name}' is open, retry after {}s", .retry_after.as_secs())]
    CircuitOpen { name: String, retry_after: Duration },

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// Remote answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// robots.txt forbids fetching this URL.
    #[error("Disallowed by robots.txt: {url} ({reason})")]
    RobotsDisallowed { url: String, reason: String },

    /// A cache-fronted fetch failed.
    #[error("Cache fetch failed: {message}")]
    CacheFetch { message: String, retryable: bool },

    /// URL could not be parsed or has no host.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The request queue is shut down.
    #[error("Request queue is closed")]
    QueueClosed,

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Stable, low-cardinality label for an [`AppError`], used in stats and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnregisteredService,
    RateLimitExceeded,
    CircuitOpen,
    Network,
    Timeout,
    HttpServer,
    HttpClient,
    RobotsDisallowed,
    CacheFetch,
    InvalidUrl,
    QueueClosed,
    Config,
    Serialization,
    Other,
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded { .. } => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            AppError::CacheFetch { retryable, .. } => *retryable,
            AppError::Generic(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("reset")
                    || msg.contains("rate limit")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against a circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded { .. } => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            AppError::Generic(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::UnregisteredService(_) => ErrorKind::UnregisteredService,
            AppError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            AppError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AppError::NetworkError(_) => ErrorKind::Network,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::HttpStatus { status, .. } if *status >= 500 => ErrorKind::HttpServer,
            AppError::HttpStatus { .. } => ErrorKind::HttpClient,
            AppError::RobotsDisallowed { .. } => ErrorKind::RobotsDisallowed,
            AppError::CacheFetch { .. } => ErrorKind::CacheFetch,
            AppError::InvalidUrl(_) => ErrorKind::InvalidUrl,
            AppError::QueueClosed => ErrorKind::QueueClosed,
            AppError::ConfigError(_) => ErrorKind::Config,
            AppError::SerializationError(_) => ErrorKind::Serialization,
            AppError::Generic(_) => ErrorKind::Other,
        }
    }

    /// Recover an owned error from one shared between concurrent waiters.
    ///
    /// The sole owner gets the original back; anyone else gets a
    /// [`AppError::CacheFetch`] that keeps the message and retryability.
    pub fn from_shared(error: Arc<AppError>) -> AppError {
        Arc::try_unwrap(error).unwrap_or_else(|shared| AppError::CacheFetch {
            message: shared.to_string(),
            retryable: shared.is_retryable(),
        })
    }
}
