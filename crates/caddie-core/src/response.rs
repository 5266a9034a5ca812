use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;

/// Outcome of one guarded call, returned by the registry and the cache.
///
/// Failures are carried in `result` rather than raised so callers can look
/// at [`ApiResponse::retryable`] and decide whether to try again.
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub result: Result<T, AppError>,
    /// Served from the cache without touching the upstream.
    pub cached: bool,
    pub request_id: Uuid,
    pub processing_time_ms: u64,
    /// Admission slots left in the service's current window.
    pub remaining_requests: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl<T> ApiResponse<T> {
    pub fn new(result: Result<T, AppError>, request_id: Uuid) -> Self {
        Self {
            result,
            cached: false,
            request_id,
            processing_time_ms: 0,
            remaining_requests: None,
            reset_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// False for successes and for failures not worth retrying.
    pub fn retryable(&self) -> bool {
        self.result.as_ref().err().is_some_and(AppError::is_retryable)
    }

    pub fn data(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&AppError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, AppError> {
        self.result
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            result: self.result.map(f),
            cached: self.cached,
            request_id: self.request_id,
            processing_time_ms: self.processing_time_ms,
            remaining_requests: self.remaining_requests,
            reset_at: self.reset_at,
        }
    }
}
