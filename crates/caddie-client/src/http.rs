//! Shared reqwest plumbing: client construction and error mapping.

use std::time::Duration;

use caddie_core::error::AppError;
use reqwest::{Client, Response, redirect};
use serde_json::Value;

/// Longest slice of an error body kept in `AppError::HttpStatus`.
const ERROR_BODY_LIMIT: usize = 200;

pub(crate) fn build_client(
    user_agent: &str,
    timeout: Duration,
    redirects: redirect::Policy,
) -> Result<Client, AppError> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(redirects)
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

/// Map a transport error onto the retry taxonomy.
pub(crate) fn map_send_error(error: reqwest::Error, timeout: Duration) -> AppError {
    if error.is_timeout() {
        AppError::Timeout(timeout.as_millis() as u64)
    } else if error.is_connect() {
        AppError::NetworkError(format!("Connection failed: {error}"))
    } else {
        AppError::NetworkError(error.to_string())
    }
}

/// Turn a non-2xx response into `AppError::HttpStatus`.
pub(crate) async fn ensure_success(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let detail: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
    let message = if detail.is_empty() {
        format!(
            "{} for {url}",
            status.canonical_reason().unwrap_or("request failed")
        )
    } else {
        format!("{detail} ({url})")
    };

    Err(AppError::HttpStatus {
        status: status.as_u16(),
        message,
    })
}

/// Read a successful response body as JSON.
pub(crate) async fn read_json(response: Response, timeout: Duration) -> Result<Value, AppError> {
    let response = ensure_success(response).await?;
    let body = response
        .text()
        .await
        .map_err(|e| map_send_error(e, timeout))?;
    Ok(serde_json::from_str(&body)?)
}
