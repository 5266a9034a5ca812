use std::time::Duration;

use caddie_core::config::ServiceConfig;
use caddie_core::error::AppError;
use reqwest::{Client, redirect};
use serde_json::Value;
use url::Url;

use crate::fetcher::DEFAULT_USER_AGENT;
use crate::http::{build_client, map_send_error, read_json};

/// OpenWeatherMap-compatible weather API.
///
/// Raw client: no rate limiting, breaker or caching. Wrap calls in
/// `ServiceRegistry::call` and a cache namespace for that.
#[derive(Clone)]
pub struct WeatherClient {
    client: Client,
    base_url: String,
    api_key: String,
    units: String,
    timeout: Duration,
}

impl WeatherClient {
    pub fn new(config: &ServiceConfig, api_key: impl Into<String>) -> Result<Self, AppError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError(
                "weather API key is empty (set OPENWEATHER_API_KEY)".into(),
            ));
        }

        Ok(Self {
            client: build_client(DEFAULT_USER_AGENT, config.timeout, redirect::Policy::limited(3))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            units: "metric".into(),
            timeout: config.timeout,
        })
    }

    /// `metric`, `imperial` or `standard`.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub async fn current_weather(&self, lat: f64, lon: f64) -> Result<Value, AppError> {
        self.get("weather", lat, lon).await
    }

    /// Five-day forecast in three-hour steps.
    pub async fn forecast(&self, lat: f64, lon: f64) -> Result<Value, AppError> {
        self.get("forecast", lat, lon).await
    }

    async fn get(&self, path: &str, lat: f64, lon: f64) -> Result<Value, AppError> {
        let url = self.endpoint(path, lat, lon)?;
        tracing::debug!(path, lat, lon, "Weather request");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;
        read_json(response, self.timeout).await
    }

    fn endpoint(&self, path: &str, lat: f64, lon: f64) -> Result<Url, AppError> {
        check_coordinates(lat, lon)?;
        let mut url = Url::parse(&format!("{}/{path}", self.base_url))
            .map_err(|e| AppError::ConfigError(format!("Invalid weather base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("lat", &lat.to_string())
            .append_pair("lon", &lon.to_string())
            .append_pair("units", &self.units)
            .append_pair("appid", &self.api_key);
        Ok(url)
    }
}

pub(crate) fn check_coordinates(lat: f64, lon: f64) -> Result<(), AppError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(AppError::Generic(format!(
            "Coordinates out of range: {lat}, {lon}"
        )));
    }
    Ok(())
}
