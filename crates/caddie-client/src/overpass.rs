use std::time::Duration;

use caddie_core::config::ServiceConfig;
use caddie_core::error::AppError;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, redirect};
use serde_json::Value;
use url::form_urlencoded;

use crate::fetcher::DEFAULT_USER_AGENT;
use crate::http::{build_client, map_send_error, read_json};
use crate::weather::check_coordinates;

/// Server-side budget requested in each query, in seconds.
const QUERY_TIMEOUT_SECS: u64 = 25;

/// Amenities a golfer cares about around a course.
const AMENITIES: &str = "restaurant|cafe|bar|pub|fast_food|fuel|parking|toilets";
const LODGING: &str = "hotel|motel|guest_house|hostel";

/// Overpass API client for OpenStreetMap course and amenity lookups.
#[derive(Clone)]
pub struct OverpassClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl OverpassClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(DEFAULT_USER_AGENT, config.timeout, redirect::Policy::limited(3))?,
            endpoint: config.base_url.clone(),
            timeout: config.timeout,
        })
    }

    /// Golf course features named like `name` within `radius_m` of a point.
    /// Ways and relations come back with a `center`.
    pub async fn find_location(
        &self,
        name: &str,
        lat: f64,
        lon: f64,
        radius_m: u32,
    ) -> Result<Value, AppError> {
        check_coordinates(lat, lon)?;
        self.run(&course_query(name, lat, lon, radius_m)).await
    }

    /// Food, fuel, parking and lodging within `radius_m` of a point.
    pub async fn nearby_amenities(
        &self,
        lat: f64,
        lon: f64,
        radius_m: u32,
    ) -> Result<Value, AppError> {
        check_coordinates(lat, lon)?;
        self.run(&amenity_query(lat, lon, radius_m)).await
    }

    async fn run(&self, query: &str) -> Result<Value, AppError> {
        let body: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("data", query)
            .finish();
        tracing::debug!(endpoint = %self.endpoint, bytes = query.len(), "Overpass query");

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;
        read_json(response, self.timeout).await
    }
}

fn course_query(name: &str, lat: f64, lon: f64, radius_m: u32) -> String {
    let pattern = escape_regex(name.trim());
    let around = format!("(around:{radius_m},{lat},{lon})");
    format!(
        "[out:json][timeout:{QUERY_TIMEOUT_SECS}];\n\
         (\n  \
           way[\"leisure\"=\"golf_course\"][\"name\"~\"{pattern}\",i]{around};\n  \
           relation[\"leisure\"=\"golf_course\"][\"name\"~\"{pattern}\",i]{around};\n  \
           node[\"leisure\"=\"golf_course\"][\"name\"~\"{pattern}\",i]{around};\n\
         );\n\
         out center tags;"
    )
}

fn amenity_query(lat: f64, lon: f64, radius_m: u32) -> String {
    let around = format!("(around:{radius_m},{lat},{lon})");
    format!(
        "[out:json][timeout:{QUERY_TIMEOUT_SECS}];\n\
         (\n  \
           node[\"amenity\"~\"^({AMENITIES})$\"]{around};\n  \
           node[\"tourism\"~\"^({LODGING})$\"]{around};\n  \
           way[\"tourism\"~\"^({LODGING})$\"]{around};\n\
         );\n\
         out center tags;"
    )
}

/// Escape a course name for an Overpass regex inside a double-quoted string.
fn escape_regex(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' => {
                out.push_str("\\\\");
                out.push(c);
            }
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}
