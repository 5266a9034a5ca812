use std::time::Duration;

use caddie_core::config::ServiceConfig;
use caddie_core::error::AppError;
use reqwest::{Client, redirect};
use serde_json::Value;
use url::Url;

use crate::fetcher::DEFAULT_USER_AGENT;
use crate::http::{build_client, map_send_error, read_json};

const SEARCH_LIMIT: u32 = 5;

/// MediaWiki action API client for course background articles.
#[derive(Clone)]
pub struct WikipediaClient {
    client: Client,
    api_url: Url,
    timeout: Duration,
}

impl WikipediaClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, AppError> {
        let api_url = Url::parse(&config.base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid Wikipedia API URL: {e}")))?;

        Ok(Self {
            client: build_client(DEFAULT_USER_AGENT, config.timeout, redirect::Policy::limited(3))?,
            api_url,
            timeout: config.timeout,
        })
    }

    /// Full-text search for a course, optionally narrowed by town or region.
    pub async fn search(&self, name: &str, location: Option<&str>) -> Result<Value, AppError> {
        self.query(&search_params(name, location)).await
    }

    /// Plain-text lead section, coordinates and thumbnail of one article.
    /// Redirects are followed, so a search hit's title can be passed as-is.
    pub async fn extract(&self, title: &str) -> Result<Value, AppError> {
        let params = [
            ("action", "query"),
            ("prop", "extracts|coordinates|pageimages|info"),
            ("exintro", "1"),
            ("explaintext", "1"),
            ("inprop", "url"),
            ("piprop", "thumbnail"),
            ("pithumbsize", "400"),
            ("redirects", "1"),
            ("format", "json"),
            ("formatversion", "2"),
            ("titles", title),
        ];
        self.query(&params).await
    }

    async fn query<K, V>(&self, params: &[(K, V)]) -> Result<Value, AppError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut url = self.api_url.clone();
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
        tracing::debug!(url = %url, "Wikipedia request");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;
        let body = read_json(response, self.timeout).await?;

        // The action API reports failures with a 200 and an `error` object.
        if let Some(error) = body.get("error") {
            let code = error["code"].as_str().unwrap_or("unknown");
            let info = error["info"].as_str().unwrap_or_default();
            return Err(AppError::Generic(format!("Wikipedia API error {code}: {info}")));
        }
        Ok(body)
    }
}

fn search_params<'a>(name: &'a str, location: Option<&'a str>) -> Vec<(&'a str, String)> {
    let mut term = format!("{} golf", name.trim());
    if let Some(location) = location.map(str::trim).filter(|l| !l.is_empty()) {
        term.push(' ');
        term.push_str(location);
    }

    vec![
        ("action", "query".into()),
        ("list", "search".into()),
        ("srsearch", term),
        ("srlimit", SEARCH_LIMIT.to_string()),
        ("format", "json".into()),
        ("formatversion", "2".into()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_term_includes_location() {
        let params = search_params("Royal Dornoch", Some(" Sutherland "));
        let term = &params.iter().find(|(k, _)| *k == "srsearch").unwrap().1;
        assert_eq!(term, "Royal Dornoch golf Sutherland");
    }

    #[test]
    fn test_search_term_without_location() {
        let params = search_params("Carnoustie", Some(""));
        let term = &params.iter().find(|(k, _)| *k == "srsearch").unwrap().1;
        assert_eq!(term, "Carnoustie golf");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let config = ServiceConfig::new("wikipedia", "not a url");
        assert!(matches!(
            WikipediaClient::new(&config),
            Err(AppError::ConfigError(_))
        ));
    }
}
