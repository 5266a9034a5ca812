//! robots.txt compliance backed by the `robotstxt` matcher.

use std::sync::Arc;
use std::time::Duration;

use caddie_core::error::AppError;
use caddie_core::models::RobotsVerdict;
use caddie_core::traits::RobotsChecker;
use moka::future::Cache;
use reqwest::{Client, redirect};
use robotstxt::DefaultMatcher;
use url::Url;

use crate::fetcher::DEFAULT_USER_AGENT;
use crate::http::build_client;

/// How long a downloaded robots.txt is trusted.
pub const ROBOTS_TTL: Duration = Duration::from_secs(60 * 60);
const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ORIGINS: u64 = 1_000;

/// A cached robots.txt. `None` means no usable file: everything is allowed.
#[derive(Debug)]
struct RobotsFile {
    body: Option<String>,
}

/// Downloads and caches robots.txt per origin.
///
/// Missing files, client errors and unreachable hosts all count as "allow":
/// the checker only blocks what a site explicitly disallows.
#[derive(Clone)]
pub struct RobotsTxtChecker {
    client: Client,
    files: Cache<String, Arc<RobotsFile>>,
}

impl RobotsTxtChecker {
    pub fn new() -> Result<Self, AppError> {
        Self::with_ttl(DEFAULT_USER_AGENT, ROBOTS_TTL)
    }

    pub fn with_ttl(user_agent: &str, ttl: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(
                user_agent,
                ROBOTS_FETCH_TIMEOUT,
                redirect::Policy::limited(5),
            )?,
            files: Cache::builder()
                .max_capacity(MAX_ORIGINS)
                .time_to_live(ttl)
                .build(),
        })
    }

    /// Number of origins with a cached robots.txt.
    pub fn cached_origins(&self) -> u64 {
        self.files.entry_count()
    }

    async fn file_for(&self, origin: String) -> Arc<RobotsFile> {
        let client = self.client.clone();
        let key = origin.clone();
        // Concurrent checks for one origin share a single download.
        self.files
            .get_with(key, async move { Arc::new(download(&client, &origin).await) })
            .await
    }
}

async fn download(client: &Client, origin: &str) -> RobotsFile {
    let url = format!("{origin}/robots.txt");
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "robots.txt unreachable, allowing");
            return RobotsFile { body: None };
        }
    };

    let status = response.status();
    if !status.is_success() {
        tracing::debug!(url = %url, status = status.as_u16(), "No robots.txt, allowing");
        return RobotsFile { body: None };
    }

    match response.text().await {
        Ok(body) => {
            tracing::debug!(url = %url, bytes = body.len(), "Cached robots.txt");
            RobotsFile { body: Some(body) }
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Unreadable robots.txt, allowing");
            RobotsFile { body: None }
        }
    }
}

impl RobotsChecker for RobotsTxtChecker {
    async fn can_scrape(&self, url: &str, user_agent: &str) -> RobotsVerdict {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return RobotsVerdict::deny(format!("unparseable URL: {e}")),
        };
        let origin = parsed.origin().ascii_serialization();
        let file = self.file_for(origin).await;

        match &file.body {
            Some(body) => evaluate(body, url, user_agent),
            None => RobotsVerdict::allow(),
        }
    }
}

/// Apply a robots.txt body to one URL.
pub fn evaluate(body: &str, url: &str, user_agent: &str) -> RobotsVerdict {
    let agent = product_token(user_agent);
    let mut matcher = DefaultMatcher::default();
    if !matcher.one_agent_allowed_by_robots(body, agent, url) {
        return RobotsVerdict::deny(format!("robots.txt disallows {agent}"));
    }

    match crawl_delay(body, agent) {
        Some(delay) => RobotsVerdict::allow().with_crawl_delay(delay),
        None => RobotsVerdict::allow(),
    }
}

/// `Caddie/0.1 (+info)` matches robots groups named `Caddie`.
pub fn product_token(user_agent: &str) -> &str {
    user_agent
        .split(|c: char| c == '/' || c.is_whitespace())
        .find(|part| !part.is_empty())
        .unwrap_or("*")
}

/// `Crawl-delay` for `agent`, falling back to the `*` group.
///
/// The matcher ignores this non-standard directive, so it is read here.
pub fn crawl_delay(body: &str, agent: &str) -> Option<Duration> {
    let agent = agent.to_lowercase();
    let mut specific = None;
    let mut wildcard = None;
    let mut group: Vec<String> = Vec::new();
    let mut in_rules = false;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim().to_lowercase().as_str() {
            "user-agent" => {
                // A user-agent line after rules starts a new group.
                if in_rules {
                    group.clear();
                    in_rules = false;
                }
                group.push(value.to_lowercase());
            }
            "crawl-delay" => {
                in_rules = true;
                let Some(delay) = value
                    .parse::<f64>()
                    .ok()
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                else {
                    continue;
                };
                for name in &group {
                    if *name == agent {
                        specific.get_or_insert(delay);
                    } else if name == "*" {
                        wildcard.get_or_insert(delay);
                    }
                }
            }
            _ => in_rules = true,
        }
    }

    specific.or(wildcard)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
User-agent: *
Disallow: /members/
Crawl-delay: 2

User-agent: Caddie
Disallow: /booking
Crawl-delay: 5.5

User-agent: BadBot
Disallow: /
";

    #[test]
    fn test_product_token() {
        assert_eq!(product_token("Caddie/0.1 (+golf course data collector)"), "Caddie");
        assert_eq!(product_token("curl"), "curl");
        assert_eq!(product_token(""), "*");
    }

    #[test]
    fn test_crawl_delay_prefers_specific_group() {
        assert_eq!(
            crawl_delay(ROBOTS, "caddie"),
            Some(Duration::from_millis(5500))
        );
        assert_eq!(crawl_delay(ROBOTS, "OtherBot"), Some(Duration::from_secs(2)));
        assert_eq!(crawl_delay(ROBOTS, "BadBot"), Some(Duration::from_secs(2)));
        assert_eq!(crawl_delay("User-agent: *\nDisallow:", "caddie"), None);
    }

    #[test]
    fn test_crawl_delay_ignores_garbage() {
        let body = "User-agent: *\nCrawl-delay: soon\nCrawl-delay: -3\n";
        assert_eq!(crawl_delay(body, "caddie"), None);
    }

    #[test]
    fn test_crawl_delay_out_of_range_is_skipped() {
        let body = "User-agent: *\nCrawl-delay: 1e30\nCrawl-delay: inf\nCrawl-delay: 4\n";
        assert_eq!(crawl_delay(body, "caddie"), Some(Duration::from_secs(4)));

        let body = "User-agent: *\nCrawl-delay: 1e30\n";
        let verdict = evaluate(body, "https://club.test/", "Caddie/0.1");
        assert!(verdict.allowed);
        assert_eq!(verdict.crawl_delay, None);
    }

    #[test]
    fn test_evaluate_allows_and_carries_delay() {
        let verdict = evaluate(ROBOTS, "https://club.test/course", "Caddie/0.1");
        assert!(verdict.allowed);
        assert_eq!(verdict.crawl_delay, Some(Duration::from_millis(5500)));
    }

    #[test]
    fn test_evaluate_disallowed_path() {
        let verdict = evaluate(ROBOTS, "https://club.test/booking/tee-times", "Caddie/0.1");
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("Caddie"));

        // The Caddie group replaces the * group, so /members/ is open to it.
        assert!(evaluate(ROBOTS, "https://club.test/members/", "Caddie/0.1").allowed);
        assert!(!evaluate(ROBOTS, "https://club.test/members/", "Other/1.0").allowed);
        assert!(!evaluate(ROBOTS, "https://club.test/", "BadBot/2").allowed);
    }

    #[tokio::test]
    async fn test_unparseable_url_is_denied() {
        let checker = RobotsTxtChecker::new().unwrap();
        let verdict = checker.can_scrape("not a url", "Caddie/0.1").await;
        assert!(!verdict.allowed);
        assert_eq!(checker.cached_origins(), 0);
    }
}
