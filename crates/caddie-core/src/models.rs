use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::AppError;

/// Priority a caller declares for a scrape target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityHint {
    High,
    #[default]
    Medium,
    Low,
}

impl PriorityHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityHint::High => "high",
            PriorityHint::Medium => "medium",
            PriorityHint::Low => "low",
        }
    }

    pub fn base_score(&self) -> u8 {
        match self {
            PriorityHint::High => 8,
            PriorityHint::Medium => 5,
            PriorityHint::Low => 2,
        }
    }
}

impl fmt::Display for PriorityHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PriorityHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(PriorityHint::High),
            "medium" => Ok(PriorityHint::Medium),
            "low" => Ok(PriorityHint::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// What kind of site a target is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// The course's own website.
    Official,
    Directory,
    Review,
    News,
    #[default]
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Official => "official",
            SourceType::Directory => "directory",
            SourceType::Review => "review",
            SourceType::News => "news",
            SourceType::Other => "other",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "official" => Ok(SourceType::Official),
            "directory" => Ok(SourceType::Directory),
            "review" => Ok(SourceType::Review),
            "news" => Ok(SourceType::News),
            "other" | "" => Ok(SourceType::Other),
            _ => Err(format!("Unknown source type: {}", s)),
        }
    }
}

/// A website to scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: PriorityHint,
    #[serde(default)]
    pub source_type: SourceType,
    /// The page only renders its content client-side.
    #[serde(default)]
    pub requires_javascript: bool,
}

impl ScrapeTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            priority: PriorityHint::default(),
            source_type: SourceType::default(),
            requires_javascript: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: PriorityHint) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn requiring_javascript(mut self) -> Self {
        self.requires_javascript = true;
        self
    }

    /// Queue priority: the declared tier, +2 for official sites.
    pub fn priority_score(&self) -> u8 {
        let boost = if self.source_type == SourceType::Official {
            2
        } else {
            0
        };
        self.priority.base_score() + boost
    }
}

/// Per-request fetch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeOptions {
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Overrides the queue's user agent.
    pub user_agent: Option<String>,
    pub render_javascript: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            render_javascript: false,
            follow_redirects: true,
            max_redirects: 5,
        }
    }
}

impl ScrapeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn render_javascript(mut self) -> Self {
        self.render_javascript = true;
        self
    }
}

/// Which fetcher produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Static,
    Dynamic,
}

impl FetchMode {
    /// Pick the fetcher for a target: a headless browser only when the
    /// target or the caller asks for JavaScript rendering.
    pub fn for_target(target: &ScrapeTarget, options: &ScrapeOptions) -> Self {
        if target.requires_javascript || options.render_javascript {
            FetchMode::Dynamic
        } else {
            FetchMode::Static
        }
    }
}

/// Output of a fetcher.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    pub title: Option<String>,
    /// Cleaned page text (Markdown).
    pub content: String,
    /// SHA-256 of `content`
    pub content_hash: String,
    pub fetch_mode: FetchMode,
    pub processing_time_ms: u64,
    pub fetched_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn new(url: impl Into<String>, content: impl Into<String>, fetch_mode: FetchMode) -> Self {
        let url = url.into();
        let content = content.into();
        Self {
            final_url: url.clone(),
            url,
            status_code: 200,
            title: None,
            content_hash: compute_hash(&content),
            content,
            fetch_mode,
            processing_time_ms: 0,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_final_url(mut self, final_url: impl Into<String>) -> Self {
        self.final_url = final_url.into();
        self
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = elapsed.as_millis() as u64;
        self
    }
}

/// Answer from a [`crate::traits::RobotsChecker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotsVerdict {
    pub allowed: bool,
    pub crawl_delay: Option<Duration>,
    pub reason: Option<String>,
}

impl RobotsVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            crawl_delay: None,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            crawl_delay: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_crawl_delay(mut self, delay: Duration) -> Self {
        self.crawl_delay = Some(delay);
        self
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Throttling key for a URL: lowercase host, plus the port when it is not
/// the scheme default.
pub fn domain_key(url: &str) -> Result<String, AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidUrl(format!(
                "{url}: scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidUrl(format!("{url}: no host")))?
        .to_lowercase();
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_priority_scores() {
        let target = |p| ScrapeTarget::new("https://example.com").with_priority(p);
        assert_eq!(target(PriorityHint::High).priority_score(), 8);
        assert_eq!(target(PriorityHint::Medium).priority_score(), 5);
        assert_eq!(target(PriorityHint::Low).priority_score(), 2);
        assert_eq!(
            target(PriorityHint::Medium)
                .with_source_type(SourceType::Official)
                .priority_score(),
            7
        );
        assert_eq!(
            target(PriorityHint::High)
                .with_source_type(SourceType::Official)
                .priority_score(),
            10
        );
    }

    #[test]
    fn test_priority_hint_parse() {
        for hint in [PriorityHint::High, PriorityHint::Medium, PriorityHint::Low] {
            assert_eq!(hint.as_str().parse::<PriorityHint>().unwrap(), hint);
        }
        assert!("urgent".parse::<PriorityHint>().is_err());
        assert_eq!("".parse::<SourceType>().unwrap(), SourceType::Other);
    }

    #[test]
    fn test_fetch_mode_selection() {
        let plain = ScrapeTarget::new("https://example.com");
        let spa = ScrapeTarget::new("https://example.com").requiring_javascript();
        let defaults = ScrapeOptions::default();

        assert_eq!(FetchMode::for_target(&plain, &defaults), FetchMode::Static);
        assert_eq!(FetchMode::for_target(&spa, &defaults), FetchMode::Dynamic);
        assert_eq!(
            FetchMode::for_target(&plain, &ScrapeOptions::default().render_javascript()),
            FetchMode::Dynamic
        );
    }

    #[test]
    fn test_domain_key() {
        assert_eq!(
            domain_key("https://Example.com/path?q=1").unwrap(),
            "example.com"
        );
        assert_eq!(
            domain_key("http://example.com:8080/page").unwrap(),
            "example.com:8080"
        );
        assert_eq!(domain_key("https://example.com:443/").unwrap(), "example.com");
        assert!(matches!(
            domain_key("not-a-url"),
            Err(AppError::InvalidUrl(_))
        ));
        assert!(matches!(
            domain_key("file:///etc/passwd"),
            Err(AppError::InvalidUrl(_))
        ));
    }
}
