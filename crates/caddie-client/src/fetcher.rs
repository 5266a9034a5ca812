use std::net::IpAddr;
use std::time::{Duration, Instant};

use caddie_core::error::AppError;
use caddie_core::models::{FetchMode, ProcessingResult, ScrapeOptions, ScrapeTarget};
use caddie_core::traits::Fetcher;
use reqwest::header::USER_AGENT;
use reqwest::{Client, redirect};
use url::Url;

use crate::cleaner::{HtmdCleaner, page_title};
use crate::http::{build_client, ensure_success, map_send_error};

pub const DEFAULT_USER_AGENT: &str = "Caddie/0.1 (+golf course data collector)";

/// Plain HTTP fetcher for server-rendered course pages.
///
/// Downloads the page, pulls its `<title>` and converts the body to
/// Markdown. By default, SSRF protection is **enabled**: requests to
/// private/reserved IP ranges are blocked. Use
/// [`allow_private_urls`](Self::allow_private_urls) to disable this (e.g.,
/// for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct StaticFetcher {
    client: Client,
    /// Used when a request sets `follow_redirects: false`.
    no_redirects: Client,
    cleaner: HtmdCleaner,
    ssrf_protection: bool,
}

impl StaticFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_options(DEFAULT_USER_AGENT, &ScrapeOptions::default())
    }

    /// Client-level user agent and redirect limit. Per-request timeouts and
    /// user agents still come from the `ScrapeOptions` passed to `fetch`.
    pub fn with_options(user_agent: &str, defaults: &ScrapeOptions) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(
                user_agent,
                defaults.timeout,
                redirect::Policy::limited(defaults.max_redirects),
            )?,
            no_redirects: build_client(user_agent, defaults.timeout, redirect::Policy::none())?,
            cleaner: HtmdCleaner::new(),
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    async fn download(
        &self,
        url: &str,
        options: &ScrapeOptions,
    ) -> Result<(u16, String, String), AppError> {
        let client = if options.follow_redirects {
            &self.client
        } else {
            &self.no_redirects
        };

        let mut request = client.get(url).timeout(options.timeout);
        if let Some(agent) = &options.user_agent {
            request = request.header(USER_AGENT, agent);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, options.timeout))?;
        let response = ensure_success(response).await?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;

        Ok((status, final_url, html))
    }
}

impl Fetcher for StaticFetcher {
    async fn fetch(
        &self,
        target: &ScrapeTarget,
        options: &ScrapeOptions,
    ) -> Result<ProcessingResult, AppError> {
        if self.ssrf_protection {
            validate_url(&target.url).await?;
        }

        let started = Instant::now();
        let (status, final_url, html) = self.download(&target.url, options).await?;
        let title = page_title(&html);
        let content = self.cleaner.clean(&html)?;

        tracing::debug!(
            url = %target.url,
            status,
            bytes = html.len(),
            "Fetched static page"
        );

        let mut result = ProcessingResult::new(&target.url, content, FetchMode::Static)
            .with_status(status)
            .with_final_url(final_url)
            .with_processing_time(started.elapsed());
        if let Some(title) = title {
            result = result.with_title(title);
        }
        Ok(result)
    }
}

/// Resolution budget for the SSRF check.
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
pub(crate) async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{url}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidUrl(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidUrl(format!("{url}: URL has no host")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::InvalidUrl(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let lookup = tokio::net::lookup_host(format!("{host}:{port}"));
    let addrs: Vec<_> = tokio::time::timeout(DNS_TIMEOUT, lookup)
        .await
        .map_err(|_| AppError::Timeout(DNS_TIMEOUT.as_millis() as u64))?
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::InvalidUrl(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ipv4() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.169.254".parse().unwrap()));
        assert!(is_private_ip("0.0.0.0".parse().unwrap()));
        assert!(is_private_ip("100.64.0.1".parse().unwrap()));
    }

    #[test]
    fn test_public_ipv4() {
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("1.1.1.1".parse().unwrap()));
        assert!(!is_private_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_private_ipv6() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("::".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("::ffff:127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("::ffff:169.254.169.254".parse().unwrap()));
    }

    #[test]
    fn test_public_ipv6() {
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_private_ip() {
        let err = validate_url("http://127.0.0.1/admin").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidUrl(_)));
        assert!(err.to_string().contains("SSRF blocked"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bracketed_ipv6() {
        let err = validate_url("http://[::1]:8080/").await.unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_metadata_ip() {
        let err = validate_url("http://169.254.169.254/latest/meta-data/")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bad_scheme() {
        let err = validate_url("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_fetch_blocked_before_any_request() {
        let fetcher = StaticFetcher::new().unwrap();
        let target = ScrapeTarget::new("http://192.168.0.10/tee-times");
        let err = fetcher
            .fetch(&target, &ScrapeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidUrl(_)));
    }
}
