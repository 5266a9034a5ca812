use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use caddie_core::error::AppError;
use caddie_core::models::{FetchMode, ProcessingResult, ScrapeOptions, ScrapeTarget};
use caddie_core::traits::Fetcher;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;

use crate::cleaner::{HtmdCleaner, page_title};
use crate::fetcher::validate_url;

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Unlike [`crate::StaticFetcher`], this renders JavaScript before reading
/// the DOM, so it handles booking widgets and course pages built as SPAs.
///
/// A single Chromium process is shared across all clones of this struct;
/// each [`Fetcher::fetch`] call opens a new tab, grabs the rendered HTML,
/// and closes the tab.
///
/// # Example
///
/// ```rust,no_run
/// use caddie_client::BrowserFetcher;
/// use caddie_core::{Fetcher, ScrapeOptions, ScrapeTarget};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = BrowserFetcher::launch().await?;
/// let target = ScrapeTarget::new("https://example.com").requiring_javascript();
/// let page = fetcher.fetch(&target, &ScrapeOptions::default()).await?;
/// println!("{:?}", page.title);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    cleaner: HtmdCleaner,
    ssrf_protection: bool,
}

impl BrowserFetcher {
    /// Launches a headless Chromium browser.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`
    /// or one of the well-known install locations.
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder();
        builder = builder.no_sandbox().disable_default_args();

        // The snap wrapper rejects standard Chrome flags, so prefer the real
        // binary when one can be found.
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            cleaner: HtmdCleaner::new(),
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing navigation to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn find_chrome_binary() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        [
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
    }

    async fn render(&self, url: &str) -> Result<(String, Option<String>), AppError> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;

        // <body> being present is the minimal signal that the page rendered.
        page.find_element("body")
            .await
            .map_err(|e| AppError::NetworkError(format!("Page did not render body: {e}")))?;

        let html = page
            .content()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read page content: {e}")))?;
        let title = page.get_title().await.ok().flatten();

        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Failed to close browser tab");
        }

        Ok((html, title))
    }
}

impl Fetcher for BrowserFetcher {
    async fn fetch(
        &self,
        target: &ScrapeTarget,
        options: &ScrapeOptions,
    ) -> Result<ProcessingResult, AppError> {
        if self.ssrf_protection {
            validate_url(&target.url).await?;
        }

        let started = Instant::now();
        let (html, title) = tokio::time::timeout(options.timeout, self.render(&target.url))
            .await
            .map_err(|_| AppError::Timeout(options.timeout.as_millis() as u64))??;

        let title = title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| page_title(&html));
        let content = self.cleaner.clean(&html)?;

        let mut result = ProcessingResult::new(&target.url, content, FetchMode::Dynamic)
            .with_processing_time(started.elapsed());
        if let Some(title) = title {
            result = result.with_title(title);
        }
        Ok(result)
    }
}
