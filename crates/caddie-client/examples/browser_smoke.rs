/// Smoke-test for `BrowserFetcher`.
///
/// Launches a headless Chromium, renders <https://example.com>, and checks
/// the extracted title and Markdown.
///
/// Run with:
///   cargo run -p caddie-client --example browser_smoke --features browser
use caddie_client::BrowserFetcher;
use caddie_core::{Fetcher, ScrapeOptions, ScrapeTarget};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser...");
    let fetcher = BrowserFetcher::launch().await?;

    let target = ScrapeTarget::new("https://example.com").requiring_javascript();
    println!("Fetching {} ...", target.url);
    let page = fetcher.fetch(&target, &ScrapeOptions::default()).await?;

    anyhow::ensure!(
        page.title.as_deref() == Some("Example Domain"),
        "unexpected title: {:?}",
        page.title
    );
    anyhow::ensure!(
        page.content.contains("Example Domain"),
        "heading missing from rendered content"
    );

    println!(
        "OK: {} chars of Markdown in {} ms",
        page.content.len(),
        page.processing_time_ms
    );
    Ok(())
}
