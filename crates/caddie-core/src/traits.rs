use std::future::Future;

use crate::error::AppError;
use crate::models::{ProcessingResult, RobotsVerdict, ScrapeOptions, ScrapeTarget};

/// Fetches and extracts a page for the scrape queue.
///
/// The queue holds two implementations, a plain HTTP one and a
/// JavaScript-rendering one, and picks between them with
/// [`crate::models::FetchMode::for_target`].
pub trait Fetcher: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        target: &ScrapeTarget,
        options: &ScrapeOptions,
    ) -> impl Future<Output = Result<ProcessingResult, AppError>> + Send;
}

/// Decides whether a URL may be crawled and how politely.
pub trait RobotsChecker: Send + Sync + Clone + 'static {
    fn can_scrape(
        &self,
        url: &str,
        user_agent: &str,
    ) -> impl Future<Output = RobotsVerdict> + Send;
}

/// A RobotsChecker that permits everything, for trusted targets and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl RobotsChecker for AllowAll {
    async fn can_scrape(&self, _url: &str, _user_agent: &str) -> RobotsVerdict {
        RobotsVerdict::allow()
    }
}
