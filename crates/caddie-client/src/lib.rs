//! Network collaborators for `caddie-core`: page fetchers, the robots.txt
//! checker and raw clients for the weather, Wikipedia and Overpass APIs.

pub mod cleaner;
pub mod fetcher;
mod http;
pub mod overpass;
pub mod robots;
pub mod weather;
pub mod wikipedia;

#[cfg(feature = "browser")]
pub mod browser_fetcher;

pub use cleaner::HtmdCleaner;
pub use fetcher::{DEFAULT_USER_AGENT, StaticFetcher};
pub use overpass::OverpassClient;
pub use robots::RobotsTxtChecker;
pub use weather::WeatherClient;
pub use wikipedia::WikipediaClient;

#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserFetcher;
