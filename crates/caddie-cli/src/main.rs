use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use caddie_client::{
    OverpassClient, RobotsTxtChecker, StaticFetcher, WeatherClient, WikipediaClient,
};
use caddie_core::config::ServiceConfig;
use caddie_core::traits::{Fetcher, RobotsChecker};
use caddie_core::{
    AllowAll, ApiResponse, CacheKey, CacheManager, CaddieConfig, CallOptions, PriorityHint,
    RequestQueue, ScrapeOptions, ScrapeTarget, ServiceRegistry, SourceType, TracingQueueReporter,
};

#[derive(Parser)]
#[command(name = "caddie", version, about = "Golf course data aggregator")]
struct Cli {
    /// JSON config file (services, cache namespaces, queue tuning)
    #[arg(short, long, global = true, env = "CADDIE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Current conditions or forecast at a course
    Weather {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Five-day forecast instead of current conditions
        #[arg(long, default_value_t = false)]
        forecast: bool,

        /// metric, imperial or standard
        #[arg(long, default_value = "metric")]
        units: String,

        /// OpenWeatherMap API key
        #[arg(long, env = "OPENWEATHER_API_KEY", hide_env_values = true)]
        api_key: String,
    },

    /// Wikipedia background for a course
    Wiki {
        /// Course name
        #[arg(short, long)]
        name: String,

        /// Town or region to narrow the search
        #[arg(short, long)]
        location: Option<String>,
    },

    /// Food, fuel and lodging near a course (OpenStreetMap)
    Amenities {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Search radius in metres
        #[arg(short, long, default_value_t = 3000)]
        radius: u32,

        /// Also look up the course itself by name
        #[arg(long)]
        course: Option<String>,
    },

    /// Scrape course websites through the polite request queue
    Scrape {
        /// URLs to scrape
        urls: Vec<String>,

        /// CSV file with columns url,name,priority,source_type,requires_javascript
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Priority for URLs given on the command line
        #[arg(short, long, default_value = "medium")]
        priority: PriorityHint,

        /// Render pages with a headless browser
        #[arg(long, default_value_t = false)]
        render_js: bool,

        /// Skip robots.txt checks (only for sites you operate)
        #[arg(long, default_value_t = false)]
        ignore_robots: bool,

        /// Allow private/reserved IP targets
        #[arg(long, default_value_t = false)]
        allow_private: bool,
    },

    /// Warm the forecast cache for a list of courses
    Warm {
        /// CSV file with columns name,lat,lon
        #[arg(short, long)]
        file: PathBuf,

        /// OpenWeatherMap API key
        #[arg(long, env = "OPENWEATHER_API_KEY", hide_env_values = true)]
        api_key: String,
    },

    /// Service health, call statistics and cache health
    Health {
        /// Make one light request to each keyless service first
        #[arg(long, default_value_t = false)]
        probe: bool,
    },
}

/// Registry and cache shared by every command.
struct App {
    config: CaddieConfig,
    registry: ServiceRegistry,
    cache: CacheManager,
}

impl App {
    fn new(config: CaddieConfig) -> Result<Self> {
        let registry = ServiceRegistry::new(config.services.clone())?;
        let cache = CacheManager::new(&config.cache)?;
        Ok(Self {
            config,
            registry,
            cache,
        })
    }

    fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.registry
            .service(name)
            .map(|instance| instance.config())
            .with_context(|| format!("Service '{name}' is not configured"))
    }

    async fn close(&self) {
        self.registry.close().await;
        self.cache.close().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("caddie=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CaddieConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CaddieConfig::from_env()?,
    };
    let app = App::new(config)?;

    let outcome = match cli.command {
        Commands::Weather {
            lat,
            lon,
            forecast,
            units,
            api_key,
        } => cmd_weather(&app, lat, lon, forecast, &units, &api_key).await,
        Commands::Wiki { name, location } => cmd_wiki(&app, &name, location.as_deref()).await,
        Commands::Amenities {
            lat,
            lon,
            radius,
            course,
        } => cmd_amenities(&app, lat, lon, radius, course.as_deref()).await,
        Commands::Scrape {
            urls,
            file,
            priority,
            render_js,
            ignore_robots,
            allow_private,
        } => {
            let mut targets: Vec<ScrapeTarget> = urls
                .into_iter()
                .map(|url| ScrapeTarget::new(url).with_priority(priority))
                .collect();
            if let Some(file) = &file {
                targets.extend(read_targets(file)?);
            }
            if targets.is_empty() {
                bail!("Nothing to scrape: pass URLs or --file");
            }

            let mut options = ScrapeOptions::default();
            if render_js {
                options = options.render_javascript();
            }
            cmd_scrape(&app, targets, options, ignore_robots, allow_private).await
        }
        Commands::Warm { file, api_key } => cmd_warm(&app, &file, &api_key).await,
        Commands::Health { probe } => cmd_health(&app, probe).await,
    };

    app.close().await;
    outcome
}

async fn cmd_weather(
    app: &App,
    lat: f64,
    lon: f64,
    forecast: bool,
    units: &str,
    api_key: &str,
) -> Result<()> {
    let client = WeatherClient::new(app.service("weather")?, api_key)?.with_units(units);
    let (namespace, key) = if forecast {
        ("forecast", CacheKey::forecast(lat, lon))
    } else {
        ("current", CacheKey::current(lat, lon))
    };

    let response = app
        .cache
        .get_or_fetch(namespace, &key, || async {
            app.registry
                .call(
                    "weather",
                    || async {
                        if forecast {
                            client.forecast(lat, lon).await
                        } else {
                            client.current_weather(lat, lon).await
                        }
                    },
                    CallOptions::default(),
                )
                .await
                .into_result()
        })
        .await;

    print_response(response)
}

async fn cmd_wiki(app: &App, name: &str, location: Option<&str>) -> Result<()> {
    let client = WikipediaClient::new(app.service("wikipedia")?)?;

    let search = app
        .registry
        .call(
            "wikipedia",
            || client.search(name, location),
            CallOptions::default(),
        )
        .await;
    let hits = search.into_result()?;

    let Some(title) = hits["query"]["search"][0]["title"].as_str() else {
        println!("{}", json!({ "query": name, "article": null }));
        return Ok(());
    };
    tracing::info!(title, "Best Wikipedia match");

    let response = app
        .registry
        .call("wikipedia", || client.extract(title), CallOptions::default())
        .await;
    print_response(response)
}

async fn cmd_amenities(
    app: &App,
    lat: f64,
    lon: f64,
    radius: u32,
    course: Option<&str>,
) -> Result<()> {
    let client = OverpassClient::new(app.service("osm")?)?;

    if let Some(course) = course {
        let found = app
            .registry
            .call(
                "osm",
                || client.find_location(course, lat, lon, radius),
                CallOptions::default(),
            )
            .await;
        print_response(found)?;
    }

    let key = CacheKey::golf(lat, lon, &format!("amenities-{radius}"));
    let response = app
        .cache
        .get_or_fetch("golf", &key, || async {
            app.registry
                .call(
                    "osm",
                    || client.nearby_amenities(lat, lon, radius),
                    CallOptions::default(),
                )
                .await
                .into_result()
        })
        .await;
    print_response(response)
}

async fn cmd_scrape(
    app: &App,
    targets: Vec<ScrapeTarget>,
    options: ScrapeOptions,
    ignore_robots: bool,
    allow_private: bool,
) -> Result<()> {
    let queue_config = app.config.queue.clone();
    let mut fetcher = StaticFetcher::with_options(&queue_config.user_agent, &options)?;
    if allow_private {
        fetcher = fetcher.allow_private_urls();
    }

    #[cfg(feature = "browser")]
    let dynamic = {
        let mut browser = caddie_client::BrowserFetcher::launch().await?;
        if allow_private {
            browser = browser.allow_private_urls();
        }
        browser
    };
    #[cfg(not(feature = "browser"))]
    let dynamic = {
        if options.render_javascript || targets.iter().any(|t| t.requires_javascript) {
            tracing::warn!("Built without the 'browser' feature, rendering pages statically");
        }
        fetcher.clone()
    };

    if ignore_robots {
        run_queue(app, targets, options, fetcher, dynamic, AllowAll).await
    } else {
        let robots = RobotsTxtChecker::with_ttl(
            &queue_config.user_agent,
            caddie_client::robots::ROBOTS_TTL,
        )?;
        run_queue(app, targets, options, fetcher, dynamic, robots).await
    }
}

async fn run_queue<D, R>(
    app: &App,
    targets: Vec<ScrapeTarget>,
    options: ScrapeOptions,
    fetcher: StaticFetcher,
    dynamic: D,
    robots: R,
) -> Result<()>
where
    D: Fetcher,
    R: RobotsChecker,
{
    let queue = RequestQueue::new(
        app.config.queue.clone(),
        fetcher,
        dynamic,
        robots,
        TracingQueueReporter,
    )?;

    let mut handles = Vec::with_capacity(targets.len());
    for target in targets {
        let url = target.url.clone();
        match queue.enqueue(target, options.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::warn!(%url, error = %e, "Skipping target"),
        }
    }
    queue.start();

    let mut failures = 0usize;
    for handle in handles {
        let url = handle.url().to_string();
        let line = match handle.wait().await {
            Ok(page) => json!({
                "url": url,
                "ok": true,
                "final_url": page.final_url,
                "status": page.status_code,
                "title": page.title,
                "content_hash": page.content_hash,
                "fetch_mode": page.fetch_mode,
                "processing_time_ms": page.processing_time_ms,
                "content": page.content,
            }),
            Err(e) => {
                failures += 1;
                json!({
                    "url": url,
                    "ok": false,
                    "error": e.to_string(),
                    "retryable": e.is_retryable(),
                })
            }
        };
        println!("{line}");
    }

    let stats = queue.stats();
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        success_rate = stats.success_rate,
        "Scrape finished"
    );
    queue.shutdown().await;

    if failures > 0 {
        bail!("{failures} target(s) failed");
    }
    Ok(())
}

async fn cmd_warm(app: &App, file: &Path, api_key: &str) -> Result<()> {
    let courses = read_courses(file)?;
    let client = WeatherClient::new(app.service("weather")?, api_key)?;

    // Space requests to stay inside the weather service's per-minute limit.
    let rpm = app.service("weather")?.rate_limit.requests_per_minute.max(1);
    let delay = Duration::from_millis(60_000 / u64::from(rpm));

    let points: HashMap<CacheKey, (f64, f64)> = courses
        .iter()
        .map(|c| (CacheKey::forecast(c.lat, c.lon), (c.lat, c.lon)))
        .collect();
    let keys = courses.iter().map(|c| CacheKey::forecast(c.lat, c.lon));

    let report = app
        .cache
        .preload("forecast", keys, delay, |key: CacheKey| {
            let client = client.clone();
            let registry = app.registry.clone();
            let (lat, lon) = points.get(&key).copied().unwrap_or_default();
            async move {
                registry
                    .call(
                        "weather",
                        || client.forecast(lat, lon),
                        CallOptions::default(),
                    )
                    .await
                    .into_result()
            }
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_health(app: &App, probe: bool) -> Result<()> {
    if probe {
        if let Ok(config) = app.service("wikipedia") {
            let client = WikipediaClient::new(config)?;
            let response = app
                .registry
                .call(
                    "wikipedia",
                    || client.search("Old Course", Some("St Andrews")),
                    CallOptions::default(),
                )
                .await;
            log_probe("wikipedia", &response);
        }
        if let Ok(config) = app.service("osm") {
            let client = OverpassClient::new(config)?;
            let response = app
                .registry
                .call(
                    "osm",
                    || client.nearby_amenities(56.343, -2.803, 200),
                    CallOptions::default(),
                )
                .await;
            log_probe("osm", &response);
        }
    }

    let report = json!({
        "registry": app.registry.health(),
        "stats": app.registry.stats(),
        "cache": app.cache.health().await,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn log_probe(service: &str, response: &ApiResponse<Value>) {
    match response.error() {
        None => tracing::info!(service, ms = response.processing_time_ms, "Probe ok"),
        Some(e) => tracing::warn!(service, error = %e, "Probe failed"),
    }
}

/// Print a guarded call's payload with its bookkeeping, or fail with its error.
fn print_response(response: ApiResponse<Value>) -> Result<()> {
    let ApiResponse {
        result,
        cached,
        request_id,
        processing_time_ms,
        remaining_requests,
        ..
    } = response;

    let data = result.context("Request failed")?;
    let envelope = json!({
        "request_id": request_id,
        "cached": cached,
        "processing_time_ms": processing_time_ms,
        "remaining_requests": remaining_requests,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    url: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    requires_javascript: Option<bool>,
}

/// Read scrape targets from a CSV file with a header row.
fn read_targets(path: &Path) -> Result<Vec<ScrapeTarget>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut targets = Vec::new();
    for (line, row) in reader.deserialize::<TargetRow>().enumerate() {
        let row = row.with_context(|| format!("{}: bad row {}", path.display(), line + 2))?;
        let mut target = ScrapeTarget::new(row.url);
        if let Some(name) = row.name.filter(|n| !n.trim().is_empty()) {
            target = target.with_name(name);
        }
        if let Some(priority) = row.priority.filter(|p| !p.trim().is_empty()) {
            target = target.with_priority(priority.parse().map_err(anyhow::Error::msg)?);
        }
        if let Some(source) = row.source_type {
            let source: SourceType = source.parse().map_err(anyhow::Error::msg)?;
            target = target.with_source_type(source);
        }
        if row.requires_javascript.unwrap_or(false) {
            target = target.requiring_javascript();
        }
        targets.push(target);
    }
    Ok(targets)
}

/// Extra columns such as `name` are ignored.
#[derive(Debug, Deserialize)]
struct CourseRow {
    lat: f64,
    lon: f64,
}

fn read_courses(path: &Path) -> Result<Vec<CourseRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    reader
        .deserialize::<CourseRow>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid course list {}", path.display()))
}
