//! Application configuration loaded from environment variables.
//!
//! All keys use the `KITE_` prefix. Durations accept human strings like
//! `"30s"`, `"5m"`, or bare seconds.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use fundu::{DurationParser, TimeUnit};

const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .default_unit(TimeUnit::Second)
    .build();

/// Which queue backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueDriver {
    #[default]
    Memory,
    Nats,
    Redis,
}

impl QueueDriver {
    /// Sensible localhost URL for local development.
    fn default_url(&self) -> &'static str {
        match self {
            QueueDriver::Memory => "",
            QueueDriver::Nats => "nats://localhost:4222",
            QueueDriver::Redis => "redis://localhost:6379",
        }
    }
}

impl FromStr for QueueDriver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(QueueDriver::Memory),
            "nats" | "stream" => Ok(QueueDriver::Nats),
            "redis" | "log" => Ok(QueueDriver::Redis),
            other => bail!("unknown queue driver: {other} (expected memory|nats|redis)"),
        }
    }
}

/// Queue section.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub driver: QueueDriver,
    pub url: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            driver: QueueDriver::Memory,
            url: String::new(),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Worker-pool section.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 4,
            job_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Scraper politeness section.
#[derive(Debug, Clone)]
pub struct ScraperSettings {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub rate_limit_per_min: u32,
    pub respect_robots_txt: bool,
    pub concurrent_limit: usize,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("kite/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
            rate_limit_per_min: 30,
            respect_robots_txt: true,
            concurrent_limit: 5,
        }
    }
}

/// Full configuration for a hosting binary.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub scraper: ScraperSettings,
}

impl Config {
    /// Load configuration from environment variables (and `.env` when
    /// present). Invalid values are a startup error.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let driver = match env::var("KITE_QUEUE_DRIVER") {
            Ok(raw) => raw
                .parse::<QueueDriver>()
                .context("KITE_QUEUE_DRIVER is invalid")?,
            Err(_) => QueueDriver::default(),
        };
        let url = env::var("KITE_QUEUE_URL").unwrap_or_else(|_| driver.default_url().to_string());

        let config = Self {
            queue: QueueSettings {
                driver,
                url,
                max_retries: parse_var("KITE_QUEUE_MAX_RETRIES")?.unwrap_or(3),
                retry_delay: duration_var("KITE_QUEUE_RETRY_DELAY")?
                    .unwrap_or(Duration::from_secs(5)),
            },
            worker: WorkerSettings {
                count: parse_var("KITE_WORKER_COUNT")?.unwrap_or(4),
                job_timeout: duration_var("KITE_WORKER_JOB_TIMEOUT")?
                    .unwrap_or(Duration::from_secs(300)),
                shutdown_grace: duration_var("KITE_WORKER_SHUTDOWN_GRACE")?
                    .unwrap_or(Duration::from_secs(30)),
            },
            scraper: ScraperSettings {
                user_agent: env::var("KITE_SCRAPER_USER_AGENT")
                    .unwrap_or_else(|_| ScraperSettings::default().user_agent),
                request_timeout: duration_var("KITE_SCRAPER_REQUEST_TIMEOUT")?
                    .unwrap_or(Duration::from_secs(30)),
                rate_limit_per_min: parse_var("KITE_SCRAPER_RATE_LIMIT_PER_MIN")?.unwrap_or(30),
                respect_robots_txt: parse_var("KITE_SCRAPER_RESPECT_ROBOTS")?.unwrap_or(true),
                concurrent_limit: parse_var("KITE_SCRAPER_CONCURRENT_LIMIT")?.unwrap_or(5),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.count < 1 {
            bail!("KITE_WORKER_COUNT must be at least 1");
        }
        if self.scraper.rate_limit_per_min < 1 {
            bail!("KITE_SCRAPER_RATE_LIMIT_PER_MIN must be at least 1");
        }
        if self.scraper.concurrent_limit < 1 {
            bail!("KITE_SCRAPER_CONCURRENT_LIMIT must be at least 1");
        }
        if self.queue.driver != QueueDriver::Memory && self.queue.url.is_empty() {
            bail!("KITE_QUEUE_URL must be set for broker-backed queues");
        }
        Ok(())
    }
}

/// Parse an optional env var with `FromStr`, keeping the var name in errors.
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{name} has invalid value: {raw}")),
        Err(_) => Ok(None),
    }
}

/// Parse an optional duration env var (`"5m"`, `"1500ms"`, `"45"`).
fn duration_var(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => {
            let parsed = DURATION_PARSER
                .parse(&raw)
                .with_context(|| format!("{name} has invalid duration: {raw}"))?;
            let duration = Duration::try_from(parsed)
                .with_context(|| format!("{name} is out of range: {raw}"))?;
            Ok(Some(duration))
        }
        Err(_) => Ok(None),
    }
}
