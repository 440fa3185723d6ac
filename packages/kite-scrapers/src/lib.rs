// Kite scrapers - politeness substrate and scraper interfaces
//
// Every outbound request a scraper makes flows through the shared fetch
// substrate: robots.txt rules are consulted first, then the per-host rate
// limiter paces the request. The rate limiter and robots cache are
// process-wide; construct them once in the composition root and inject
// them into every scraper.

pub mod fetch;
pub mod handler;
pub mod rate_limit;
pub mod robots;
pub mod scraper;
pub mod store;
pub mod testing;

pub use fetch::{FetchClient, FetchResponse};
pub use handler::{ScrapeHandler, ScrapePayload};
pub use rate_limit::HostRateLimiter;
pub use robots::{RobotsCache, RobotsTxt};
pub use scraper::{CaseQuery, LegalCase, Scraper, ScraperRegistry};
pub use store::{CaseStore, MemoryCaseStore};
