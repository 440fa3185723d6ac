//! HTTP fetch substrate shared by all scrapers.
//!
//! Order of gates on every request: robots.txt check (no request is made
//! for a disallowed path), crawl-delay propagation into the rate limiter,
//! concurrency permit, per-host pacing, then the actual HTTP GET.

use std::sync::Arc;
use std::time::Duration;

use kite_core::error::{JobError, JobResult};
use kite_core::ScraperSettings;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::rate_limit::HostRateLimiter;
use crate::robots::RobotsCache;

/// A successful fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    /// Final URL after redirects.
    pub url: String,
}

/// Politeness-gated HTTP client.
pub struct FetchClient {
    client: reqwest::Client,
    user_agent: String,
    request_timeout: Duration,
    respect_robots: bool,
    limiter: Arc<HostRateLimiter>,
    robots: Arc<RobotsCache>,
    permits: Arc<Semaphore>,
}

impl FetchClient {
    /// Wire an existing client to the shared politeness substrate.
    pub fn new(
        settings: &ScraperSettings,
        client: reqwest::Client,
        limiter: Arc<HostRateLimiter>,
        robots: Arc<RobotsCache>,
    ) -> Self {
        Self {
            client,
            user_agent: settings.user_agent.clone(),
            request_timeout: settings.request_timeout,
            respect_robots: settings.respect_robots_txt,
            limiter,
            robots,
            permits: Arc::new(Semaphore::new(settings.concurrent_limit)),
        }
    }

    /// Build the whole substrate from settings (composition-root helper).
    pub fn from_settings(settings: &ScraperSettings) -> JobResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| JobError::Internal(format!("failed to build HTTP client: {e}")))?;
        let limiter = Arc::new(HostRateLimiter::new(settings.rate_limit_per_min));
        let robots = Arc::new(RobotsCache::new(client.clone()));
        Ok(Self::new(settings, client, limiter, robots))
    }

    pub fn robots(&self) -> &Arc<RobotsCache> {
        &self.robots
    }

    pub fn rate_limiter(&self) -> &Arc<HostRateLimiter> {
        &self.limiter
    }

    /// Fetch a URL through the politeness gates.
    pub async fn get(&self, url: &str) -> JobResult<FetchResponse> {
        let parsed = Url::parse(url)
            .map_err(|e| JobError::Validation(format!("invalid url {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| JobError::Validation(format!("url has no host: {url}")))?
            .to_string();

        if self.respect_robots {
            if !self.robots.is_allowed(&parsed, &self.user_agent).await {
                debug!(url, "blocked by robots.txt");
                return Err(JobError::RobotsDisallowed {
                    url: url.to_string(),
                });
            }
            if let Some(delay) = self.robots.crawl_delay(&parsed, &self.user_agent).await {
                self.limiter.apply_crawl_delay(&host, delay);
            }
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| JobError::Internal("fetch concurrency gate closed".to_string()))?;
        self.limiter.wait(&host).await;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 503 {
            return Err(JobError::RateLimited(format!("HTTP {status} from {host}")));
        }
        if !status.is_success() {
            return Err(JobError::Network(format!("HTTP {status} for {url}")));
        }

        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        Ok(FetchResponse {
            status: status.as_u16(),
            body,
            url: final_url,
        })
    }

    fn classify(&self, err: reqwest::Error) -> JobError {
        if err.is_timeout() {
            JobError::Timeout(self.request_timeout)
        } else {
            JobError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(settings: &ScraperSettings) -> FetchClient {
        FetchClient::from_settings(settings).unwrap()
    }

    fn test_settings() -> ScraperSettings {
        ScraperSettings {
            request_timeout: Duration::from_millis(500),
            rate_limit_per_min: 60_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn invalid_urls_fail_validation() {
        let fetch = client_with(&test_settings());
        let err = fetch.get("not a url").await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn disallowed_path_is_refused_without_a_request() {
        let fetch = client_with(&test_settings());
        // Port 1 is unroutable: any attempted request would surface as a
        // network error, not a robots error.
        fetch
            .robots()
            .prime("http://127.0.0.1:1/", "User-agent: *\nDisallow: /secret");

        let err = fetch.get("http://127.0.0.1:1/secret/file").await.unwrap_err();
        assert!(matches!(err, JobError::RobotsDisallowed { .. }));
    }

    #[tokio::test]
    async fn robots_can_be_disabled_by_config() {
        let settings = ScraperSettings {
            respect_robots_txt: false,
            ..test_settings()
        };
        let fetch = client_with(&settings);
        fetch
            .robots()
            .prime("http://127.0.0.1:1/", "User-agent: *\nDisallow: /");

        // With robots off the request is attempted and fails on the network.
        let err = fetch.get("http://127.0.0.1:1/anything").await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Network(_) | JobError::Timeout(_)
        ));
    }
}
