//! Per-host request pacing.
//!
//! One bucket per host, created lazily on first contact and kept for the
//! process lifetime. Buckets pace strictly: one request per
//! `60s / requests_per_minute`, so any window of T minutes sees at most
//! `rate * T` requests to a host. A robots `Crawl-delay` replaces the
//! configured pace when it is stricter.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tracing::debug;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct HostBucket {
    limiter: Arc<DirectLimiter>,
    interval: Duration,
}

/// Process-wide per-host pacer shared by all scrapers.
pub struct HostRateLimiter {
    min_interval: Duration,
    buckets: Mutex<HashMap<String, HostBucket>>,
}

impl HostRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = u64::from(requests_per_minute.max(1));
        Self {
            min_interval: Duration::from_millis((60_000 / rpm).max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn limiter_for(interval: Duration) -> Arc<DirectLimiter> {
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(nonzero!(1000u32)))
            .allow_burst(NonZeroU32::MIN);
        Arc::new(RateLimiter::direct(quota))
    }

    fn bucket(&self, host: &str) -> Arc<DirectLimiter> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(host.to_string())
            .or_insert_with(|| HostBucket {
                limiter: Self::limiter_for(self.min_interval),
                interval: self.min_interval,
            })
            .limiter
            .clone()
    }

    /// Suspend until the host's next request slot. Contending waiters are
    /// served in arrival order by the underlying limiter.
    pub async fn wait(&self, host: &str) {
        let limiter = self.bucket(host);
        limiter.until_ready().await;
    }

    /// Apply a robots `Crawl-delay` for a host, but only when it is
    /// stricter than the configured pace.
    pub fn apply_crawl_delay(&self, host: &str, delay: Duration) {
        if delay <= self.min_interval {
            return;
        }
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(host.to_string()).or_insert_with(|| HostBucket {
            limiter: Self::limiter_for(self.min_interval),
            interval: self.min_interval,
        });
        if bucket.interval < delay {
            debug!(host, delay_ms = delay.as_millis() as u64, "applying crawl-delay");
            *bucket = HostBucket {
                limiter: Self::limiter_for(delay),
                interval: delay,
            };
        }
    }

    /// Current pace for a host (test and diagnostics hook).
    pub fn interval_for(&self, host: &str) -> Duration {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .get(host)
            .map(|bucket| bucket.interval)
            .unwrap_or(self.min_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn serial_requests_are_paced() {
        // 1200 rpm -> one slot every 50 ms.
        let limiter = HostRateLimiter::new(1_200);

        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait("example.com").await;
        }
        let elapsed = start.elapsed();

        // First request is immediate, the remaining three wait a slot each.
        assert!(elapsed >= Duration::from_millis(140), "paced too fast: {elapsed:?}");
    }

    #[tokio::test]
    async fn hosts_are_paced_independently() {
        let limiter = HostRateLimiter::new(60);

        let start = Instant::now();
        limiter.wait("a.example.com").await;
        limiter.wait("b.example.com").await;
        limiter.wait("c.example.com").await;

        // One immediate slot per host, no cross-host waiting.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn crawl_delay_overrides_only_when_stricter() {
        let limiter = HostRateLimiter::new(60); // 1 s pace

        limiter.apply_crawl_delay("slow.example.com", Duration::from_secs(5));
        assert_eq!(
            limiter.interval_for("slow.example.com"),
            Duration::from_secs(5)
        );

        // A looser delay must not relax the configured pace.
        limiter.apply_crawl_delay("fast.example.com", Duration::from_millis(10));
        assert_eq!(
            limiter.interval_for("fast.example.com"),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn concurrent_waiters_share_the_budget() {
        let limiter = Arc::new(HostRateLimiter::new(1_200)); // 50 ms slots

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait("example.com").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(140));
    }
}
