//! Politeness scenarios: robots compliance and per-host pacing against a
//! local HTTP server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kite_core::error::JobError;
use kite_core::ScraperSettings;
use kite_scrapers::FetchClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP/1.1 server: serves a fixed robots.txt and "ok" for every
/// other path, counting non-robots requests.
struct TestServer {
    addr: SocketAddr,
    page_hits: Arc<AtomicUsize>,
}

impl TestServer {
    async fn spawn(robots_body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let page_hits = Arc::new(AtomicUsize::new(0));

        let hits = page_hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let hits = hits.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut request = Vec::new();
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                request.extend_from_slice(&buf[..n]);
                                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }

                    let head = String::from_utf8_lossy(&request);
                    let path = head
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();

                    let body = if path == "/robots.txt" {
                        robots_body
                    } else {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, page_hits }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn page_hits(&self) -> usize {
        self.page_hits.load(Ordering::SeqCst)
    }
}

fn settings(rate_limit_per_min: u32) -> ScraperSettings {
    ScraperSettings {
        rate_limit_per_min,
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Scenario: a disallowed path is refused before any request reaches the
/// host; an allowed path goes through.
#[tokio::test]
async fn robots_disallow_blocks_without_a_request() {
    let server = TestServer::spawn("ignored").await;
    let fetch = FetchClient::from_settings(&settings(60_000)).unwrap();

    // Prime the cache so even the robots.txt fetch is skipped.
    fetch.robots().prime(
        &server.url("/"),
        "User-agent: *\nDisallow: /secret",
    );

    let err = fetch.get(&server.url("/secret")).await.unwrap_err();
    assert!(matches!(err, JobError::RobotsDisallowed { .. }));
    assert_eq!(server.page_hits(), 0);

    let response = fetch.get(&server.url("/public")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");
    assert_eq!(server.page_hits(), 1);
}

/// The robots.txt is fetched lazily from the origin itself and applied.
#[tokio::test]
async fn robots_rules_are_fetched_lazily() {
    let server = TestServer::spawn("User-agent: *\nDisallow: /cases/*/download").await;
    let fetch = FetchClient::from_settings(&settings(60_000)).unwrap();

    let err = fetch
        .get(&server.url("/cases/2024/download"))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::RobotsDisallowed { .. }));
    assert_eq!(server.page_hits(), 0);

    let response = fetch.get(&server.url("/cases/2024/view")).await.unwrap();
    assert_eq!(response.status, 200);
}

/// Scenario: serial fetches to one host are paced at the configured rate;
/// none of them fails for rate reasons.
#[tokio::test]
async fn serial_fetches_are_paced_at_the_configured_rate() {
    let server = TestServer::spawn("User-agent: *\nAllow: /").await;
    // 1200 rpm -> one slot every 50 ms.
    let fetch = FetchClient::from_settings(&settings(1_200)).unwrap();

    let start = Instant::now();
    for i in 0..5 {
        let response = fetch.get(&server.url(&format!("/page/{i}"))).await.unwrap();
        assert_eq!(response.status, 200);
    }
    let elapsed = start.elapsed();

    // First request is immediate; four more wait ~50 ms each.
    assert!(elapsed >= Duration::from_millis(190), "paced too fast: {elapsed:?}");
    assert_eq!(server.page_hits(), 5);
}

/// A robots crawl-delay stricter than the configured rate slows the host
/// down further.
#[tokio::test]
async fn crawl_delay_tightens_the_pace() {
    let server = TestServer::spawn("User-agent: *\nAllow: /\nCrawl-delay: 1").await;
    let fetch = FetchClient::from_settings(&settings(60_000)).unwrap();

    let start = Instant::now();
    for i in 0..2 {
        fetch.get(&server.url(&format!("/page/{i}"))).await.unwrap();
    }

    // Second request waits out the 1 s crawl-delay.
    assert!(start.elapsed() >= Duration::from_millis(900));
}
