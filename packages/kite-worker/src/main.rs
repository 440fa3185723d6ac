// Main entry point for the kite worker daemon

use std::sync::Arc;

use anyhow::{Context, Result};
use kite_core::jobs::{
    build_queue, DeadLetterQueue, HandlerRegistry, JobKind, PoolConfig, QueueMetrics, WorkerPool,
};
use kite_core::Config;
use kite_scrapers::{FetchClient, MemoryCaseStore, ScrapeHandler, ScraperRegistry};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kite_core=debug,kite_scrapers=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting kite worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        driver = ?config.queue.driver,
        workers = config.worker.count,
        "Configuration loaded"
    );

    // Shared queue infrastructure
    let dlq = Arc::new(DeadLetterQueue::new());
    let metrics = Arc::new(QueueMetrics::new());
    let queue = build_queue(&config.queue, dlq.clone(), metrics.clone())
        .await
        .context("Failed to build job queue")?;

    // Politeness substrate is process-wide: built once, injected into
    // every scraper.
    let fetch = Arc::new(
        FetchClient::from_settings(&config.scraper).context("Failed to build fetch substrate")?,
    );

    let mut scrapers = ScraperRegistry::new();
    register_scrapers(&mut scrapers, fetch);
    if scrapers.is_empty() {
        tracing::warn!("no scrapers registered; scrape jobs will fail validation");
    } else {
        tracing::info!(jurisdictions = ?scrapers.jurisdictions(), "scrapers registered");
    }
    let scrapers = Arc::new(scrapers);
    let store = Arc::new(MemoryCaseStore::new());

    // Handler registry
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        JobKind::Scrape,
        Arc::new(ScrapeHandler::new(scrapers, store)),
    );
    {
        let dlq = dlq.clone();
        handlers.register_fn(JobKind::Cleanup, move |job| {
            let dlq = dlq.clone();
            async move {
                let cleared = if job
                    .payload
                    .get("clear_dlq")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    let size = dlq.size();
                    dlq.clear();
                    size
                } else {
                    0
                };
                let mut result = Map::new();
                result.insert("dlq_cleared".into(), cleared.into());
                Ok(result)
            }
        });
    }

    // Start the pool
    let mut pool = WorkerPool::new(
        queue.clone(),
        Arc::new(handlers),
        metrics.clone(),
        PoolConfig {
            worker_count: config.worker.count,
            job_timeout: config.worker.job_timeout,
        },
    );
    pool.start();

    wait_for_shutdown().await;
    tracing::info!("Shutdown signal received, draining");

    queue.close().await;
    pool.stop(config.worker.shutdown_grace)
        .await
        .context("Workers did not drain within the grace window")?;

    let snapshot = metrics.snapshot();
    tracing::info!(
        completed = snapshot.completed,
        failed = snapshot.failed,
        dead_letters = dlq.size(),
        "kite worker stopped cleanly"
    );
    Ok(())
}

/// Deployment wiring point: construct per-jurisdiction scrapers around the
/// shared fetch substrate and register them here.
fn register_scrapers(_registry: &mut ScraperRegistry, _fetch: Arc<FetchClient>) {}

/// Resolve on SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
