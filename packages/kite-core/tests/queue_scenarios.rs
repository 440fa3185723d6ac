//! End-to-end scenarios for the queue/worker/DLQ triplet on the memory
//! backend.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kite_core::error::JobError;
use kite_core::jobs::{
    DeadLetterQueue, HandlerRegistry, Job, JobKind, JobPriority, JobQueue, JobStatus, MemoryQueue,
    PoolConfig, QueueMetrics, WorkerPool,
};
use serde_json::{Map, Value};
use uuid::Uuid;

struct Harness {
    queue: Arc<MemoryQueue>,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<QueueMetrics>,
}

fn harness() -> Harness {
    let dlq = Arc::new(DeadLetterQueue::new());
    let metrics = Arc::new(QueueMetrics::new());
    let queue = Arc::new(MemoryQueue::new(dlq.clone(), metrics.clone()));
    Harness {
        queue,
        dlq,
        metrics,
    }
}

fn pool(harness: &Harness, registry: HandlerRegistry, workers: usize) -> WorkerPool {
    pool_with_timeout(harness, registry, workers, Duration::from_secs(300))
}

fn pool_with_timeout(
    harness: &Harness,
    registry: HandlerRegistry,
    workers: usize,
    job_timeout: Duration,
) -> WorkerPool {
    WorkerPool::new(
        harness.queue.clone(),
        Arc::new(registry),
        harness.metrics.clone(),
        PoolConfig {
            worker_count: workers,
            job_timeout,
        },
    )
}

/// Scenario: jobs enqueued [low, high, normal] are processed
/// [high, normal, low] by a single worker.
#[tokio::test]
async fn priority_orders_processing() {
    let harness = harness();
    let order: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    {
        let order = order.clone();
        registry.register_fn(JobKind::Scrape, move |job| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(job.id);
                Ok(Map::new())
            }
        });
    }

    let low = Job::new(JobKind::Scrape, Map::new()).with_priority(JobPriority::Low);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let high = Job::new(JobKind::Scrape, Map::new()).with_priority(JobPriority::High);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let normal = Job::new(JobKind::Scrape, Map::new()).with_priority(JobPriority::Normal);

    harness.queue.enqueue(low.clone()).await.unwrap();
    harness.queue.enqueue(high.clone()).await.unwrap();
    harness.queue.enqueue(normal.clone()).await.unwrap();
    harness.queue.close().await;

    let mut pool = pool(&harness, registry, 1);
    pool.start();
    pool.join().await;

    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec![high.id, normal.id, low.id]);
}

/// Scenario: a handler that always errors exhausts its three attempts and
/// lands in the DLQ.
#[tokio::test]
async fn failing_handler_exhausts_attempts_into_dlq() {
    let harness = harness();

    let mut registry = HandlerRegistry::new();
    registry.register_fn(JobKind::Scrape, |_| async {
        Err(JobError::Network("source is down".into()))
    });

    let job = Job::new(JobKind::Scrape, Map::new());
    let job_id = job.id;
    harness.queue.enqueue(job).await.unwrap();
    harness.queue.close().await;

    let mut pool = pool(&harness, registry, 1);
    pool.start();
    pool.join().await;

    assert_eq!(harness.dlq.size(), 1);
    let dead = harness.dlq.get(job_id).unwrap();
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.status, JobStatus::Failed);
    assert!(dead.error.contains("failed after 3 attempts"));
    assert!(dead.error.contains("source is down"));
}

/// Scenario: a handler that sleeps past the job deadline times out into the
/// DLQ and leaves the worker alive for the next job.
#[tokio::test]
async fn deadline_overrun_dead_letters_and_worker_survives() {
    let harness = harness();

    let mut registry = HandlerRegistry::new();
    registry.register_fn(JobKind::Scrape, |job| async move {
        if job.payload.contains_key("sleep") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(Map::new())
    });

    let mut slow_payload = Map::new();
    slow_payload.insert("sleep".into(), Value::Bool(true));
    let slow = Job::new(JobKind::Scrape, slow_payload).with_max_attempts(1);
    let slow_id = slow.id;
    let healthy = Job::new(JobKind::Scrape, Map::new());
    let healthy_id = healthy.id;

    harness.queue.enqueue(slow).await.unwrap();
    harness.queue.enqueue(healthy).await.unwrap();
    harness.queue.close().await;

    let mut pool = pool_with_timeout(&harness, registry, 1, Duration::from_millis(100));
    pool.start();
    pool.join().await;

    let dead = harness.dlq.get(slow_id).unwrap();
    assert!(dead.error.contains("deadline"));
    assert!(harness.dlq.get(healthy_id).is_none());
    assert_eq!(harness.metrics.snapshot().completed, 1);
}

/// Scenario: 4 workers clear 100 fast jobs; nothing fails and the queue is
/// fully drained.
#[tokio::test]
async fn pool_throughput_over_100_jobs() {
    let harness = harness();

    let mut registry = HandlerRegistry::new();
    registry.register_fn(JobKind::Scrape, |_| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(Map::new())
    });

    for _ in 0..100 {
        harness
            .queue
            .enqueue(Job::new(JobKind::Scrape, Map::new()))
            .await
            .unwrap();
    }
    harness.queue.close().await;

    let started = Instant::now();
    let mut pool = pool(&harness, registry, 4);
    pool.start();
    let states: Vec<_> = pool.worker_states().to_vec();
    pool.join().await;
    let elapsed = started.elapsed();

    let snap = harness.metrics.snapshot();
    assert_eq!(snap.completed, 100);
    assert_eq!(snap.failed, 0);
    assert_eq!(harness.queue.depth().await.unwrap(), 0);

    let processed: u64 = states.iter().map(|s| s.processed()).sum();
    assert_eq!(processed, 100);

    // 100 jobs x 10 ms across 4 workers is ~250 ms of wall time; leave
    // generous scheduler slack.
    assert!(elapsed >= Duration::from_millis(200), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "too slow: {elapsed:?}");
}

/// Graceful drain: stop returns cleanly iff in-flight handlers finish in
/// time, and no worker is left busy afterwards.
#[tokio::test]
async fn graceful_drain_leaves_no_job_running() {
    let harness = harness();

    let mut registry = HandlerRegistry::new();
    registry.register_fn(JobKind::Scrape, |_| async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(Map::new())
    });

    for _ in 0..3 {
        harness
            .queue
            .enqueue(Job::new(JobKind::Scrape, Map::new()))
            .await
            .unwrap();
    }

    let mut pool = pool(&harness, registry, 2);
    pool.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let states: Vec<_> = pool.worker_states().to_vec();
    pool.stop(Duration::from_secs(5)).await.unwrap();

    for state in states {
        assert!(!state.is_busy(), "worker {} still busy after drain", state.id());
    }
}

/// Metrics identity at quiescence: everything enqueued is accounted for by
/// completions, dead letters, pending work, and cancellations.
#[tokio::test]
async fn metrics_balance_at_quiescence() {
    let harness = harness();

    let mut registry = HandlerRegistry::new();
    registry.register_fn(JobKind::Scrape, |job| async move {
        if job.payload.contains_key("poison") {
            Err(JobError::Validation("poison".into()))
        } else {
            Ok(Map::new())
        }
    });

    for i in 0..10 {
        let mut payload = Map::new();
        if i % 3 == 0 {
            payload.insert("poison".into(), Value::Bool(true));
        }
        harness
            .queue
            .enqueue(Job::new(JobKind::Scrape, payload))
            .await
            .unwrap();
    }
    harness.queue.close().await;

    let mut pool = pool(&harness, registry, 3);
    pool.start();
    pool.join().await;

    let snap = harness.metrics.snapshot();
    let pending = harness.queue.depth().await.unwrap() as u64;
    assert_eq!(
        snap.enqueued,
        snap.completed + snap.failed + pending + snap.cancelled
    );
    assert_eq!(snap.failed as usize, harness.dlq.size());
}

/// DLQ retry round-trips a job back through the queue to completion.
#[tokio::test]
async fn dlq_retry_readmits_to_the_main_queue() {
    let first = harness();

    // First pass: everything fails terminally.
    let mut failing = HandlerRegistry::new();
    failing.register_fn(JobKind::Scrape, |_| async {
        Err(JobError::Parse("layout changed".into()))
    });

    let mut payload = Map::new();
    payload.insert("jurisdiction".into(), Value::from("sg"));
    let job = Job::new(JobKind::Scrape, payload);
    let job_id = job.id;
    first.queue.enqueue(job).await.unwrap();
    first.queue.close().await;

    let mut pool1 = pool(&first, failing, 1);
    pool1.start();
    pool1.join().await;
    assert_eq!(first.dlq.size(), 1);

    // Operator retries the dead letter into a fresh queue.
    let retried = first.dlq.retry(job_id).unwrap();
    assert_eq!(retried.id, job_id);
    assert_eq!(retried.attempts, 0);
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.payload["jurisdiction"], Value::from("sg"));

    let second = harness();
    let mut succeeding = HandlerRegistry::new();
    succeeding.register_fn(JobKind::Scrape, |_| async { Ok(Map::new()) });

    second.queue.enqueue(retried).await.unwrap();
    second.queue.close().await;

    let mut pool2 = pool(&second, succeeding, 1);
    pool2.start();
    pool2.join().await;

    assert_eq!(second.metrics.snapshot().completed, 1);
    assert!(second.dlq.is_empty());
}
