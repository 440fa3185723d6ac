//! Worker: a single concurrent execution unit.
//!
//! Each worker owns a loop: dequeue one job, run the handler under a
//! bounded deadline, ack on success, nack with `requeue = should-retry` on
//! failure. Ack/nack errors are logged and never crash the worker; handler
//! panics are recovered and treated as retryable internal failures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{Job, JobKind};
use super::metrics::QueueMetrics;
use super::queue::{QueueError, SharedQueue};
use super::registry::JobHandler;
use crate::error::JobError;

/// Per-worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard cap on a single handler invocation.
    pub job_timeout: Duration,
    /// Sleep after a transient dequeue error before retrying.
    pub poll_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            poll_backoff: Duration::from_millis(100),
        }
    }
}

/// Shared, lock-cheap view of a worker's state.
///
/// The busy flag and counters are atomics; only the current-job pointer
/// sits behind a mutex.
#[derive(Default)]
pub struct WorkerState {
    id: usize,
    busy: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
    current_job: Mutex<Option<CurrentJob>>,
}

/// What a worker is holding right now.
#[derive(Debug, Clone)]
pub struct CurrentJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub attempt: u32,
}

impl WorkerState {
    fn with_id(id: usize) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn current_job(&self) -> Option<CurrentJob> {
        self.current_job
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mean handler duration across both successes and failures.
    pub fn avg_duration(&self) -> Duration {
        let total = self.processed() + self.failed();
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_duration_ms.load(Ordering::Relaxed) / total)
    }

    fn start_job(&self, job: &Job) {
        self.busy.store(true, Ordering::Relaxed);
        *self.current_job.lock().unwrap_or_else(|e| e.into_inner()) = Some(CurrentJob {
            id: job.id,
            kind: job.kind,
            attempt: job.attempts,
        });
    }

    fn finish_job(&self, succeeded: bool, duration: Duration) {
        if succeeded {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        *self.current_job.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.busy.store(false, Ordering::Relaxed);
    }
}

/// A single worker in the pool.
pub struct Worker {
    queue: SharedQueue,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<QueueMetrics>,
    config: WorkerConfig,
    state: Arc<WorkerState>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: SharedQueue,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<QueueMetrics>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            metrics,
            config,
            state: Arc::new(WorkerState::with_id(id)),
        }
    }

    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    /// Main loop; exits when `shutdown` fires or the queue drains closed.
    pub async fn run(self, shutdown: CancellationToken) {
        let worker_id = self.state.id;
        debug!(worker_id, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let job = match self.queue.dequeue(&shutdown).await {
                Ok(job) => job,
                Err(QueueError::Cancelled) => break,
                Err(QueueError::Closed) | Err(QueueError::Empty) => {
                    debug!(worker_id, "queue drained, worker exiting");
                    break;
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "dequeue failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_backoff) => {}
                    }
                    continue;
                }
            };

            // An in-flight handler always finishes under its own deadline,
            // even during shutdown (graceful drain).
            self.process(job).await;
        }

        info!(
            worker_id,
            processed = self.state.processed(),
            failed = self.state.failed(),
            "worker stopped"
        );
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        let kind = job.kind;
        self.state.start_job(&job);
        let started = Instant::now();

        let result = self.run_handler(&job).await;
        let duration = started.elapsed();

        match result {
            Ok(_) => {
                debug!(job_id = %job_id, kind = %kind, duration_ms = duration.as_millis() as u64, "job succeeded");
                if let Err(e) = self.queue.ack(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to ack job");
                }
                self.metrics.record_completed(kind, duration);
                self.state.finish_job(true, duration);
            }
            Err(err) => {
                let requeue = err.is_retryable() && job.attempts < job.max_attempts;
                warn!(
                    job_id = %job_id,
                    kind = %kind,
                    attempt = job.attempts,
                    error = %err,
                    will_retry = requeue,
                    "job failed"
                );
                if let Err(e) = self.queue.nack(job_id, &err.to_string(), requeue).await {
                    error!(job_id = %job_id, error = %e, "failed to nack job");
                }
                if requeue {
                    self.metrics.record_retried();
                } else {
                    self.metrics.record_failed(kind, duration);
                }
                self.state.finish_job(false, duration);
            }
        }
    }

    /// Run the handler on its own task so a panic is contained, bounded by
    /// the per-job deadline.
    async fn run_handler(&self, job: &Job) -> Result<serde_json::Map<String, serde_json::Value>, JobError> {
        let handler = self.handler.clone();
        let job = job.clone();
        let mut task = tokio::spawn(async move { handler.handle(&job).await });

        match tokio::time::timeout(self.config.job_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    Err(JobError::Internal(format!(
                        "handler panicked: {}",
                        panic_message(join_err)
                    )))
                } else {
                    Err(JobError::Internal("handler task aborted".to_string()))
                }
            }
            Err(_elapsed) => {
                task.abort();
                Err(JobError::Timeout(self.config.job_timeout))
            }
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::dlq::DeadLetterQueue;
    use crate::jobs::job::JobStatus;
    use crate::jobs::memory::MemoryQueue;
    use crate::jobs::queue::JobQueue;
    use crate::jobs::registry::HandlerRegistry;
    use serde_json::Map;

    fn setup(
        handler: HandlerRegistry,
        config: WorkerConfig,
    ) -> (Arc<MemoryQueue>, Arc<QueueMetrics>, Worker) {
        let dlq = Arc::new(DeadLetterQueue::new());
        let metrics = Arc::new(QueueMetrics::new());
        let queue = Arc::new(MemoryQueue::new(dlq, metrics.clone()));
        let worker = Worker::new(
            0,
            queue.clone(),
            Arc::new(handler),
            metrics.clone(),
            config,
        );
        (queue, metrics, worker)
    }

    #[tokio::test]
    async fn worker_acks_successful_jobs() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::Scrape, |_| async { Ok(Map::new()) });
        let (queue, metrics, worker) = setup(registry, WorkerConfig::default());

        queue
            .enqueue(Job::new(JobKind::Scrape, Map::new()))
            .await
            .unwrap();
        queue.close().await;

        let state = worker.state();
        worker.run(CancellationToken::new()).await;

        assert_eq!(state.processed(), 1);
        assert_eq!(state.failed(), 0);
        assert_eq!(metrics.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn failing_job_is_retried_until_dead_lettered() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::Scrape, |_| async {
            Err(JobError::Network("connection refused".into()))
        });
        let (queue, metrics, worker) = setup(registry, WorkerConfig::default());

        let job = Job::new(JobKind::Scrape, Map::new());
        let job_id = job.id;
        queue.enqueue(job).await.unwrap();
        queue.close().await;

        worker.run(CancellationToken::new()).await;

        let dlq = queue.dead_letters();
        assert_eq!(dlq.size(), 1);
        let dead = dlq.get(job_id).unwrap();
        assert_eq!(dead.attempts, 3);
        assert_eq!(dead.status, JobStatus::Failed);

        let snap = metrics.snapshot();
        assert_eq!(snap.retried, 2);
        assert_eq!(snap.failed, 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_skip_the_retry_budget() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::Scrape, |_| async {
            Err(JobError::Validation("bad payload".into()))
        });
        let (queue, _metrics, worker) = setup(registry, WorkerConfig::default());

        let job = Job::new(JobKind::Scrape, Map::new());
        let job_id = job.id;
        queue.enqueue(job).await.unwrap();
        queue.close().await;

        worker.run(CancellationToken::new()).await;

        let dead = queue.dead_letters().get(job_id).unwrap();
        assert_eq!(dead.attempts, 1);
    }

    #[tokio::test]
    async fn handler_panic_is_recovered_and_retried() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::Scrape, |_| async {
            panic!("scraper exploded");
        });
        let (queue, _metrics, worker) = setup(registry, WorkerConfig::default());

        let job = Job::new(JobKind::Scrape, Map::new()).with_max_attempts(1);
        let job_id = job.id;
        queue.enqueue(job).await.unwrap();
        queue.close().await;

        // The worker must survive the panic and drain normally.
        worker.run(CancellationToken::new()).await;

        let dead = queue.dead_letters().get(job_id).unwrap();
        assert!(dead.error.contains("scraper exploded"));
    }

    #[tokio::test]
    async fn slow_handler_hits_the_deadline() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::Scrape, |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Map::new())
        });
        let config = WorkerConfig {
            job_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (queue, _metrics, worker) = setup(registry, config);

        let job = Job::new(JobKind::Scrape, Map::new()).with_max_attempts(1);
        let job_id = job.id;
        queue.enqueue(job).await.unwrap();
        queue.close().await;

        worker.run(CancellationToken::new()).await;

        let dead = queue.dead_letters().get(job_id).unwrap();
        assert!(dead.error.contains("deadline"));
    }
}
