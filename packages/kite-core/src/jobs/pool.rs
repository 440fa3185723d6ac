//! Worker pool: owns the workers, propagates shutdown, waits for drain.
//!
//! ```text
//! WorkerPool
//!     │
//!     ├─► spawn N workers (shared queue + handler)
//!     ├─► Stop: cancel root token
//!     └─► wait for join handles up to the grace window
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::metrics::QueueMetrics;
use super::queue::SharedQueue;
use super::registry::JobHandler;
use super::worker::{Worker, WorkerConfig, WorkerState};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// Hard cap on a single handler invocation.
    pub job_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            job_timeout: Duration::from_secs(300),
        }
    }
}

/// Read-only snapshot of pool activity.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub worker_count: usize,
    pub busy_workers: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    /// busy_workers / worker_count, 0.0 for an empty pool.
    pub utilization: f64,
    /// Slowest per-worker average handler duration.
    pub slowest_avg: Duration,
}

/// Returned by [`WorkerPool::stop`] when in-flight handlers outlive the
/// grace window. The worker tasks detach; the process usually exits next.
#[derive(Debug, Error)]
#[error("pool drain timed out after {timeout:?} with {still_busy} workers busy")]
pub struct DrainTimeout {
    pub timeout: Duration,
    pub still_busy: usize,
}

/// A fixed set of workers pulling from one queue.
///
/// The pool exclusively owns its workers; workers hold only their id, the
/// queue handle, and the handler. Stats are pulled by the pool on demand.
pub struct WorkerPool {
    queue: SharedQueue,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<QueueMetrics>,
    config: PoolConfig,
    root: CancellationToken,
    states: Vec<Arc<WorkerState>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        queue: SharedQueue,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<QueueMetrics>,
        config: PoolConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            metrics,
            config,
            root: CancellationToken::new(),
            states: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Launch the configured number of workers.
    pub fn start(&mut self) {
        let worker_config = WorkerConfig {
            job_timeout: self.config.job_timeout,
            ..Default::default()
        };

        for id in 0..self.config.worker_count {
            let worker = Worker::new(
                id,
                self.queue.clone(),
                self.handler.clone(),
                self.metrics.clone(),
                worker_config.clone(),
            );
            self.states.push(worker.state());
            let shutdown = self.root.clone();
            self.handles.push(tokio::spawn(worker.run(shutdown)));
        }

        info!(worker_count = self.config.worker_count, "worker pool started");
    }

    /// Trigger graceful shutdown and wait up to `timeout` for the workers
    /// to finish their current jobs.
    pub async fn stop(mut self, timeout: Duration) -> Result<(), DrainTimeout> {
        info!(timeout_ms = timeout.as_millis() as u64, "stopping worker pool");
        self.root.cancel();

        let handles = std::mem::take(&mut self.handles);
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("worker pool drained");
                Ok(())
            }
            Err(_) => {
                let still_busy = self
                    .states
                    .iter()
                    .filter(|state| state.is_busy())
                    .count();
                warn!(still_busy, "worker pool drain timed out");
                Err(DrainTimeout {
                    timeout,
                    still_busy,
                })
            }
        }
    }

    /// Wait for every worker to exit on its own (queue drained closed).
    pub async fn join(mut self) {
        for handle in std::mem::take(&mut self.handles) {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let worker_count = self.states.len();
        let busy_workers = self
            .states
            .iter()
            .filter(|state| state.is_busy())
            .count();
        let total_processed = self.states.iter().map(|s| s.processed()).sum();
        let total_failed = self.states.iter().map(|s| s.failed()).sum();
        let slowest_avg = self
            .states
            .iter()
            .map(|s| s.avg_duration())
            .max()
            .unwrap_or(Duration::ZERO);

        PoolStats {
            worker_count,
            busy_workers,
            total_processed,
            total_failed,
            utilization: if worker_count == 0 {
                0.0
            } else {
                busy_workers as f64 / worker_count as f64
            },
            slowest_avg,
        }
    }

    pub fn worker_states(&self) -> &[Arc<WorkerState>] {
        &self.states
    }
}
