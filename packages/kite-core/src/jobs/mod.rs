//! Job infrastructure: model, queue contract and backends, dead-letter
//! queue, metrics, workers, and the handler registry.
//!
//! ```text
//! submitter ─► JobQueue::enqueue ─► backend (memory | NATS | Redis)
//!                                      │
//! Worker ◄── JobQueue::dequeue ────────┘
//!    │
//!    ├─► HandlerRegistry::handle(job)      (bounded deadline)
//!    ├─► ack on success
//!    └─► nack(requeue = should-retry) on failure ─► retry or DLQ
//! ```

pub mod dlq;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod nats;
pub mod pool;
pub mod queue;
pub mod redis;
pub mod registry;
pub mod worker;

use std::sync::Arc;

use anyhow::Context;

use crate::config::{QueueDriver, QueueSettings};

pub use self::dlq::{DeadLetterQueue, DlqStats};
pub use self::job::{Job, JobKind, JobPriority, JobStatus};
pub use self::memory::MemoryQueue;
pub use self::metrics::{MetricsSnapshot, ProcessingStats, QueueMetrics};
pub use self::nats::NatsQueue;
pub use self::pool::{DrainTimeout, PoolConfig, PoolStats, WorkerPool};
pub use self::queue::{JobQueue, QueueError, QueueResult, SharedQueue};
pub use self::redis::RedisQueue;
pub use self::registry::{FnHandler, HandlerRegistry, JobHandler};
pub use self::worker::{CurrentJob, Worker, WorkerConfig, WorkerState};

/// Build the queue backend selected by configuration.
///
/// The dead-letter queue and metrics are shared process-wide: construct
/// them once in the composition root and hand them to the pool as well.
pub async fn build_queue(
    settings: &QueueSettings,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<QueueMetrics>,
) -> anyhow::Result<SharedQueue> {
    let queue: SharedQueue = match settings.driver {
        QueueDriver::Memory => {
            Arc::new(MemoryQueue::new(dlq, metrics).with_retry_delay(settings.retry_delay))
        }
        QueueDriver::Nats => Arc::new(
            NatsQueue::connect(&settings.url, dlq, metrics)
                .await
                .with_context(|| format!("failed to connect NATS queue at {}", settings.url))?
                .with_retry_delay(settings.retry_delay),
        ),
        QueueDriver::Redis => Arc::new(
            RedisQueue::connect(&settings.url, dlq, metrics)
                .await
                .with_context(|| format!("failed to connect Redis queue at {}", settings.url))?
                .with_retry_delay(settings.retry_delay),
        ),
    };
    Ok(queue)
}
