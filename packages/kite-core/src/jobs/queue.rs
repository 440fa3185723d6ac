//! Queue contract shared by the memory, NATS, and Redis backends.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::job::Job;

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed; no further enqueues are accepted
    #[error("queue is closed")]
    Closed,

    /// The queue is closed and fully drained
    #[error("queue is empty")]
    Empty,

    /// No pending or in-flight job with this id
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Dequeue wait was cancelled by the caller
    #[error("dequeue cancelled")]
    Cancelled,

    /// Broker or serialization failure
    #[error("queue backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl QueueError {
    /// Wrap any backend error (connection loss, codec failure).
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        QueueError::Backend(err.into())
    }
}

/// Result type alias for queue operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Capability contract for job queues.
///
/// Backends share no state, only this contract; selection is by
/// configuration. Delivery is at-least-once: handlers must tolerate a
/// redelivered job (idempotent storage writes).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Atomically insert a pending job.
    ///
    /// Fails with [`QueueError::Closed`] once the queue is closed. Succeeds
    /// even if the same id sits in the dead-letter queue (the retry path
    /// re-admits it). Priority is honored on the next dequeue.
    async fn enqueue(&self, job: Job) -> QueueResult<()>;

    /// Block until a job is available or `cancel` fires.
    ///
    /// Returns exactly one job, marked running with `started_at` stamped and
    /// `attempts` incremented. Concurrent callers receive disjoint jobs.
    /// Jobs with a future `scheduled_at` are held back until due. When the
    /// queue is closed and drained, returns [`QueueError::Empty`].
    async fn dequeue(&self, cancel: &CancellationToken) -> QueueResult<Job>;

    /// Confirm successful handling; the job leaves the system and any
    /// broker-side reservation is released.
    ///
    /// Re-acking an unknown id is a safe, observable [`QueueError::NotFound`].
    async fn ack(&self, id: Uuid) -> QueueResult<()>;

    /// Report failed handling.
    ///
    /// With `requeue` and retry budget remaining, the job is re-admitted
    /// preserving identity; otherwise it is exiled to the dead-letter queue
    /// with a reason built from `error` and the attempt count.
    async fn nack(&self, id: Uuid, error: &str, requeue: bool) -> QueueResult<()>;

    /// Best-effort size of the pending set. Broker backends may report the
    /// broker's stream depth rather than local state.
    async fn depth(&self) -> QueueResult<usize>;

    /// Reject new enqueues; pending jobs keep draining through dequeue.
    async fn close(&self);
}

/// Shared handle to a queue backend.
pub type SharedQueue = Arc<dyn JobQueue>;
