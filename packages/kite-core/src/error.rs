//! Typed errors for job execution.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so workers can
//! classify failures when deciding whether to requeue or dead-letter.

use std::time::Duration;

use thiserror::Error;

use crate::jobs::queue::QueueError;

/// Errors surfaced by job handlers and the fetch substrate.
///
/// The variant determines retry behavior: transient conditions are retried
/// until the job's attempt budget is exhausted, permanent ones go straight
/// to the dead-letter queue.
#[derive(Debug, Error)]
pub enum JobError {
    /// Origin unreachable, DNS/TCP/TLS failure, or HTTP non-2xx
    #[error("network error: {0}")]
    Network(String),

    /// Local or upstream rate limit hit
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// robots.txt disallows the path; no request was made
    #[error("robots.txt disallows: {url}")]
    RobotsDisallowed { url: String },

    /// Response received but not interpretable
    #[error("parse error: {0}")]
    Parse(String),

    /// Payload failed schema validation
    #[error("invalid payload: {0}")]
    Validation(String),

    /// Id lookup missed
    #[error("not found: {0}")]
    NotFound(String),

    /// Queue backend error during enqueue/dequeue/ack/nack
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Job exceeded its deadline
    #[error("job exceeded deadline of {0:?}")]
    Timeout(Duration),

    /// Recovered panic or other internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Whether this error should trigger a retry (budget permitting).
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Network(_)
            | JobError::RateLimited(_)
            | JobError::Queue(_)
            | JobError::Timeout(_)
            | JobError::Internal(_) => true,
            JobError::RobotsDisallowed { .. }
            | JobError::Parse(_)
            | JobError::Validation(_)
            | JobError::NotFound(_) => false,
        }
    }
}

/// Result type alias for handler and fetch operations.
pub type JobResult<T> = std::result::Result<T, JobError>;
