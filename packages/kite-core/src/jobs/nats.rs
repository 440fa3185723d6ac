//! NATS JetStream queue backend.
//!
//! Wire layout: one stream `KITE_JOBS` with subjects `jobs.<kind>` plus
//! `jobs.dlq`, work-queue retention, file storage, 7-day max age; one
//! durable pull consumer `kite-workers` (30 s ack-wait, max-deliver 3)
//! filtered to the kind subjects so dead-lettered payloads are never
//! redelivered as work.
//!
//! Priority degenerates to broker delivery order here; the memory backend
//! is the one that guarantees strict priority. Correctness never depends
//! on cross-consumer ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::PullConsumer,
    stream::{RetentionPolicy, StorageType},
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dlq::DeadLetterQueue;
use super::job::{Job, JobKind};
use super::metrics::QueueMetrics;
use super::queue::{JobQueue, QueueError, QueueResult};

pub const STREAM_NAME: &str = "KITE_JOBS";
pub const CONSUMER_NAME: &str = "kite-workers";
pub const DLQ_SUBJECT: &str = "jobs.dlq";

const ACK_WAIT: Duration = Duration::from_secs(30);
const MAX_DELIVER: i64 = 3;
const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// How long a single pull waits before dequeue re-checks for cancellation.
const FETCH_WAIT: Duration = Duration::from_secs(5);

/// Subject a job kind is published on.
pub fn subject_for(kind: JobKind) -> String {
    format!("jobs.{kind}")
}

struct InFlight {
    job: Job,
    message: jetstream::Message,
}

/// JetStream-backed queue.
pub struct NatsQueue {
    jetstream: jetstream::Context,
    consumer: PullConsumer,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<QueueMetrics>,
    closed: AtomicBool,
    retry_delay: Duration,
}

impl NatsQueue {
    /// Connect and ensure the stream and the durable consumer exist.
    pub async fn connect(
        url: &str,
        dlq: Arc<DeadLetterQueue>,
        metrics: Arc<QueueMetrics>,
    ) -> QueueResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(QueueError::backend)?;
        let jetstream = jetstream::new(client);

        let mut subjects: Vec<String> = JobKind::ALL.iter().map(|kind| subject_for(*kind)).collect();
        subjects.push(DLQ_SUBJECT.to_string());

        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: subjects.into_iter().map(Into::into).collect(),
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                max_age: MAX_AGE,
                ..Default::default()
            })
            .await
            .map_err(QueueError::backend)?;

        let consumer = stream
            .get_or_create_consumer(
                CONSUMER_NAME,
                jetstream::consumer::pull::Config {
                    durable_name: Some(CONSUMER_NAME.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_deliver: MAX_DELIVER,
                    filter_subjects: JobKind::ALL
                        .iter()
                        .map(|kind| subject_for(*kind))
                        .collect(),
                    ..Default::default()
                },
            )
            .await
            .map_err(QueueError::backend)?;

        info!(url, stream = STREAM_NAME, consumer = CONSUMER_NAME, "connected to NATS queue");

        Ok(Self {
            jetstream,
            consumer,
            in_flight: Mutex::new(HashMap::new()),
            dlq,
            metrics,
            closed: AtomicBool::new(false),
            retry_delay: Duration::ZERO,
        })
    }

    /// Delay before a nacked job becomes eligible for dequeue again.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    async fn publish(&self, subject: String, job: &Job) -> QueueResult<()> {
        let payload = serde_json::to_vec(job).map_err(QueueError::backend)?;
        self.jetstream
            .publish(subject, payload.into())
            .await
            .map_err(QueueError::backend)?
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }

    /// Pull at most one message, bounded by [`FETCH_WAIT`].
    async fn fetch_one(&self) -> QueueResult<Option<jetstream::Message>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(FETCH_WAIT)
            .messages()
            .await
            .map_err(QueueError::backend)?;

        match batch.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(QueueError::backend(e)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobQueue for NatsQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.publish(subject_for(job.kind), &job).await?;
        self.metrics.record_enqueued(&job);
        debug!(job_id = %job.id, kind = %job.kind, "published job");
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> QueueResult<Job> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let message = tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                fetched = self.fetch_one() => fetched?,
            };

            let Some(message) = message else {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(QueueError::Empty);
                }
                continue;
            };

            let mut job: Job = match serde_json::from_slice(&message.payload) {
                Ok(job) => job,
                Err(e) => {
                    // Poison message: ack it away rather than loop on it.
                    warn!(error = %e, "dropping undecodable job payload");
                    if let Err(e) = message.ack().await {
                        warn!(error = %e, "failed to ack poison message");
                    }
                    continue;
                }
            };

            if !job.is_due(Utc::now()) {
                // Not due yet: push to the back of the stream and release
                // this delivery.
                self.publish(subject_for(job.kind), &job).await?;
                if let Err(e) = message.ack().await {
                    warn!(job_id = %job.id, error = %e, "failed to ack deferred job");
                }
                continue;
            }

            job.mark_started();
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    job.id,
                    InFlight {
                        job: job.clone(),
                        message,
                    },
                );
            self.metrics.record_dequeued();
            return Ok(job);
        }
    }

    async fn ack(&self, id: Uuid) -> QueueResult<()> {
        let entry = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .ok_or(QueueError::NotFound(id))?;

        entry.message.ack().await.map_err(QueueError::backend)?;
        Ok(())
    }

    async fn nack(&self, id: Uuid, error: &str, requeue: bool) -> QueueResult<()> {
        let entry = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .ok_or(QueueError::NotFound(id))?;

        let mut job = entry.job;
        job.mark_retrying(error);

        if requeue && job.should_retry() {
            job.mark_requeued();
            if self.retry_delay > Duration::ZERO {
                job.scheduled_at = Some(
                    Utc::now()
                        + chrono::Duration::from_std(self.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                );
            }
            self.publish(subject_for(job.kind), &job).await?;
        } else {
            let reason = if error.is_empty() {
                format!("job failed after {} attempts", job.attempts)
            } else {
                format!("job failed after {} attempts: {}", job.attempts, error)
            };
            job.mark_failed(&reason);
            self.publish(DLQ_SUBJECT.to_string(), &job).await?;
            self.dlq.add(job);
        }

        // Release the delivery only after the republish landed, so a
        // broker failure above falls back to redelivery.
        entry.message.ack().await.map_err(QueueError::backend)?;
        Ok(())
    }

    async fn depth(&self) -> QueueResult<usize> {
        let mut stream = self
            .jetstream
            .get_stream(STREAM_NAME)
            .await
            .map_err(QueueError::backend)?;
        let info = stream.info().await.map_err(QueueError::backend)?;
        Ok(info.state.messages as usize)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
