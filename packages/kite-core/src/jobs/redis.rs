//! Redis Streams queue backend.
//!
//! Wire layout: stream `kite:jobs` (main) and `kite:jobs:dlq`, consumer
//! group `kite-workers` with one consumer name per worker process, entries
//! as field-value pairs `{id, type, priority, data=<json job>}`. XADD on
//! enqueue, blocking XREADGROUP on dequeue, explicit XACK on ack/nack.
//!
//! Like the NATS backend, delivery order is the broker's; strict priority
//! is a memory-backend guarantee only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dlq::DeadLetterQueue;
use super::job::Job;
use super::metrics::QueueMetrics;
use super::queue::{JobQueue, QueueError, QueueResult};

pub const MAIN_STREAM: &str = "kite:jobs";
pub const DLQ_STREAM: &str = "kite:jobs:dlq";
pub const GROUP_NAME: &str = "kite-workers";

/// Block interval for XREADGROUP, short enough that cancellation is
/// honored promptly.
const BLOCK_MS: usize = 1_000;

struct InFlight {
    job: Job,
    /// Stream entry id of the pending delivery.
    entry_id: String,
}

/// Redis-Streams-backed queue.
pub struct RedisQueue {
    conn: ConnectionManager,
    consumer_name: String,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<QueueMetrics>,
    closed: AtomicBool,
    retry_delay: std::time::Duration,
}

impl RedisQueue {
    /// Connect and ensure the consumer group exists on the main stream.
    pub async fn connect(
        url: &str,
        dlq: Arc<DeadLetterQueue>,
        metrics: Arc<QueueMetrics>,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(url).map_err(QueueError::backend)?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(QueueError::backend)?;

        // BUSYGROUP just means another process created the group first.
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(MAIN_STREAM)
            .arg(GROUP_NAME)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(QueueError::backend(e));
            }
        }

        let consumer_name = format!("worker-{}", Uuid::new_v4());
        info!(url, stream = MAIN_STREAM, group = GROUP_NAME, consumer = %consumer_name, "connected to Redis queue");

        Ok(Self {
            conn,
            consumer_name,
            in_flight: Mutex::new(HashMap::new()),
            dlq,
            metrics,
            closed: AtomicBool::new(false),
            retry_delay: std::time::Duration::ZERO,
        })
    }

    /// Delay before a nacked job becomes eligible for dequeue again.
    pub fn with_retry_delay(mut self, retry_delay: std::time::Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    async fn xadd(&self, stream: &str, job: &Job) -> QueueResult<()> {
        let data = serde_json::to_string(job).map_err(QueueError::backend)?;
        let mut conn = self.conn.clone();
        let _entry_id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("id")
            .arg(job.id.to_string())
            .arg("type")
            .arg(job.kind.as_str())
            .arg("priority")
            .arg(job.priority.as_str())
            .arg("data")
            .arg(data)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }

    async fn xack(&self, entry_id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn
            .xack(MAIN_STREAM, GROUP_NAME, &[entry_id])
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }

    /// One blocking group read; returns the entry id and decoded job.
    async fn read_one(&self) -> QueueResult<Option<(String, Job)>> {
        let options = StreamReadOptions::default()
            .group(GROUP_NAME, &self.consumer_name)
            .count(1)
            .block(BLOCK_MS);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[MAIN_STREAM], &[">"], &options)
            .await
            .map_err(QueueError::backend)?;

        for key in reply.keys {
            for entry in key.ids {
                let Some(data) = entry.get::<String>("data") else {
                    warn!(entry_id = %entry.id, "stream entry missing data field");
                    self.xack(&entry.id).await?;
                    continue;
                };
                match serde_json::from_str::<Job>(&data) {
                    Ok(job) => return Ok(Some((entry.id, job))),
                    Err(e) => {
                        warn!(entry_id = %entry.id, error = %e, "dropping undecodable job payload");
                        self.xack(&entry.id).await?;
                    }
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.xadd(MAIN_STREAM, &job).await?;
        self.metrics.record_enqueued(&job);
        debug!(job_id = %job.id, kind = %job.kind, "appended job to stream");
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> QueueResult<Job> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                read = self.read_one() => read?,
            };

            let Some((entry_id, mut job)) = read else {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(QueueError::Empty);
                }
                continue;
            };

            if !job.is_due(Utc::now()) {
                // Not due yet: append to the back and release this delivery.
                self.xadd(MAIN_STREAM, &job).await?;
                self.xack(&entry_id).await?;
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
                        entry_id,
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

        self.xack(&entry.entry_id).await
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
            if self.retry_delay > std::time::Duration::ZERO {
                job.scheduled_at = Some(
                    Utc::now()
                        + chrono::Duration::from_std(self.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                );
            }
            self.xadd(MAIN_STREAM, &job).await?;
        } else {
            let reason = if error.is_empty() {
                format!("job failed after {} attempts", job.attempts)
            } else {
                format!("job failed after {} attempts: {}", job.attempts, error)
            };
            job.mark_failed(&reason);
            self.xadd(DLQ_STREAM, &job).await?;
            self.dlq.add(job);
        }

        // Ack last so a broker failure above falls back to redelivery of
        // the pending entry.
        self.xack(&entry.entry_id).await
    }

    async fn depth(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.xlen(MAIN_STREAM).await.map_err(QueueError::backend)?;
        Ok(len.max(0) as usize)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
