//! In-memory job queue backend.
//!
//! A single priority heap plus an id -> job in-flight map behind one mutex,
//! with a notify primitive for "not empty". Provides strict priority order
//! (high first, FIFO within a band), which the broker backends do not.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::dlq::DeadLetterQueue;
use super::job::Job;
use super::metrics::QueueMetrics;
use super::queue::{JobQueue, QueueError, QueueResult};

/// Heap entry ordered by (priority, earliest created_at, insertion seq).
struct PendingEntry {
    seq: u64,
    job: Job,
}

impl PendingEntry {
    fn key(&self) -> (super::job::JobPriority, DateTime<Utc>, u64) {
        (self.job.priority, self.job.created_at, self.seq)
    }
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let (priority, created_at, seq) = self.key();
        let (other_priority, other_created_at, other_seq) = other.key();
        // Max-heap: higher priority wins, then earlier creation, then
        // earlier insertion.
        priority
            .cmp(&other_priority)
            .then_with(|| other_created_at.cmp(&created_at))
            .then_with(|| other_seq.cmp(&seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<PendingEntry>,
    /// Jobs with a future `scheduled_at`, promoted once due.
    scheduled: Vec<Job>,
    in_flight: HashMap<Uuid, Job>,
    /// Tombstones for administratively cancelled pending jobs.
    cancelled: HashSet<Uuid>,
    seq: u64,
    closed: bool,
}

impl Inner {
    fn push_pending(&mut self, job: Job) {
        self.seq += 1;
        self.heap.push(PendingEntry { seq: self.seq, job });
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut i = 0;
        while i < self.scheduled.len() {
            if self.scheduled[i].is_due(now) {
                let job = self.scheduled.swap_remove(i);
                self.push_pending(job);
            } else {
                i += 1;
            }
        }
    }

    fn pending_len(&self) -> usize {
        let tombstoned = self
            .heap
            .iter()
            .filter(|entry| self.cancelled.contains(&entry.job.id))
            .count();
        self.heap.len() - tombstoned + self.scheduled.len()
    }

    /// Earliest wait until a scheduled job becomes due.
    fn next_due_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.scheduled
            .iter()
            .filter_map(|job| job.scheduled_at)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Memory-backed queue; process-local, no cross-process visibility.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<QueueMetrics>,
    retry_delay: Duration,
}

impl MemoryQueue {
    pub fn new(dlq: Arc<DeadLetterQueue>, metrics: Arc<QueueMetrics>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            dlq,
            metrics,
            retry_delay: Duration::ZERO,
        }
    }

    /// Delay before a nacked job becomes eligible for dequeue again.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Administratively cancel a pending or scheduled job.
    ///
    /// Running jobs are not interrupted; returns whether a job was removed.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut inner = self.lock();
        if let Some(pos) = inner.scheduled.iter().position(|job| job.id == id) {
            inner.scheduled.swap_remove(pos);
            self.metrics.record_cancelled();
            return true;
        }
        let pending = inner
            .heap
            .iter()
            .any(|entry| entry.job.id == id && !inner.cancelled.contains(&id));
        if pending {
            inner.cancelled.insert(id);
            self.metrics.record_cancelled();
        }
        pending
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            self.metrics.record_enqueued(&job);
            if job.is_due(Utc::now()) {
                inner.push_pending(job);
            } else {
                inner.scheduled.push(job);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> QueueResult<Job> {
        loop {
            let wait_for = {
                let mut inner = self.lock();
                inner.promote_due(Utc::now());

                while let Some(entry) = inner.heap.pop() {
                    if inner.cancelled.remove(&entry.job.id) {
                        continue;
                    }
                    let mut job = entry.job;
                    job.mark_started();
                    inner.in_flight.insert(job.id, job.clone());
                    if !inner.heap.is_empty() {
                        // Another waiter may be parked while work remains.
                        self.notify.notify_one();
                    }
                    self.metrics.record_dequeued();
                    return Ok(job);
                }

                if inner.closed && inner.scheduled.is_empty() {
                    return Err(QueueError::Empty);
                }
                inner.next_due_in(Utc::now())
            };

            let sleep_for = wait_for.unwrap_or(Duration::from_secs(60));
            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, id: Uuid) -> QueueResult<()> {
        let mut inner = self.lock();
        inner
            .in_flight
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::NotFound(id))
    }

    async fn nack(&self, id: Uuid, error: &str, requeue: bool) -> QueueResult<()> {
        let requeued = {
            let mut inner = self.lock();
            let mut job = inner
                .in_flight
                .remove(&id)
                .ok_or(QueueError::NotFound(id))?;

            job.mark_retrying(error);
            if requeue && job.should_retry() {
                job.mark_requeued();
                if self.retry_delay > Duration::ZERO {
                    job.scheduled_at = Some(
                        Utc::now()
                            + chrono::Duration::from_std(self.retry_delay)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    inner.scheduled.push(job);
                } else {
                    inner.push_pending(job);
                }
                true
            } else {
                let reason = if error.is_empty() {
                    format!("job failed after {} attempts", job.attempts)
                } else {
                    format!("job failed after {} attempts: {}", job.attempts, error)
                };
                debug!(job_id = %id, attempts = job.attempts, "dead-lettering job");
                job.mark_failed(&reason);
                self.dlq.add(job);
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn depth(&self) -> QueueResult<usize> {
        Ok(self.lock().pending_len())
    }

    async fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }
}
