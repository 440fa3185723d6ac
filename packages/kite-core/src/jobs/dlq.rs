//! Dead-letter queue: terminal home of jobs that exhausted their retry
//! budget or failed a non-retryable error.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::Job;

/// Aggregate statistics for operator triage.
#[derive(Debug, Clone, Default)]
pub struct DlqStats {
    pub total: usize,
    pub by_kind: HashMap<String, usize>,
    pub by_error: HashMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    /// Mean attempt count at failure time.
    pub avg_attempts: f64,
}

#[derive(Default)]
struct DlqInner {
    jobs: HashMap<Uuid, Job>,
    /// Insertion order for listing.
    order: Vec<Uuid>,
}

/// Keyed-by-id store of terminally failed jobs.
///
/// One instance is shared by every queue backend in the process; broker
/// backends additionally publish dead-lettered jobs to their own DLQ
/// stream for cross-process visibility.
#[derive(Default)]
pub struct DeadLetterQueue {
    inner: Mutex<DlqInner>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a failed job. Re-adding an existing id overwrites the stored
    /// job in place, keeping its position in the listing order.
    pub fn add(&self, job: Job) {
        let id = job.id;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.jobs.insert(id, job).is_none() {
            inner.order.push(id);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.get(&id).cloned()
    }

    /// Jobs in insertion order, windowed by `offset`/`limit`.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<Job> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    pub fn remove(&self, id: Uuid) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed = inner.jobs.remove(&id);
        if removed.is_some() {
            inner.order.retain(|other| *other != id);
        }
        removed
    }

    /// Pop a job and reset it for a fresh run: `attempts = 0`,
    /// `status = pending`, error and timestamps cleared. Re-enqueueing the
    /// returned job is the caller's responsibility.
    pub fn retry(&self, id: Uuid) -> Option<Job> {
        let mut job = self.remove(id)?;
        job.reset_for_retry();
        Some(job)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.clear();
        inner.order.clear();
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn stats(&self) -> DlqStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = DlqStats {
            total: inner.jobs.len(),
            ..Default::default()
        };

        let mut attempts_sum = 0u64;
        for job in inner.jobs.values() {
            *stats.by_kind.entry(job.kind.to_string()).or_default() += 1;
            *stats.by_error.entry(job.error.clone()).or_default() += 1;
            attempts_sum += u64::from(job.attempts);

            let failed_at = job.completed_at.unwrap_or(job.updated_at);
            stats.oldest = Some(match stats.oldest {
                Some(oldest) => oldest.min(failed_at),
                None => failed_at,
            });
            stats.newest = Some(match stats.newest {
                Some(newest) => newest.max(failed_at),
                None => failed_at,
            });
        }

        if stats.total > 0 {
            stats.avg_attempts = attempts_sum as f64 / stats.total as f64;
        }
        stats
    }
}
