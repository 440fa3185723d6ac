//! Queue metrics: counters and a sliding window of processing latencies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::job::{Job, JobKind, JobPriority};

/// Number of processing-time samples kept for percentile queries.
const WINDOW_SIZE: usize = 1_000;

/// Per-kind / per-priority counter breakdowns.
#[derive(Debug, Default)]
struct Breakdowns {
    enqueued_by_kind: HashMap<JobKind, u64>,
    enqueued_by_priority: HashMap<JobPriority, u64>,
    completed_by_kind: HashMap<JobKind, u64>,
    failed_by_kind: HashMap<JobKind, u64>,
}

/// Hour-rotating completed/failed counters for dashboards.
#[derive(Debug)]
struct HourWindow {
    rotated_at: Instant,
    completed: u64,
    failed: u64,
    prev_completed: u64,
    prev_failed: u64,
}

impl Default for HourWindow {
    fn default() -> Self {
        Self {
            rotated_at: Instant::now(),
            completed: 0,
            failed: 0,
            prev_completed: 0,
            prev_failed: 0,
        }
    }
}

impl HourWindow {
    fn rotate_if_stale(&mut self) {
        if self.rotated_at.elapsed() >= Duration::from_secs(3600) {
            self.prev_completed = self.completed;
            self.prev_failed = self.failed;
            self.completed = 0;
            self.failed = 0;
            self.rotated_at = Instant::now();
        }
    }
}

/// Thread-safe queue counters plus a rolling latency window.
///
/// One instance is shared by the queue backend and the worker pool:
/// enqueue/dequeue events are recorded by the queue, handler outcomes and
/// durations by the workers.
#[derive(Default)]
pub struct QueueMetrics {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    breakdowns: Mutex<Breakdowns>,
    window: Mutex<VecDeque<Duration>>,
    hour: Mutex<HourWindow>,
}

/// Point-in-time view of the counters and latency distribution.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub enqueued_by_kind: HashMap<JobKind, u64>,
    pub enqueued_by_priority: HashMap<JobPriority, u64>,
    pub completed_by_kind: HashMap<JobKind, u64>,
    pub failed_by_kind: HashMap<JobKind, u64>,
    pub last_hour_completed: u64,
    pub last_hour_failed: u64,
    pub processing: ProcessingStats,
}

/// Latency distribution over the rolling window.
#[derive(Debug, Clone, Default)]
pub struct ProcessingStats {
    pub samples: usize,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, job: &Job) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let mut breakdowns = self.breakdowns.lock().unwrap_or_else(|e| e.into_inner());
        *breakdowns.enqueued_by_kind.entry(job.kind).or_default() += 1;
        *breakdowns
            .enqueued_by_priority
            .entry(job.priority)
            .or_default() += 1;
    }

    pub fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, kind: JobKind, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        {
            let mut breakdowns = self.breakdowns.lock().unwrap_or_else(|e| e.into_inner());
            *breakdowns.completed_by_kind.entry(kind).or_default() += 1;
        }
        {
            let mut hour = self.hour.lock().unwrap_or_else(|e| e.into_inner());
            hour.rotate_if_stale();
            hour.completed += 1;
        }
        self.push_sample(duration);
    }

    /// A terminal failure (the job landed in the dead-letter queue).
    pub fn record_failed(&self, kind: JobKind, duration: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        {
            let mut breakdowns = self.breakdowns.lock().unwrap_or_else(|e| e.into_inner());
            *breakdowns.failed_by_kind.entry(kind).or_default() += 1;
        }
        {
            let mut hour = self.hour.lock().unwrap_or_else(|e| e.into_inner());
            hour.rotate_if_stale();
            hour.failed += 1;
        }
        self.push_sample(duration);
    }

    /// A failure that was requeued for another attempt.
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn push_sample(&self, duration: Duration) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(duration);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let breakdowns = self.breakdowns.lock().unwrap_or_else(|e| e.into_inner());
        let (last_hour_completed, last_hour_failed) = {
            let mut hour = self.hour.lock().unwrap_or_else(|e| e.into_inner());
            hour.rotate_if_stale();
            // Mid-hour, the live counters are the best "last hour" estimate.
            (
                hour.completed.max(hour.prev_completed),
                hour.failed.max(hour.prev_failed),
            )
        };

        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            enqueued_by_kind: breakdowns.enqueued_by_kind.clone(),
            enqueued_by_priority: breakdowns.enqueued_by_priority.clone(),
            completed_by_kind: breakdowns.completed_by_kind.clone(),
            failed_by_kind: breakdowns.failed_by_kind.clone(),
            last_hour_completed,
            last_hour_failed,
            processing: self.processing_stats(),
        }
    }

    /// Sorts a copy of the window on each query; n is capped at 1,000.
    fn processing_stats(&self) -> ProcessingStats {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<Duration> = window.iter().copied().collect();
        sorted.sort_unstable();

        let total: Duration = sorted.iter().sum();
        let n = sorted.len();

        ProcessingStats {
            samples: n,
            min: sorted[0],
            max: sorted[n - 1],
            avg: total / n as u32,
            p50: percentile(&sorted, 50),
            p95: percentile(&sorted, 95),
            p99: percentile(&sorted, 99),
        }
    }
}

/// Percentile `p` selected at index `n * p / 100` of the sorted samples.
fn percentile(sorted: &[Duration], p: usize) -> Duration {
    let idx = (sorted.len() * p / 100).min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn job(kind: JobKind, priority: JobPriority) -> Job {
        Job::new(kind, Map::new()).with_priority(priority)
    }

    #[test]
    fn counters_track_events() {
        let metrics = QueueMetrics::new();
        metrics.record_enqueued(&job(JobKind::Scrape, JobPriority::High));
        metrics.record_enqueued(&job(JobKind::Export, JobPriority::Normal));
        metrics.record_dequeued();
        metrics.record_completed(JobKind::Scrape, Duration::from_millis(10));
        metrics.record_retried();
        metrics.record_failed(JobKind::Export, Duration::from_millis(20));

        let snap = metrics.snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.dequeued, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.enqueued_by_kind[&JobKind::Scrape], 1);
        assert_eq!(snap.enqueued_by_priority[&JobPriority::High], 1);
        assert_eq!(snap.completed_by_kind[&JobKind::Scrape], 1);
        assert_eq!(snap.failed_by_kind[&JobKind::Export], 1);
    }

    #[test]
    fn percentiles_over_known_distribution() {
        let metrics = QueueMetrics::new();
        for ms in 1..=100u64 {
            metrics.record_completed(JobKind::Scrape, Duration::from_millis(ms));
        }

        let stats = metrics.snapshot().processing;
        assert_eq!(stats.samples, 100);
        assert_eq!(stats.min, Duration::from_millis(1));
        assert_eq!(stats.max, Duration::from_millis(100));
        // index n*p/100 over [1ms..100ms] sorted
        assert_eq!(stats.p50, Duration::from_millis(51));
        assert_eq!(stats.p95, Duration::from_millis(96));
        assert_eq!(stats.p99, Duration::from_millis(100));
    }

    #[test]
    fn window_trims_fifo_at_capacity() {
        let metrics = QueueMetrics::new();
        for ms in 0..1_100u64 {
            metrics.record_completed(JobKind::Scrape, Duration::from_millis(ms));
        }

        let stats = metrics.snapshot().processing;
        assert_eq!(stats.samples, 1_000);
        // The first 100 samples fell out of the window.
        assert_eq!(stats.min, Duration::from_millis(100));
    }

    #[test]
    fn last_hour_counters_reflect_current_hour() {
        let metrics = QueueMetrics::new();
        metrics.record_completed(JobKind::Scrape, Duration::from_millis(1));
        metrics.record_failed(JobKind::Scrape, Duration::from_millis(1));

        let snap = metrics.snapshot();
        assert_eq!(snap.last_hour_completed, 1);
        assert_eq!(snap.last_hour_failed, 1);
    }

    #[test]
    fn empty_window_yields_zeroed_stats() {
        let metrics = QueueMetrics::new();
        let stats = metrics.snapshot().processing;
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.p99, Duration::ZERO);
    }
}
