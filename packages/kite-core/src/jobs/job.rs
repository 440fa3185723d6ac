//! Job model for background work execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// The closed set of job types the handler registry can dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[default]
    Scrape,
    Extract,
    Validate,
    Analyze,
    Export,
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Scrape,
        JobKind::Extract,
        JobKind::Validate,
        JobKind::Analyze,
        JobKind::Export,
        JobKind::Cleanup,
    ];

    /// Lowercase name, also used as the broker subject suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::Extract => "extract",
            JobKind::Validate => "validate",
            JobKind::Analyze => "analyze",
            JobKind::Export => "export",
            JobKind::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dequeue precedence. Higher priorities are served first; ties break on
/// earliest creation time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never dequeued again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

// ============================================================================
// Job
// ============================================================================

/// A unit of work with identity, kind, payload, and lifecycle.
///
/// The id is assigned at creation and stays stable across retries. Unknown
/// JSON fields survive a deserialize/serialize round-trip via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Last failure message; empty while healthy.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Job {
    /// Create a pending job with a fresh random id.
    pub fn new(kind: JobKind, payload: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            priority: JobPriority::Normal,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: default_max_attempts(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            scheduled_at: None,
            error: String::new(),
            result: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Defer the first dequeue until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Whether the job may be handed to a worker now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    /// Transition pending -> running on dequeue.
    ///
    /// Attempts count dispatches, not failures: a job that succeeds on the
    /// first try completes with `attempts == 1`.
    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Transition running -> completed with the handler's result map.
    pub fn mark_completed(&mut self, result: Map<String, Value>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.result = result;
        self.error.clear();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Transition running -> retrying after a recoverable handler failure.
    pub fn mark_retrying(&mut self, error: &str) {
        self.status = JobStatus::Retrying;
        self.error = error.to_string();
        self.updated_at = Utc::now();
    }

    /// Transition to terminal failure (dead-letter bound).
    pub fn mark_failed(&mut self, error: &str) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = error.to_string();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Administrative cancellation of a non-terminal job.
    pub fn mark_cancelled(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Transition retrying -> pending for re-admission to the queue.
    pub fn mark_requeued(&mut self) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.updated_at = Utc::now();
    }

    /// Reset a dead-lettered job for a fresh run, keeping id/kind/payload.
    pub fn reset_for_retry(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.error.clear();
        self.result.clear();
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
    }

    /// Whether another dispatch is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.status == JobStatus::Retrying && self.attempts < self.max_attempts
    }
}
