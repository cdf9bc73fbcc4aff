use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ResilienceError;

/// Job lifecycle
///
/// ```text
/// Pending → Running → Completed | Failed | RetryScheduled | Cancelled
/// RetryScheduled → Pending (after backoff) | Cancelled
/// Pending → Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RetryScheduled,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::RetryScheduled,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ResilienceError::validation(format!("unknown job status: {s}")))
    }
}

/// Error recorded on a job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl From<&ResilienceError> for JobError {
    fn from(err: &ResilienceError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// A unit of deferred work and its lifecycle record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub payload: Value,
    pub status: JobStatus,
    /// Executions started so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: impl Into<String>, payload: Value, max_attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            payload,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
        }
    }

    /// Wall time of the last execution, once finished
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Name and payload of a job to submit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl JobTemplate {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Per-status job counts plus queue occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retry_scheduled: usize,
    pub cancelled: usize,
    pub total: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::RetryScheduled => self.retry_scheduled,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::RetryScheduled => self.retry_scheduled += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    /// Jobs that still need a worker
    pub fn unfinished(&self) -> usize {
        self.pending + self.running + self.retry_scheduled
    }

    pub fn by_status(&self) -> Vec<(&'static str, usize)> {
        JobStatus::ALL
            .into_iter()
            .map(|status| (status.as_str(), self.count(status)))
            .collect()
    }
}

/// What `cancel` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "status")]
pub enum CancelOutcome {
    /// The job had not started and will never run
    Cancelled,
    /// The job is running; its cancellation token was fired
    Signalled,
    /// The job had already finished
    AlreadyFinished(JobStatus),
}

/// Result of stopping the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Jobs that finished while draining
    pub drained: usize,
    /// Jobs left unfinished and marked failed
    pub abandoned: Vec<Uuid>,
}
