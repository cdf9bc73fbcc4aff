//! In-memory job records
//!
//! Every status transition happens under the store's write lock, so readers
//! always see a job in exactly one state and transitions of one job are
//! totally ordered. Transition methods check the expected source state and
//! return `None` when the job is not in it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::ResilienceError;
use crate::queue::types::{Job, JobError, JobStats, JobStatus};

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.write().insert(job.id, job);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Job> {
        self.jobs.write().remove(id)
    }

    /// Remove a job only while it is still pending
    pub fn remove_if_pending(&self, id: &Uuid) -> bool {
        let mut jobs = self.jobs.write();
        match jobs.get(id) {
            Some(job) if job.status == JobStatus::Pending => jobs.remove(id).is_some(),
            _ => false,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically move a pending job to running and count the attempt
    pub fn claim(&self, id: &Uuid) -> Option<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id)?;
        if job.status != JobStatus::Pending {
            return None;
        }

        job.status = JobStatus::Running;
        job.attempt += 1;
        job.started_at = Some(Utc::now());
        job.finished_at = None;
        job.next_attempt_at = None;
        Some(job.clone())
    }

    pub fn complete(&self, id: &Uuid, result: Value) -> Option<Job> {
        self.finish_running(id, |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.error = None;
        })
    }

    pub fn fail(&self, id: &Uuid, err: &ResilienceError) -> Option<Job> {
        self.finish_running(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(JobError::from(err));
        })
    }

    /// Record a running job's cancellation
    pub fn finish_cancelled(&self, id: &Uuid, err: &ResilienceError) -> Option<Job> {
        self.finish_running(id, |job| {
            job.status = JobStatus::Cancelled;
            job.error = Some(JobError::from(err));
        })
    }

    pub fn schedule_retry(
        &self,
        id: &Uuid,
        err: &ResilienceError,
        next_attempt_at: DateTime<Utc>,
    ) -> Option<Job> {
        self.finish_running(id, |job| {
            job.status = JobStatus::RetryScheduled;
            job.error = Some(JobError::from(err));
            job.next_attempt_at = Some(next_attempt_at);
        })
    }

    /// Move a job whose backoff elapsed back to pending
    pub fn requeue(&self, id: &Uuid) -> bool {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::RetryScheduled => {
                job.status = JobStatus::Pending;
                job.next_attempt_at = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel a job that has not started (or awaits a retry)
    ///
    /// Returns the status the job had before the call; only `Pending` and
    /// `RetryScheduled` jobs are changed.
    pub fn cancel(&self, id: &Uuid) -> Option<JobStatus> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id)?;
        let previous = job.status;

        if matches!(previous, JobStatus::Pending | JobStatus::RetryScheduled) {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Utc::now());
            job.next_attempt_at = None;
        }
        Some(previous)
    }

    pub fn stats(&self) -> JobStats {
        let jobs = self.jobs.read();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.bump(job.status);
        }
        stats
    }

    /// Jobs oldest first, optionally filtered by status
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        let jobs = self.jobs.read();
        let mut selected: Vec<Job> = jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        // v7 ids sort by creation time
        selected.sort_by_key(|job| job.id);
        selected.truncate(limit);
        selected
    }

    /// Drop finished jobs that finished before `cutoff`
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.is_terminal() && job.finished_at.is_some_and(|finished| finished < cutoff))
        });
        let purged = before - jobs.len();
        if purged > 0 {
            debug!(purged, "Purged finished jobs");
        }
        purged
    }

    /// Fail every job that has not finished; returns their ids
    pub fn abandon_unfinished(&self, err: &ResilienceError) -> Vec<Uuid> {
        let mut jobs = self.jobs.write();
        let now = Utc::now();
        let mut abandoned = Vec::new();

        for job in jobs.values_mut() {
            if !job.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some(JobError::from(err));
                job.finished_at = Some(now);
                job.next_attempt_at = None;
                abandoned.push(job.id);
            }
        }

        abandoned.sort();
        abandoned
    }

    fn finish_running(&self, id: &Uuid, apply: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id)?;
        if job.status != JobStatus::Running {
            return None;
        }

        apply(job);
        job.finished_at = Some(Utc::now());
        Some(job.clone())
    }
}
