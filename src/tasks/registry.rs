// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory job registry.
//!
//! The only state shared between a running job and the callers polling it.
//! The map lives behind this type and is never handed out: readers get
//! cloned snapshots, writers go through [`TaskRegistry::update_task`] and
//! [`TaskRegistry::complete_task`].

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{Job, JobKind, JobStatus, JobUpdate};
use crate::error::SyncError;
use crate::metrics;

#[derive(Default)]
pub struct TaskRegistry {
    jobs: DashMap<Uuid, Job>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new Running job and return its ID.
    pub fn create_task(&self, kind: JobKind, owner_user_id: Option<i64>) -> Uuid {
        let job = Job::new(kind, owner_user_id);
        let id = job.id;
        self.jobs.insert(id, job);
        metrics::set_running_jobs(self.running_count());
        debug!(task_id = %id, kind = %kind, "Task created");
        id
    }

    /// Apply a partial update. Updates to a finished job are ignored.
    pub fn update_task(&self, id: Uuid, update: JobUpdate) -> Result<(), SyncError> {
        let mut job = self.jobs.get_mut(&id).ok_or(SyncError::NotFound(id))?;
        if job.status.is_terminal() {
            warn!(task_id = %id, status = %job.status, "Ignoring update to finished task");
            return Ok(());
        }
        job.apply(update);
        Ok(())
    }

    /// Move a Running job to Completed or Failed.
    ///
    /// Returns `false` (and changes nothing) if the job is unknown or already
    /// finished.
    pub fn complete_task(&self, id: Uuid, success: bool, error: Option<String>) -> bool {
        let finished = {
            let Some(mut job) = self.jobs.get_mut(&id) else {
                warn!(task_id = %id, "Cannot complete unknown task");
                return false;
            };
            if job.status.is_terminal() {
                warn!(task_id = %id, status = %job.status, "Task already finished");
                return false;
            }
            if success {
                job.status = JobStatus::Completed;
                job.error = None;
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(error.unwrap_or_else(|| "unknown error".to_string()));
            }
            job.end_time = Some(Utc::now());
            job.refresh_progress();
            (job.kind, job.status)
        };
        metrics::record_job_finished(finished.0.as_str(), finished.1.as_str());
        metrics::set_running_jobs(self.running_count());
        true
    }

    /// Snapshot of a job.
    #[must_use]
    pub fn get_task(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|job| job.clone())
    }

    /// Status document for external pollers.
    #[must_use]
    pub fn status_json(&self, id: Uuid) -> Option<serde_json::Value> {
        self.get_task(id)
            .and_then(|job| serde_json::to_value(job).ok())
    }

    /// All jobs, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by_key(|job| job.start_time);
        jobs
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Running)
            .count()
    }

    /// Remove finished jobs that ended more than `age` ago. Running jobs are
    /// never removed.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return 0;
        };

        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.end_time {
            Some(end) if job.status.is_terminal() => end >= cutoff,
            _ => true,
        });
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            debug!(removed, "Cleaned up finished tasks");
        }
        removed
    }
}
