// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job record and its state machine.
//!
//! ```text
//! Running ──► Completed
//!    │
//!    └──────► Failed
//! ```
//!
//! Terminal states are final. `progress` is derived from the table counters
//! and is never set directly. A Running job tops out at 99; 100 is only
//! published together with the terminal status.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::classifier::Deployment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one backup or restore job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub current_table: Option<String>,
    pub completed_tables: usize,
    pub total_tables: usize,
    pub total_rows: u64,
    pub tables_succeeded: usize,
    pub tables_skipped: usize,
    pub tables_failed: usize,
    /// Whether foreign-key enforcement was confirmed back on after the run.
    pub constraints_restored: Option<bool>,
    pub timed_out: bool,
    pub deployment: Option<Deployment>,
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_time")]
    pub start_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_optional_time")]
    pub end_time: Option<DateTime<Utc>>,
    pub owner_user_id: Option<i64>,
}

impl Job {
    pub(crate) fn new(kind: JobKind, owner_user_id: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Running,
            progress: 0,
            current_table: None,
            completed_tables: 0,
            total_tables: 0,
            total_rows: 0,
            tables_succeeded: 0,
            tables_skipped: 0,
            tables_failed: 0,
            constraints_restored: None,
            timed_out: false,
            deployment: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            owner_user_id,
        }
    }

    /// Stand-in for a finished job whose record was purged.
    pub(crate) fn orphan(id: Uuid, kind: JobKind, owner_user_id: Option<i64>) -> Self {
        let mut job = Self::new(kind, owner_user_id);
        job.id = id;
        job.status = JobStatus::Failed;
        job.error = Some("task record no longer available".to_string());
        job.end_time = Some(Utc::now());
        job
    }

    /// `floor(completed / total * 100)`, 0 when there is nothing to do.
    #[must_use]
    pub fn progress_for(completed: usize, total: usize) -> u8 {
        if total == 0 {
            return 0;
        }
        let pct = completed.min(total) * 100 / total;
        pct as u8
    }

    pub(crate) fn apply(&mut self, update: JobUpdate) {
        if let Some(table) = update.current_table {
            self.current_table = Some(table);
        }
        if let Some(total) = update.total_tables {
            self.total_tables = total;
        }
        if let Some(completed) = update.completed_tables {
            self.completed_tables = completed;
        }
        self.completed_tables = self.completed_tables.min(self.total_tables);
        if let Some(rows) = update.total_rows {
            self.total_rows = rows;
        }
        if let Some(n) = update.tables_succeeded {
            self.tables_succeeded = n;
        }
        if let Some(n) = update.tables_skipped {
            self.tables_skipped = n;
        }
        if let Some(n) = update.tables_failed {
            self.tables_failed = n;
        }
        if let Some(restored) = update.constraints_restored {
            self.constraints_restored = Some(restored);
        }
        if let Some(timed_out) = update.timed_out {
            self.timed_out = timed_out;
        }
        if let Some(deployment) = update.deployment {
            self.deployment = Some(deployment);
        }
        self.refresh_progress();
    }

    pub(crate) fn refresh_progress(&mut self) {
        let pct = Self::progress_for(self.completed_tables, self.total_tables);
        self.progress = if self.status.is_terminal() { pct } else { pct.min(99) };
    }

    /// Wall-clock duration so far (or in total once finished).
    #[must_use]
    pub fn elapsed(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub current_table: Option<String>,
    pub total_tables: Option<usize>,
    pub completed_tables: Option<usize>,
    pub total_rows: Option<u64>,
    pub tables_succeeded: Option<usize>,
    pub tables_skipped: Option<usize>,
    pub tables_failed: Option<usize>,
    pub constraints_restored: Option<bool>,
    pub timed_out: Option<bool>,
    pub deployment: Option<Deployment>,
}

/// ISO-8601 with an explicit `+00:00` offset.
pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn serialize_time<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_time(time))
}

fn serialize_optional_time<S: Serializer>(
    time: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match time {
        Some(t) => serializer.serialize_str(&format_time(t)),
        None => serializer.serialize_none(),
    }
}
