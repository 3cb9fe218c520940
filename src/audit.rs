// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only audit trail.
//!
//! Every record lands in memory immediately and is queued for a best-effort
//! copy into the primary database's `system_logs` table. The queue is drained
//! by [`AuditTrail::flush_pending`] between tables, never while a job holds
//! an open transaction, and a failed write is only logged.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use sqlx::AnyPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::metrics;
use crate::storage::Dialect;
use crate::tasks::job::format_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Started,
    Success,
    Skipped,
    Failed,
    Timeout,
    Disabled,
}

impl AuditStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    #[serde(serialize_with = "serialize_time")]
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub status: AuditStatus,
    pub details: String,
    pub task_id: Option<Uuid>,
    pub user_id: Option<i64>,
}

fn serialize_time<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_time(time))
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, status: AuditStatus, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            status,
            details: details.into(),
            task_id: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    #[must_use]
    pub fn by_user(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }
}

struct Sink {
    pool: AnyPool,
    dialect: Dialect,
}

pub struct AuditTrail {
    records: Mutex<Vec<AuditRecord>>,
    pending: Mutex<Vec<AuditRecord>>,
    sink: Option<Sink>,
}

impl AuditTrail {
    /// In-memory trail only.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    /// Trail that also copies records into `system_logs` on `pool`.
    pub fn with_sink(pool: AnyPool, dialect: Dialect) -> Self {
        Self {
            sink: Some(Sink { pool, dialect }),
            ..Self::new()
        }
    }

    /// Append a record.
    pub fn record(&self, record: AuditRecord) {
        match record.status {
            AuditStatus::Failed | AuditStatus::Timeout | AuditStatus::Disabled => warn!(
                action = %record.action,
                status = %record.status,
                task_id = ?record.task_id,
                "{}", record.details
            ),
            _ => info!(
                action = %record.action,
                status = %record.status,
                task_id = ?record.task_id,
                "{}", record.details
            ),
        }
        if self.sink.is_some() {
            self.pending.lock().push(record.clone());
        }
        self.records.lock().push(record);
    }

    /// Snapshot of every record, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn records_for_task(&self, task_id: Uuid) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.task_id == Some(task_id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Copy queued records into `system_logs`. Returns how many were written.
    /// Records that fail to persist are dropped from the queue; they remain
    /// in memory.
    pub async fn flush_pending(&self) -> usize {
        let Some(sink) = &self.sink else {
            return 0;
        };
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }

        let sql = format!(
            "INSERT INTO {} ({}, {}, {}, {}) VALUES ({}, {}, {}, CURRENT_TIMESTAMP)",
            sink.dialect.quote_ident("system_logs"),
            sink.dialect.quote_ident("action"),
            sink.dialect.quote_ident("details"),
            sink.dialect.quote_ident("user_id"),
            sink.dialect.quote_ident("created_at"),
            sink.dialect.placeholder(1),
            sink.dialect.placeholder(2),
            sink.dialect.placeholder(3),
        );

        let mut written = 0;
        for record in &batch {
            let details = format!("[{}] {}", record.status, record.details);
            let result = sqlx::query(&sql)
                .bind(record.action.clone())
                .bind(details)
                .bind(record.user_id)
                .execute(&sink.pool)
                .await;
            match result {
                Ok(_) => written += 1,
                Err(e) => {
                    metrics::record_audit_write_failure();
                    warn!(error = %e, "Audit record not persisted, keeping in memory only");
                    // The table is missing or unwritable; the rest would fail the same way
                    break;
                }
            }
        }
        written
    }

    /// Export the trail as a JSON array.
    pub fn save_json(&self, path: &Path) -> Result<(), SyncError> {
        let json = serde_json::to_string_pretty(&self.records())
            .map_err(|e| SyncError::Unknown(format!("audit serialization failed: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| SyncError::Unknown(format!("cannot write {}: {}", path.display(), e)))?;
        info!(path = %path.display(), records = self.len(), "Audit trail saved");
        Ok(())
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}
