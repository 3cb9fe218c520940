// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destructive restore paths.
//!
//! The unconditional restore is permanently disabled. Overwriting a live
//! primary takes two deliberate steps:
//!
//! 1. `allow_dangerous_restore = true` in the configuration
//! 2. the confirmation token of a dry run taken against the current data
//!
//! The token is the SHA-256 of the dry-run's table counts, so any change to
//! either database between the dry run and the restore invalidates it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{JobMode, SyncOrchestrator};
use crate::audit::{AuditRecord, AuditStatus};
use crate::connection::DbRole;
use crate::error::SyncError;
use crate::tasks::Job;

/// What a full overwrite would do to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunTable {
    pub table: String,
    /// Rows currently on the primary (deleted by the restore); `None` if the
    /// table is missing there.
    pub rows_to_delete: Option<i64>,
    /// Rows on the backup (inserted by the restore); `None` if missing there.
    pub rows_to_insert: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub tables: Vec<DryRunTable>,
    pub total_rows_to_delete: i64,
    pub total_rows_to_insert: i64,
    pub generated_at: DateTime<Utc>,
    /// Pass back to [`SyncOrchestrator::dangerous_full_restore`].
    pub confirmation_token: String,
}

impl DryRunReport {
    fn new(tables: Vec<DryRunTable>) -> Self {
        let total_rows_to_delete = tables.iter().filter_map(|t| t.rows_to_delete).sum();
        let total_rows_to_insert = tables.iter().filter_map(|t| t.rows_to_insert).sum();
        let confirmation_token = token_for(&tables);
        Self {
            tables,
            total_rows_to_delete,
            total_rows_to_insert,
            generated_at: Utc::now(),
            confirmation_token,
        }
    }
}

fn token_for(tables: &[DryRunTable]) -> String {
    let mut hasher = Sha256::new();
    for t in tables {
        hasher.update(t.table.as_bytes());
        hasher.update([0]);
        hasher.update(t.rows_to_delete.unwrap_or(-1).to_be_bytes());
        hasher.update(t.rows_to_insert.unwrap_or(-1).to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

impl SyncOrchestrator {
    /// The old delete-everything-then-copy restore. Always refuses.
    pub fn legacy_unconditional_restore(&self) -> Result<(), SyncError> {
        let reason = "unconditional restore is disabled; use dangerous_restore_dry_run \
                      and dangerous_full_restore";
        self.audit()
            .record(AuditRecord::new("restore:unconditional", AuditStatus::Disabled, format!("disabled for safety: {}", reason)));
        Err(SyncError::Disabled(reason.to_string()))
    }

    /// Count what a full overwrite of the primary would delete and insert.
    pub async fn dangerous_restore_dry_run(&self) -> Result<DryRunReport, SyncError> {
        let plan = self.restore_plan().as_full_overwrite();
        let mut primary = self.connections().connect(DbRole::Primary).await?;
        let mut backup = self.connections().connect(DbRole::Backup).await?;

        let mut tables = Vec::with_capacity(plan.len());
        for entry in plan.entries() {
            let rows_to_delete = if primary.table_exists(&entry.table).await? {
                Some(primary.count_rows(&entry.table).await?)
            } else {
                None
            };
            let rows_to_insert = if backup.table_exists(&entry.table).await? {
                Some(backup.count_rows(&entry.table).await?)
            } else {
                None
            };
            tables.push(DryRunTable {
                table: entry.table.clone(),
                rows_to_delete,
                rows_to_insert,
            });
        }

        let report = DryRunReport::new(tables);
        self.audit().record(AuditRecord::new(
            "restore:dry_run",
            AuditStatus::Success,
            format!(
                "{} tables, {} rows to delete, {} rows to insert",
                report.tables.len(),
                report.total_rows_to_delete,
                report.total_rows_to_insert
            ),
        ));
        Ok(report)
    }

    /// Overwrite the primary with the backup, every table clear-insert.
    ///
    /// Requires `allow_dangerous_restore` and the token of a dry run that
    /// still matches the current data.
    pub async fn dangerous_full_restore(&self, confirmation_token: &str) -> Result<Job, SyncError> {
        if !self.config().allow_dangerous_restore {
            let reason = "full restore requires allow_dangerous_restore";
            self.audit().record(AuditRecord::new(
                "restore:dangerous",
                AuditStatus::Disabled,
                format!("disabled for safety: {}", reason),
            ));
            return Err(SyncError::Disabled(reason.to_string()));
        }

        let report = self.dangerous_restore_dry_run().await?;
        if report.confirmation_token != confirmation_token {
            warn!("Dangerous restore refused, confirmation token is stale or wrong");
            self.audit().record(AuditRecord::new(
                "restore:dangerous",
                AuditStatus::Failed,
                "confirmation token does not match a fresh dry run",
            ));
            return Err(SyncError::ConfirmationMismatch);
        }

        warn!(
            tables = report.tables.len(),
            rows_to_delete = report.total_rows_to_delete,
            "Starting confirmed full overwrite of the primary"
        );
        Ok(self.run_inline(JobMode::FullOverwrite, None).await)
    }
}
