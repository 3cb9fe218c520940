// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The table loop shared by every job mode.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Inner, JobMode};
use crate::audit::{AuditRecord, AuditStatus};
use crate::classifier::Deployment;
use crate::error::SyncError;
use crate::metrics::{self, JobTimer};
use crate::storage::{shared_columns, DbSession};
use crate::strategy::{self, BatchOptions, Strategy, StrategyCatalog, StrategyContext, TableCopy, TablePlanEntry};
use crate::tasks::JobUpdate;

/// Running totals for one job.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    completed: usize,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    rows: u64,
}

/// Why the table loop ended before the end of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Timeout,
    Cancelled,
}

enum TableResult {
    Succeeded(u64),
    Skipped,
    Failed,
    Cancelled,
}

/// Per-job context threaded through the loop.
struct Run<'a> {
    inner: &'a Inner,
    task_id: Uuid,
    mode: JobMode,
    owner_user_id: Option<i64>,
    cancel: CancellationToken,
    started: Instant,
    budget: Duration,
}

impl Run<'_> {
    fn action(&self) -> &'static str {
        self.mode.kind().as_str()
    }

    fn audit(&self, action: String, status: AuditStatus, details: impl Into<String>) {
        self.inner.audit.record(
            AuditRecord::new(action, status, details)
                .for_task(self.task_id)
                .by_user(self.owner_user_id),
        );
    }

    fn update(&self, update: JobUpdate) {
        if let Err(e) = self.inner.registry.update_task(self.task_id, update) {
            warn!(task_id = %self.task_id, error = %e, "Task update dropped");
        }
    }

    fn fail(&self, message: String) {
        self.audit(self.action().to_string(), AuditStatus::Failed, message.clone());
        self.inner.registry.complete_task(self.task_id, false, Some(message));
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }
}

/// Run one job to a terminal state.
pub(crate) async fn execute(
    inner: &Inner,
    task_id: Uuid,
    mode: JobMode,
    owner_user_id: Option<i64>,
    cancel: CancellationToken,
) {
    let kind = mode.kind();
    let _timer = JobTimer::new(kind.as_str());
    let budget = match mode {
        JobMode::Backup => inner.config.backup_budget(),
        JobMode::Restore { .. } | JobMode::FullOverwrite => inner.config.restore_budget(),
    };
    let run = Run {
        inner,
        task_id,
        mode,
        owner_user_id,
        cancel,
        started: Instant::now(),
        budget,
    };

    run.audit(
        kind.as_str().to_string(),
        AuditStatus::Started,
        format!("{} → {}", mode.source(), mode.target()),
    );
    info!(source = %mode.source(), target = %mode.target(), ?budget, "Job started");

    // Either side unreachable is fatal before any table is touched
    let mut target = match inner.connections.connect(mode.target()).await {
        Ok(session) => session,
        Err(e) => return finish_unreachable(&run, e).await,
    };
    let mut source = match inner.connections.connect(mode.source()).await {
        Ok(session) => session,
        Err(e) => return finish_unreachable(&run, e).await,
    };

    let plan = match choose_plan(&run, &mut target).await {
        Ok(plan) => plan,
        Err(e) => {
            run.fail(format!("cannot choose restore plan: {}", e));
            run.inner.audit.flush_pending().await;
            return;
        }
    };
    run.update(JobUpdate {
        total_tables: Some(plan.len()),
        ..Default::default()
    });
    #[cfg(test)]
    for entry in plan.entries() {
        panic_on(&entry.table, PANIC_BEFORE_LOOP);
    }

    if let Err(e) = target.set_foreign_keys(false).await {
        warn!(target = %mode.target(), error = %e, "Could not disable foreign-key checks, continuing");
    }

    let mut counters = Counters::default();
    let outcome = AssertUnwindSafe(table_loop(&run, &plan, &mut source, &mut target, &mut counters))
        .catch_unwind()
        .await;

    // Runs whatever the loop did, panics included
    let constraints_restored = restore_foreign_keys(&run, &mut target).await;
    run.update(JobUpdate {
        constraints_restored: Some(constraints_restored),
        ..Default::default()
    });

    match outcome {
        Ok(stop) => finish(&run, counters, stop),
        Err(_) => {
            error!("Table loop panicked");
            run.fail(format!(
                "internal error after {} of {} tables",
                counters.completed,
                plan.len()
            ));
        }
    }
    run.inner.audit.flush_pending().await;
}

async fn finish_unreachable(run: &Run<'_>, err: SyncError) {
    error!(error = %err, "Job aborted, database unreachable");
    run.fail(err.to_string());
    run.inner.audit.flush_pending().await;
}

/// Backup plan, or the restore plan picked by the classifier.
async fn choose_plan(run: &Run<'_>, primary: &mut DbSession) -> Result<StrategyCatalog, SyncError> {
    let inner = run.inner;
    match run.mode {
        JobMode::Backup => Ok(inner.backup_plan.clone()),
        JobMode::FullOverwrite => Ok(inner.restore_plan.as_full_overwrite()),
        JobMode::Restore { force_full } => {
            let deployment = inner.classifier.classify_primary(primary).await?;
            run.update(JobUpdate {
                deployment: Some(deployment),
                ..Default::default()
            });

            let (plan, reason) = match (deployment, force_full) {
                (Deployment::NewDeployment, _) => (inner.restore_plan.clone(), "new deployment, full restore"),
                (Deployment::HasLiveData, true) => (inner.restore_plan.clone(), "live data, full restore forced"),
                (Deployment::HasLiveData, false) => (
                    inner.restore_plan.safe_subset(),
                    "live data, restoring reference tables only",
                ),
            };
            run.audit(
                "restore:classify".to_string(),
                AuditStatus::Success,
                format!("{} ({} tables)", reason, plan.len()),
            );
            Ok(plan)
        }
    }
}

async fn table_loop(
    run: &Run<'_>,
    plan: &StrategyCatalog,
    source: &mut DbSession,
    target: &mut DbSession,
    counters: &mut Counters,
) -> Option<Stop> {
    let entries = plan.entries();
    for (i, entry) in entries.iter().enumerate() {
        if run.started.elapsed() >= run.budget {
            return Some(Stop::Timeout);
        }
        if run.cancel.is_cancelled() {
            return Some(Stop::Cancelled);
        }

        run.update(JobUpdate {
            current_table: Some(entry.table.clone()),
            ..Default::default()
        });

        match sync_table(run, entry, source, target).await {
            TableResult::Succeeded(rows) => {
                counters.succeeded += 1;
                counters.rows += rows;
                metrics::record_table_outcome(run.action(), "succeeded");
            }
            TableResult::Skipped => {
                counters.skipped += 1;
                metrics::record_table_outcome(run.action(), "skipped");
            }
            TableResult::Failed => {
                counters.failed += 1;
                metrics::record_table_outcome(run.action(), "failed");
            }
            TableResult::Cancelled => {
                run.inner.audit.flush_pending().await;
                return Some(Stop::Cancelled);
            }
        }
        counters.completed += 1;

        run.update(JobUpdate {
            completed_tables: Some(counters.completed),
            total_rows: Some(counters.rows),
            tables_succeeded: Some(counters.succeeded),
            tables_skipped: Some(counters.skipped),
            tables_failed: Some(counters.failed),
            ..Default::default()
        });
        run.inner.audit.flush_pending().await;

        if i + 1 < entries.len() && !throttle(run).await {
            return Some(Stop::Cancelled);
        }
    }
    None
}

/// Optional pause between tables, cut short by the deadline. Returns
/// `false` if the job was cancelled while waiting.
async fn throttle(run: &Run<'_>) -> bool {
    let pause = Duration::from_millis(run.inner.config.table_throttle_ms).min(run.remaining());
    if pause.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(pause) => true,
        _ = run.cancel.cancelled() => false,
    }
}

async fn sync_table(
    run: &Run<'_>,
    entry: &TablePlanEntry,
    source: &mut DbSession,
    target: &mut DbSession,
) -> TableResult {
    let action = format!("{}:{}", run.action(), entry.table);

    if entry.strategy == Strategy::ReadOnlySkip {
        run.audit(action, AuditStatus::Skipped, "skipped: synchronization disabled for this table");
        return TableResult::Skipped;
    }
    #[cfg(test)]
    panic_on(&entry.table, PANIC_IN_LOOP);

    let columns = match shared_table_columns(entry, source, target).await {
        Ok(columns) => columns,
        Err(e @ SyncError::SchemaMismatch { .. }) => {
            metrics::record_table_error(run.action(), e.kind());
            run.audit(action, AuditStatus::Skipped, format!("skipped: {}", e));
            return TableResult::Skipped;
        }
        Err(e) => {
            metrics::record_table_error(run.action(), e.kind());
            run.audit(action, AuditStatus::Failed, e.to_string());
            return TableResult::Failed;
        }
    };

    let config = &run.inner.config;
    let ctx = StrategyContext {
        batch: BatchOptions {
            batch_size: config.batch_size,
            commit_every: config.commit_every_batches,
        },
        cancel: &run.cancel,
        reset_sequences: config.reset_sequences,
        user_key_column: &config.user_key_column,
    };
    let copy = TableCopy {
        table: &entry.table,
        columns: &columns,
    };

    debug!(table = %entry.table, strategy = %entry.strategy, columns = columns.len(), "Syncing table");
    match strategy::apply(entry.strategy, source, target, &copy, &ctx).await {
        Ok(outcome) => {
            let details = if outcome.rows_skipped > 0 {
                format!("{} rows via {} ({} skipped)", outcome.rows_affected, entry.strategy, outcome.rows_skipped)
            } else {
                format!("{} rows via {}", outcome.rows_affected, entry.strategy)
            };
            run.audit(action, AuditStatus::Success, details);
            TableResult::Succeeded(outcome.rows_affected)
        }
        Err(SyncError::Cancelled) => {
            run.audit(action, AuditStatus::Failed, "cancelled mid-table");
            TableResult::Cancelled
        }
        Err(e) => {
            metrics::record_table_error(run.action(), e.kind());
            run.audit(action, AuditStatus::Failed, e.to_string());
            TableResult::Failed
        }
    }
}

/// Columns the table has on both sides, or a schema mismatch.
async fn shared_table_columns(
    entry: &TablePlanEntry,
    source: &mut DbSession,
    target: &mut DbSession,
) -> Result<Vec<crate::storage::ColumnInfo>, SyncError> {
    for session in [&mut *source, &mut *target] {
        if !session.table_exists(&entry.table).await? {
            return Err(SyncError::SchemaMismatch {
                table: entry.table.clone(),
                side: session.role(),
                reason: "not found".to_string(),
            });
        }
    }

    let columns = shared_columns(
        &source.columns(&entry.table).await?,
        &target.columns(&entry.table).await?,
    );
    if columns.is_empty() {
        return Err(SyncError::SchemaMismatch {
            table: entry.table.clone(),
            side: target.role(),
            reason: "no columns in common".to_string(),
        });
    }
    Ok(columns)
}

/// Turn foreign-key enforcement back on and confirm it took.
async fn restore_foreign_keys(run: &Run<'_>, target: &mut DbSession) -> bool {
    if let Err(e) = target.set_foreign_keys(true).await {
        error!(error = %e, "Could not re-enable foreign-key checks");
    }
    match target.foreign_keys_enabled().await {
        Ok(true) => true,
        Ok(false) => {
            run.audit(
                format!("{}:constraints", run.action()),
                AuditStatus::Failed,
                format!("foreign-key checks still disabled on {}", target.role()),
            );
            false
        }
        Err(e) => {
            warn!(error = %e, "Could not verify foreign-key checks");
            false
        }
    }
}

fn finish(run: &Run<'_>, counters: Counters, stop: Option<Stop>) {
    let kind = run.action();
    let summary = format!(
        "{} tables succeeded, {} skipped, {} failed, {} rows",
        counters.succeeded, counters.skipped, counters.failed, counters.rows
    );

    if stop == Some(Stop::Timeout) {
        metrics::record_timeout(kind);
        run.update(JobUpdate {
            timed_out: Some(true),
            ..Default::default()
        });
        run.audit(
            format!("{}:timeout", kind),
            AuditStatus::Timeout,
            format!(
                "{}, stopped after {} tables",
                SyncError::TimeoutExceeded { budget: run.budget },
                counters.completed
            ),
        );
    }

    if stop == Some(Stop::Cancelled) {
        run.fail(format!("cancelled ({})", summary));
        return;
    }

    if counters.succeeded > 0 {
        run.audit(kind.to_string(), AuditStatus::Success, summary.clone());
        run.inner.registry.complete_task(run.task_id, true, None);
        if run.mode == JobMode::Backup {
            metrics::set_last_backup_success(chrono::Utc::now().timestamp());
        }
        info!(
            tables = counters.completed,
            rows = counters.rows,
            elapsed = ?run.started.elapsed(),
            "Job completed"
        );
    } else {
        run.fail(format!("no table synchronized ({})", summary));
    }
}

#[cfg(test)]
const PANIC_IN_LOOP: &str = "panic_in_table_loop";
#[cfg(test)]
const PANIC_BEFORE_LOOP: &str = "panic_before_table_loop";

/// Panics when a plan names one of the marker tables above.
#[cfg(test)]
fn panic_on(table: &str, marker: &str) {
    if table == marker {
        panic!("injected panic on {}", table);
    }
}
