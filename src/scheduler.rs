// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic backups and health ticks.
//!
//! ```text
//! run(shutdown)
//!   ├─ IMMEDIATE_SYNC? ─► one backup now
//!   └─ loop
//!        ├─ every SYNC_INTERVAL_HOURS ─► scheduled backup ─► cleanup old tasks
//!        ├─ every HEALTH_CHECK_INTERVAL_MINUTES ─► health tick
//!        └─ shutdown ─► return
//! ```
//!
//! A scheduled backup is skipped when dual mode is off or either database is
//! unreachable, and retried (see [`RetryConfig::scheduled`]) when it runs but
//! does not complete. A backup that is already running is allowed to finish
//! before shutdown is observed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection::HealthReport;
use crate::orchestrator::SyncOrchestrator;
use crate::resilience::retry::{retry, RetryConfig};
use crate::tasks::{Job, JobStatus};

/// Why a scheduled backup did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DualDisabled,
    Unhealthy(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DualDisabled => f.write_str("dual database mode is not configured"),
            Self::Unhealthy(detail) => write!(f, "database unhealthy: {}", detail),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScheduledRun {
    Skipped(SkipReason),
    /// The last attempt's job; `Completed` unless every attempt failed.
    Ran(Job),
}

impl ScheduledRun {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Ran(job) if job.status == JobStatus::Completed)
    }
}

struct FailedRun(Job);

impl std::fmt::Display for FailedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "backup {} failed: {}",
            self.0.id,
            self.0.error.as_deref().unwrap_or("unknown error")
        )
    }
}

pub struct Scheduler {
    orchestrator: SyncOrchestrator,
    retry: RetryConfig,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        Self {
            orchestrator,
            retry: RetryConfig::scheduled(),
            last_success: Mutex::new(None),
        }
    }

    /// Override the retry policy for scheduled backups.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock()
    }

    /// One scheduled backup, with pre-flight checks and retries.
    #[tracing::instrument(skip(self))]
    pub async fn run_scheduled_backup(&self) -> ScheduledRun {
        let connections = self.orchestrator.connections();
        if !connections.is_dual_enabled() {
            info!("Scheduled backup skipped, dual database mode is not configured");
            return ScheduledRun::Skipped(SkipReason::DualDisabled);
        }

        let report = connections.health_check().await;
        if !report.all_reachable() {
            let detail = unreachable_detail(&report);
            warn!(detail = %detail, "Scheduled backup skipped");
            return ScheduledRun::Skipped(SkipReason::Unhealthy(detail));
        }

        let orchestrator = &self.orchestrator;
        let result = retry("scheduled_backup", &self.retry, || async move {
            let job = orchestrator.run_backup(None).await;
            if job.status == JobStatus::Completed {
                Ok(job)
            } else {
                Err(FailedRun(job))
            }
        })
        .await;

        match result {
            Ok(job) => {
                let finished = job.end_time.unwrap_or_else(Utc::now);
                *self.last_success.lock() = Some(finished);
                info!(
                    task_id = %job.id,
                    tables = job.tables_succeeded,
                    rows = job.total_rows,
                    "Scheduled backup completed"
                );
                ScheduledRun::Ran(job)
            }
            Err(FailedRun(job)) => {
                error!(
                    task_id = %job.id,
                    error = job.error.as_deref().unwrap_or("unknown error"),
                    "Scheduled backup failed after all retries"
                );
                ScheduledRun::Ran(job)
            }
        }
    }

    /// Log database health, warn when the last good backup is stale.
    pub async fn health_tick(&self) -> HealthReport {
        let report = self.orchestrator.connections().health_check().await;
        for (name, health) in [("primary", &report.primary), ("backup", &report.backup)] {
            if !health.configured {
                continue;
            }
            if health.reachable {
                info!(
                    role = name,
                    latency_ms = health.latency_ms.unwrap_or_default(),
                    healthy = health.healthy,
                    "Database reachable"
                );
            } else {
                warn!(
                    role = name,
                    error = health.error.as_deref().unwrap_or("unknown"),
                    "Database unreachable"
                );
            }
        }

        if let Some(age) = self.staleness(Utc::now()) {
            warn!(
                hours_since_last_sync = age.num_hours(),
                "Last successful backup is older than twice the sync interval"
            );
        }
        report
    }

    /// Age of the last success if it exceeds twice the sync interval.
    fn staleness(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let last = (*self.last_success.lock())?;
        let limit = chrono::Duration::from_std(self.orchestrator.config().sync_interval() * 2).ok()?;
        let age = now - last;
        (age > limit).then_some(age)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let config = self.orchestrator.config();
        let sync_every = config.sync_interval();
        let health_every = config.health_check_interval();
        info!(
            sync_interval_hours = config.sync_interval_hours,
            health_check_interval_minutes = config.health_check_interval_minutes,
            immediate = config.immediate_sync,
            "Scheduler started"
        );

        if config.immediate_sync {
            self.run_scheduled_backup().await;
        }

        let mut sync_interval = interval_at(Instant::now() + sync_every, sync_every);
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health_interval = interval_at(Instant::now() + health_every, health_every);
        health_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = sync_interval.tick() => {
                    self.run_scheduled_backup().await;
                    let removed = self.orchestrator.cleanup_finished_tasks();
                    if removed > 0 {
                        info!(removed, "Cleaned up finished tasks");
                    }
                }

                _ = health_interval.tick() => {
                    self.health_tick().await;
                }
            }
        }
        info!("Scheduler stopped");
    }
}

fn unreachable_detail(report: &HealthReport) -> String {
    [("primary", &report.primary), ("backup", &report.backup)]
        .into_iter()
        .filter(|(_, h)| !h.reachable)
        .map(|(name, h)| format!("{} ({})", name, h.error.as_deref().unwrap_or("unreachable")))
        .collect::<Vec<_>>()
        .join(", ")
}
