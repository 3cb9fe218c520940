// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backup and restore jobs.
//!
//! # Backup
//!
//! ```text
//! start_backup ─► create task ─► spawn ─► connect primary + backup
//!                                          │ (either down: Failed, progress 0)
//!                                          ▼
//!                           disable FKs on backup (best effort)
//!                                          ▼
//!                  for each table in priority order:
//!                    budget? cancelled? exists on both sides?
//!                    shared columns ─► strategy ─► counters + audit
//!                                          ▼
//!                   re-enable FKs (always) ─► verify ─► complete
//! ```
//!
//! # Restore
//!
//! Same shape, backup → primary, after classifying the primary: a new
//! deployment gets the full restore plan, a primary with live data only gets
//! the reference tables.
//!
//! # Example
//!
//! ```rust,no_run
//! use dual_sync_engine::{SyncConfig, SyncOrchestrator};
//!
//! # async fn run() -> Result<(), dual_sync_engine::SyncError> {
//! let orchestrator = SyncOrchestrator::new(SyncConfig::from_env()?)?;
//! let task_id = orchestrator.start_backup(None);
//! if let Some(status) = orchestrator.get_status(task_id) {
//!     println!("{}", status);
//! }
//! # Ok(())
//! # }
//! ```

mod guarded;
mod workflow;

pub use guarded::{DryRunReport, DryRunTable};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditStatus, AuditTrail};
use crate::classifier::DeploymentClassifier;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, DbRole};
use crate::error::SyncError;
use crate::metrics;
use crate::strategy::StrategyCatalog;
use crate::tasks::{Job, JobKind, TaskRegistry};

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobMode {
    /// Primary → backup, backup plan
    Backup,
    /// Backup → primary, plan chosen by the classifier unless forced
    Restore { force_full: bool },
    /// Backup → primary, every table clear-insert (confirmed dangerous path)
    FullOverwrite,
}

impl JobMode {
    fn kind(self) -> JobKind {
        match self {
            Self::Backup => JobKind::Backup,
            Self::Restore { .. } | Self::FullOverwrite => JobKind::Restore,
        }
    }

    fn source(self) -> DbRole {
        match self {
            Self::Backup => DbRole::Primary,
            Self::Restore { .. } | Self::FullOverwrite => DbRole::Backup,
        }
    }

    fn target(self) -> DbRole {
        match self {
            Self::Backup => DbRole::Backup,
            Self::Restore { .. } | Self::FullOverwrite => DbRole::Primary,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: SyncConfig,
    pub(crate) connections: Arc<ConnectionManager>,
    pub(crate) registry: TaskRegistry,
    pub(crate) audit: AuditTrail,
    pub(crate) classifier: DeploymentClassifier,
    pub(crate) backup_plan: StrategyCatalog,
    pub(crate) restore_plan: StrategyCatalog,
    cancels: DashMap<Uuid, CancellationToken>,
}

impl Inner {
    /// Run a registered job to a terminal state, whatever happens inside it,
    /// then drop its cancellation token.
    async fn run_job(&self, task_id: Uuid, mode: JobMode, owner_user_id: Option<i64>, cancel: CancellationToken) {
        let outcome = AssertUnwindSafe(workflow::execute(self, task_id, mode, owner_user_id, cancel))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!(task_id = %task_id, "Job panicked");
            let message = "internal error, job aborted";
            if self.registry.complete_task(task_id, false, Some(message.to_string())) {
                self.audit.record(
                    AuditRecord::new(mode.kind().as_str(), AuditStatus::Failed, message)
                        .for_task(task_id)
                        .by_user(owner_user_id),
                );
                self.audit.flush_pending().await;
            }
        }
        self.cancels.remove(&task_id);
    }
}

/// Entry point for backup and restore jobs. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let connections = ConnectionManager::new(&config)?;
        Ok(Self::with_connections(config, connections))
    }

    /// Build around an existing connection manager.
    pub fn with_connections(config: SyncConfig, connections: ConnectionManager) -> Self {
        let audit = match (connections.pool(DbRole::Primary), connections.dialect(DbRole::Primary)) {
            (Some(pool), Some(dialect)) => AuditTrail::with_sink(pool.clone(), dialect),
            _ => AuditTrail::new(),
        };
        let backup_plan = config
            .backup_plan
            .clone()
            .map(StrategyCatalog::new)
            .unwrap_or_else(StrategyCatalog::backup_default);
        let restore_plan = config
            .restore_plan
            .clone()
            .map(StrategyCatalog::new)
            .unwrap_or_else(StrategyCatalog::restore_default);
        let classifier = DeploymentClassifier::new(config.thresholds.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                connections: Arc::new(connections),
                registry: TaskRegistry::new(),
                audit,
                classifier,
                backup_plan,
                restore_plan,
                cancels: DashMap::new(),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Job submission
    // ═══════════════════════════════════════════════════════════════════════

    /// Start a backup in the background and return its task ID.
    pub fn start_backup(&self, owner_user_id: Option<i64>) -> Uuid {
        self.spawn(JobMode::Backup, owner_user_id)
    }

    /// Run a backup to completion and return the finished job.
    pub async fn run_backup(&self, owner_user_id: Option<i64>) -> Job {
        self.run_inline(JobMode::Backup, owner_user_id).await
    }

    /// Run a restore to completion; `true` if it completed.
    pub async fn start_restore(&self, force_full_restore: bool) -> bool {
        let job = self.run_restore(force_full_restore).await;
        job.status == crate::tasks::JobStatus::Completed
    }

    /// Run a restore to completion and return the finished job.
    pub async fn run_restore(&self, force_full_restore: bool) -> Job {
        self.run_inline(JobMode::Restore { force_full: force_full_restore }, None)
            .await
    }

    /// Start a restore in the background and return its task ID.
    pub fn start_restore_task(&self, force_full_restore: bool) -> Uuid {
        self.spawn(JobMode::Restore { force_full: force_full_restore }, None)
    }

    /// Trip the cancellation token of a running job. Returns `false` if the
    /// job is unknown or already finished.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.inner.cancels.get(&task_id) {
            Some(token) => {
                info!(task_id = %task_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status
    // ═══════════════════════════════════════════════════════════════════════

    /// Status document (camelCase JSON) for a task.
    #[must_use]
    pub fn get_status(&self, task_id: Uuid) -> Option<serde_json::Value> {
        self.inner.registry.status_json(task_id)
    }

    #[must_use]
    pub fn get_task(&self, task_id: Uuid) -> Option<Job> {
        self.inner.registry.get_task(task_id)
    }

    /// Drop finished tasks older than the configured retention.
    pub fn cleanup_finished_tasks(&self) -> usize {
        let retention = Duration::from_secs(self.inner.config.job_retention_hours * 3600);
        self.inner.registry.cleanup_older_than(retention)
    }

    #[must_use]
    pub fn audit(&self) -> &AuditTrail {
        &self.inner.audit
    }

    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn backup_plan(&self) -> &StrategyCatalog {
        &self.inner.backup_plan
    }

    #[must_use]
    pub fn restore_plan(&self) -> &StrategyCatalog {
        &self.inner.restore_plan
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════

    fn register(&self, mode: JobMode, owner_user_id: Option<i64>) -> (Uuid, CancellationToken) {
        let kind = mode.kind();
        let task_id = self.inner.registry.create_task(kind, owner_user_id);
        let cancel = CancellationToken::new();
        self.inner.cancels.insert(task_id, cancel.clone());
        metrics::record_job_started(kind.as_str());
        (task_id, cancel)
    }

    fn spawn(&self, mode: JobMode, owner_user_id: Option<i64>) -> Uuid {
        let (task_id, cancel) = self.register(mode, owner_user_id);
        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("sync_job", task_id = %task_id, kind = %mode.kind());
        tokio::spawn(
            async move {
                inner.run_job(task_id, mode, owner_user_id, cancel).await;
            }
            .instrument(span),
        );
        task_id
    }

    pub(crate) async fn run_inline(&self, mode: JobMode, owner_user_id: Option<i64>) -> Job {
        let (task_id, cancel) = self.register(mode, owner_user_id);
        let span = tracing::info_span!("sync_job", task_id = %task_id, kind = %mode.kind());
        self.inner
            .run_job(task_id, mode, owner_user_id, cancel)
            .instrument(span)
            .await;
        self.snapshot(task_id, mode.kind(), owner_user_id)
    }

    fn snapshot(&self, task_id: Uuid, kind: JobKind, owner_user_id: Option<i64>) -> Job {
        // Only a concurrent cleanup can have purged it
        self.inner
            .registry
            .get_task(task_id)
            .unwrap_or_else(|| Job::orphan(task_id, kind, owner_user_id))
    }
}
