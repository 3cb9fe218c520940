//! # Dual Sync Engine
//!
//! Keeps a backup database in step with a primary and restores the primary
//! from the backup after a disaster, without clobbering live data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SyncOrchestrator                       │
//! │  • start_backup / start_restore / dangerous_full_restore   │
//! │  • TaskRegistry: job status, progress, cancellation        │
//! │  • AuditTrail: in-memory + system_logs on the primary      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (per table, in priority order)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Strategy catalog                        │
//! │  • clear_insert, upsert, append_with_remap                 │
//! │  • smart_merge_user, read_only_skip                        │
//! │  • Batched writes, savepoint per batch, row fallback       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                        │
//! │  • Lazy sqlx pools for primary and backup                  │
//! │  • SQLite, PostgreSQL, MySQL via the Any driver            │
//! │  • Health tracking and connect retries                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dual_sync_engine::{JobStatus, SyncConfig, SyncOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dual_sync_engine::SyncError> {
//!     let orchestrator = SyncOrchestrator::new(SyncConfig::from_env()?)?;
//!
//!     let job = orchestrator.run_backup(None).await;
//!     if job.status == JobStatus::Completed {
//!         println!("{} rows copied", job.total_rows);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: Backup, restore and the guarded full overwrite
//! - [`strategy`]: Per-table synchronization strategies and plans
//! - [`classifier`]: New deployment vs live data detection
//! - [`connection`]: Pools, health and database roles
//! - [`tasks`]: Job records and the task registry
//! - [`audit`]: Audit trail
//! - [`scheduler`]: Periodic backups and health ticks
//! - [`storage`]: Dialects, row values and per-job sessions

pub mod audit;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod resilience;
pub mod scheduler;
pub mod storage;
pub mod strategy;
pub mod tasks;

pub use audit::{AuditRecord, AuditStatus, AuditTrail};
pub use classifier::{Deployment, DeploymentClassifier, DeploymentThresholds};
pub use config::SyncConfig;
pub use connection::{ConnectionManager, DbRole, HealthReport, RoleHealth};
pub use error::SyncError;
pub use metrics::JobTimer;
pub use orchestrator::{DryRunReport, DryRunTable, SyncOrchestrator};
pub use resilience::retry::RetryConfig;
pub use scheduler::Scheduler;
pub use strategy::{Strategy, StrategyCatalog, TableOutcome, TablePlanEntry};
pub use tasks::{Job, JobKind, JobStatus, JobUpdate, TaskRegistry};

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use sqlx::AnyPool;

    use crate::connection::install_drivers;

    /// SQLite file under the local `temp/` folder, removed on drop.
    pub struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        pub fn new(name: &str) -> Self {
            std::fs::create_dir_all("temp").unwrap();
            let path = PathBuf::from("temp").join(format!("{}_{}.db", name, uuid::Uuid::new_v4().simple()));
            Self { path }
        }

        pub fn url(&self) -> String {
            format!("sqlite://{}?mode=rwc", self.path.display())
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
            for suffix in ["-wal", "-shm"] {
                let mut extra = self.path.clone().into_os_string();
                extra.push(suffix);
                let _ = std::fs::remove_file(extra);
            }
        }
    }

    pub async fn sqlite_pool(db: &TempDb) -> AnyPool {
        install_drivers();
        AnyPool::connect(&db.url()).await.unwrap()
    }

    pub async fn exec(pool: &AnyPool, sql: &str) {
        sqlx::query(sql).execute(pool).await.unwrap();
    }
}
