// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary and backup connection pools.
//!
//! Pools are created lazily: building a [`ConnectionManager`] never touches
//! the network, so an unreachable database surfaces when a job (or a health
//! check) first asks for it.
//!
//! | Role    | Max connections | Acquire timeout |
//! |---------|-----------------|-----------------|
//! | primary | 10              | 10 s            |
//! | backup  | 5               | 15 s            |
//!
//! Both recycle connections after 30 minutes and ping before handing one out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::{DbSession, Dialect};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Which of the two databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbRole {
    Primary,
    Backup,
}

impl DbRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
        }
    }

    fn max_connections(self) -> u32 {
        match self {
            Self::Primary => 10,
            Self::Backup => 5,
        }
    }

    fn acquire_timeout(self) -> Duration {
        match self {
            Self::Primary => Duration::from_secs(10),
            Self::Backup => Duration::from_secs(15),
        }
    }
}

impl std::fmt::Display for DbRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const RECYCLE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Consecutive failures before a database is reported unhealthy.
const UNHEALTHY_AFTER: u64 = 3;

/// Consecutive-failure health tracking for one database.
pub struct HealthTracker {
    /// Last known health state
    healthy: AtomicBool,
    /// Consecutive failure count
    failures: AtomicU64,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true), // Assume healthy until proven otherwise
            failures: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= UNHEALTHY_AFTER {
            self.healthy.store(false, Ordering::Release);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct Endpoint {
    url: String,
    dialect: Dialect,
    pool: AnyPool,
    health: HealthTracker,
}

impl Endpoint {
    fn new(role: DbRole, url: &str) -> Result<Self, SyncError> {
        let dialect = Dialect::from_url(url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(role.max_connections())
            .acquire_timeout(role.acquire_timeout())
            .idle_timeout(Some(RECYCLE_AFTER))
            .max_lifetime(Some(RECYCLE_AFTER))
            .test_before_acquire(true)
            .connect_lazy(url)
            .map_err(|e| SyncError::Config(format!("invalid {} database URL: {}", role, e)))?;
        Ok(Self {
            url: url.to_string(),
            dialect,
            pool,
            health: HealthTracker::new(),
        })
    }
}

/// Reachability of one database.
#[derive(Debug, Clone, Serialize)]
pub struct RoleHealth {
    pub configured: bool,
    pub reachable: bool,
    /// Tracked health: false after repeated consecutive failures.
    pub healthy: bool,
    pub consecutive_failures: u64,
    pub latency_ms: Option<f64>,
    pub dialect: Option<Dialect>,
    pub error: Option<String>,
}

impl RoleHealth {
    fn unconfigured() -> Self {
        Self {
            configured: false,
            reachable: false,
            healthy: false,
            consecutive_failures: 0,
            latency_ms: None,
            dialect: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub dual_enabled: bool,
    pub primary: RoleHealth,
    pub backup: RoleHealth,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    #[must_use]
    pub fn role(&self, role: DbRole) -> &RoleHealth {
        match role {
            DbRole::Primary => &self.primary,
            DbRole::Backup => &self.backup,
        }
    }

    /// Both databases configured and answering.
    #[must_use]
    pub fn all_reachable(&self) -> bool {
        self.primary.reachable && self.backup.reachable
    }
}

/// Owns the two pools and hands out per-job sessions.
pub struct ConnectionManager {
    primary: Option<Endpoint>,
    backup: Option<Endpoint>,
    retry: RetryConfig,
}

impl ConnectionManager {
    /// Build lazily-connected pools for whichever URLs are configured.
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        install_drivers();
        let primary = config
            .primary_url
            .as_deref()
            .map(|url| Endpoint::new(DbRole::Primary, url))
            .transpose()?;
        let backup = config
            .backup_url
            .as_deref()
            .map(|url| Endpoint::new(DbRole::Backup, url))
            .transpose()?;

        info!(
            primary = primary.as_ref().map(|e| e.dialect.to_string()).unwrap_or_else(|| "unset".into()),
            backup = backup.as_ref().map(|e| e.dialect.to_string()).unwrap_or_else(|| "unset".into()),
            "Connection manager initialized"
        );

        Ok(Self {
            primary,
            backup,
            retry: RetryConfig::connect(),
        })
    }

    /// Override the session-acquire retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, role: DbRole) -> Option<&Endpoint> {
        match role {
            DbRole::Primary => self.primary.as_ref(),
            DbRole::Backup => self.backup.as_ref(),
        }
    }

    /// Both URLs configured.
    #[must_use]
    pub fn is_dual_enabled(&self) -> bool {
        self.primary.is_some() && self.backup.is_some()
    }

    #[must_use]
    pub fn dialect(&self, role: DbRole) -> Option<Dialect> {
        self.endpoint(role).map(|e| e.dialect)
    }

    /// Shared pool for short best-effort statements outside a job session.
    #[must_use]
    pub fn pool(&self, role: DbRole) -> Option<&AnyPool> {
        self.endpoint(role).map(|e| &e.pool)
    }

    /// Tracked health, without pinging.
    #[must_use]
    pub fn is_healthy(&self, role: DbRole) -> bool {
        self.endpoint(role).map_or(false, |e| e.health.is_healthy())
    }

    /// Acquire a dedicated connection for one job and verify it answers.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self, role: DbRole) -> Result<DbSession, SyncError> {
        let endpoint = self
            .endpoint(role)
            .ok_or_else(|| SyncError::connection(role, "not configured"))?;

        let result = retry(&format!("{}_connect", role), &self.retry, || async {
            let conn = endpoint
                .pool
                .acquire()
                .await
                .map_err(|e| SyncError::connection(role, e))?;
            let mut session = DbSession::new(conn, endpoint.dialect, role);
            session.ping().await?;
            Ok::<_, SyncError>(session)
        })
        .await;

        match result {
            Ok(session) => {
                endpoint.health.record_success();
                Ok(session)
            }
            Err(e) => {
                endpoint.health.record_failure();
                metrics::record_connection_error(role.as_str());
                Err(e)
            }
        }
    }

    async fn check_role(&self, role: DbRole) -> RoleHealth {
        let Some(endpoint) = self.endpoint(role) else {
            return RoleHealth::unconfigured();
        };

        let start = Instant::now();
        let ping = sqlx::query("SELECT 1").execute(&endpoint.pool).await;
        let elapsed = start.elapsed();

        let (reachable, latency_ms, error) = match ping {
            Ok(_) => {
                endpoint.health.record_success();
                metrics::record_database_latency(role.as_str(), elapsed);
                info!(role = %role, latency_ms = elapsed.as_secs_f64() * 1000.0, "Database reachable");
                (true, Some(elapsed.as_secs_f64() * 1000.0), None)
            }
            Err(e) => {
                endpoint.health.record_failure();
                metrics::record_connection_error(role.as_str());
                warn!(role = %role, error = %e, "Database unreachable");
                (false, None, Some(e.to_string()))
            }
        };
        metrics::set_database_health(role.as_str(), reachable);

        RoleHealth {
            configured: true,
            reachable,
            healthy: endpoint.health.is_healthy(),
            consecutive_failures: endpoint.health.failure_count(),
            latency_ms,
            dialect: Some(endpoint.dialect),
            error,
        }
    }

    /// Ping both databases.
    pub async fn health_check(&self) -> HealthReport {
        let (primary, backup) = tokio::join!(
            self.check_role(DbRole::Primary),
            self.check_role(DbRole::Backup)
        );
        HealthReport {
            dual_enabled: self.is_dual_enabled(),
            primary,
            backup,
            checked_at: Utc::now(),
        }
    }

    /// Primary if it answers, else backup if it answers, else whichever is
    /// configured.
    pub async fn preferred_url(&self) -> Option<String> {
        for role in [DbRole::Primary, DbRole::Backup] {
            if self.endpoint(role).is_some() && self.check_role(role).await.reachable {
                return self.endpoint(role).map(|e| e.url.clone());
            }
            if role == DbRole::Primary && self.primary.is_some() {
                warn!("Primary database unavailable, trying backup");
            }
        }
        self.primary
            .as_ref()
            .or(self.backup.as_ref())
            .map(|e| e.url.clone())
    }
}
