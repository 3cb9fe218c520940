// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live-data detection for the primary database.
//!
//! Restore only runs its full plan against a primary that looks freshly
//! deployed. Checks run in order and stop at the first positive signal:
//!
//! 1. the activity table has any row
//! 2. the user table has more than `max_seeded_users` rows
//! 3. any secondary business table has any row
//!
//! A missing table counts as empty.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SyncError;
use crate::storage::DbSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    NewDeployment,
    HasLiveData,
}

/// Thresholds behind the live-data heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentThresholds {
    #[serde(default = "default_activity_table")]
    pub activity_table: String,

    #[serde(default = "default_user_table")]
    pub user_table: String,

    /// Users a fresh deployment may hold (seeded admin accounts)
    #[serde(default = "default_max_seeded_users")]
    pub max_seeded_users: i64,

    #[serde(default = "default_secondary_tables")]
    pub secondary_tables: Vec<String>,
}

fn default_activity_table() -> String { "activities".to_string() }
fn default_user_table() -> String { "users".to_string() }
fn default_max_seeded_users() -> i64 { 2 }
fn default_secondary_tables() -> Vec<String> {
    vec![
        "activity_registrations".to_string(),
        "checkin_records".to_string(),
        "activity_tags".to_string(),
    ]
}

impl Default for DeploymentThresholds {
    fn default() -> Self {
        Self {
            activity_table: default_activity_table(),
            user_table: default_user_table(),
            max_seeded_users: default_max_seeded_users(),
            secondary_tables: default_secondary_tables(),
        }
    }
}

pub struct DeploymentClassifier {
    thresholds: DeploymentThresholds,
}

impl DeploymentClassifier {
    pub fn new(thresholds: DeploymentThresholds) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub fn thresholds(&self) -> &DeploymentThresholds {
        &self.thresholds
    }

    /// Inspect indicator tables on the primary.
    pub async fn classify_primary(&self, primary: &mut DbSession) -> Result<Deployment, SyncError> {
        let t = &self.thresholds;

        let activities = primary.count_rows_if_exists(&t.activity_table).await?;
        if activities > 0 {
            info!(table = %t.activity_table, rows = activities, "Primary has live data");
            return Ok(Deployment::HasLiveData);
        }

        let users = primary.count_rows_if_exists(&t.user_table).await?;
        if users > t.max_seeded_users {
            info!(
                table = %t.user_table,
                rows = users,
                max_seeded = t.max_seeded_users,
                "Primary has live data"
            );
            return Ok(Deployment::HasLiveData);
        }

        for table in &t.secondary_tables {
            let rows = primary.count_rows_if_exists(table).await?;
            if rows > 0 {
                info!(table = %table, rows, "Primary has live data");
                return Ok(Deployment::HasLiveData);
            }
        }

        info!(users, "Primary looks like a new deployment");
        Ok(Deployment::NewDeployment)
    }
}

impl Default for DeploymentClassifier {
    fn default() -> Self {
        Self::new(DeploymentThresholds::default())
    }
}
