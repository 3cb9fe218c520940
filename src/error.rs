// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for sync jobs.
//!
//! Only [`SyncError::Connection`] and [`SyncError::Cancelled`] are fatal for a
//! whole job. Everything else is scoped to the table that raised it: the
//! table is recorded as skipped or failed and the job moves on.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::connection::DbRole;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Database unreachable (pool acquire or ping failed).
    #[error("{role} database unreachable: {message}")]
    Connection { role: DbRole, message: String },

    /// A planned table (or the columns it needs) is missing on one side.
    #[error("table '{table}' not usable on {side}: {reason}")]
    SchemaMismatch {
        table: String,
        side: DbRole,
        reason: String,
    },

    /// Every row of a write-through table was rejected by the target.
    #[error("constraint violation on '{table}': {message}")]
    ConstraintViolation { table: String, message: String },

    #[error("time budget of {budget:?} exceeded")]
    TimeoutExceeded { budget: Duration },

    #[error("job cancelled")]
    Cancelled,

    #[error("disabled for safety: {0}")]
    Disabled(String),

    #[error("confirmation token does not match the current dry-run report")]
    ConfirmationMismatch,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    Unknown(String),
}

impl SyncError {
    pub(crate) fn connection(role: DbRole, err: impl std::fmt::Display) -> Self {
        Self::Connection {
            role,
            message: err.to_string(),
        }
    }

    /// Short machine-readable label, the `error` label of table error metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::TimeoutExceeded { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Disabled(_) => "disabled",
            Self::ConfirmationMismatch => "confirmation_mismatch",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = SyncError::connection(DbRole::Backup, "refused");
        assert_eq!(err.to_string(), "backup database unreachable: refused");
        assert_eq!(err.kind(), "connection");
    }

    #[test]
    fn test_disabled_display() {
        let err = SyncError::Disabled("unconditional restore".into());
        assert!(err.to_string().starts_with("disabled for safety"));
        assert_eq!(err.kind(), "disabled");
    }
}
