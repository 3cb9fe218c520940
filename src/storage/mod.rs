// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema-agnostic SQL access shared by both databases.
//!
//! - [`dialect`]: per-dialect SQL fragments and identifier quoting
//! - [`value`]: dynamically typed cells read through the sqlx `Any` driver
//! - [`session`]: a job's dedicated connection plus introspection helpers

pub mod dialect;
pub mod session;
pub mod value;

pub use dialect::Dialect;
pub use session::DbSession;
pub use value::{SqlRow, SqlValue};

use serde::Serialize;

/// One column as discovered by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type as the database reports it (used for PostgreSQL casts).
    pub data_type: String,
    pub primary_key: bool,
}

impl ColumnInfo {
    /// Declared as some integer type (`INTEGER`, `bigint`, `int(11)`, ...).
    #[must_use]
    pub fn is_integer(&self) -> bool {
        let lower = self.data_type.to_ascii_lowercase();
        let base = lower.split(|c: char| c == '(' || c == ' ').next().unwrap_or_default();
        matches!(
            base,
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "mediumint" | "int2" | "int4" | "int8"
                | "serial" | "bigserial"
        )
    }
}

/// Columns present on both sides, in source order, carrying the target's
/// declared types (writes are cast to the target type).
#[must_use]
pub fn shared_columns(source: &[ColumnInfo], target: &[ColumnInfo]) -> Vec<ColumnInfo> {
    source
        .iter()
        .filter_map(|s| {
            target.iter().find(|t| t.name == s.name).map(|t| ColumnInfo {
                name: s.name.clone(),
                data_type: t.data_type.clone(),
                primary_key: s.primary_key || t.primary_key,
            })
        })
        .collect()
}
