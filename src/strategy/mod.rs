// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table merge strategies and the plans that order them.
//!
//! - [`catalog`]: which strategy each table uses, and in what order
//! - [`apply`]: the five strategies
//! - [`batch`]: batched, savepointed inserts shared by every strategy

pub mod apply;
pub mod batch;
pub mod catalog;

pub use apply::{apply, StrategyContext};
pub use batch::BatchOptions;
pub use catalog::StrategyCatalog;

use serde::{Deserialize, Serialize};

use crate::storage::ColumnInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Delete every target row, then copy every source row.
    ClearInsert,
    /// Insert or update by primary key; target-only rows survive.
    Upsert,
    /// Insert with primary keys shifted past the target maximum.
    AppendWithRemap,
    /// Insert only users whose business key is absent on the target.
    SmartMergeUser,
    /// In the plan but never synchronized.
    ReadOnlySkip,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClearInsert => "clear_insert",
            Self::Upsert => "upsert",
            Self::AppendWithRemap => "append_with_remap",
            Self::SmartMergeUser => "smart_merge_user",
            Self::ReadOnlySkip => "read_only_skip",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table in a processing plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePlanEntry {
    pub table: String,
    pub strategy: Strategy,
    pub priority: i32,
}

impl TablePlanEntry {
    pub fn new(table: impl Into<String>, strategy: Strategy, priority: i32) -> Self {
        Self {
            table: table.into(),
            strategy,
            priority,
        }
    }
}

/// Table and the columns both sides share.
#[derive(Debug, Clone)]
pub struct TableCopy<'a> {
    pub table: &'a str,
    pub columns: &'a [ColumnInfo],
}

impl TableCopy<'_> {
    /// Every primary-key column, in column order. Empty without a key.
    pub(crate) fn key_columns(&self) -> Vec<&ColumnInfo> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// The primary key and its position, when it is a single integer column.
    pub(crate) fn integer_key(&self) -> Option<(usize, &ColumnInfo)> {
        let mut keys = self.columns.iter().enumerate().filter(|(_, c)| c.primary_key);
        match (keys.next(), keys.next()) {
            (Some((idx, key)), None) if key.is_integer() => Some((idx, key)),
            _ => None,
        }
    }
}

/// Rows written and rows rejected for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableOutcome {
    pub rows_affected: u64,
    pub rows_skipped: u64,
}

impl TableOutcome {
    pub(crate) fn merge(&mut self, other: TableOutcome) {
        self.rows_affected += other.rows_affected;
        self.rows_skipped += other.rows_skipped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data_type: &str, primary_key: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: data_type.into(),
            primary_key,
        }
    }

    #[test]
    fn test_integer_key_needs_a_single_integer_column() {
        let single = [col("id", "INTEGER", true), col("name", "TEXT", false)];
        let copy = TableCopy { table: "tags", columns: &single };
        assert_eq!(copy.integer_key().map(|(idx, k)| (idx, k.name.as_str())), Some((0, "id")));

        let composite = [col("activity_id", "INTEGER", true), col("tag_id", "INTEGER", true)];
        let copy = TableCopy { table: "activity_tags", columns: &composite };
        assert!(copy.integer_key().is_none());
        assert_eq!(copy.key_columns().len(), 2);

        let text = [col("code", "TEXT", true)];
        let copy = TableCopy { table: "codes", columns: &text };
        assert!(copy.integer_key().is_none());
        assert_eq!(copy.key_columns().len(), 1);
    }
}
