// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table plans.
//!
//! A catalog is the only place table names come from. Entries are kept
//! sorted by priority (parents before children) and are never reordered
//! once built.
//!
//! | Priority | Table                  | Restore strategy  |
//! |----------|------------------------|-------------------|
//! | 10       | roles                  | upsert            |
//! | 20       | tags                   | upsert            |
//! | 30       | users                  | smart merge       |
//! | 40-100   | activities ... notifications | clear-insert |
//! | 110      | system_logs            | append with remap |
//! | 120      | ai_chat_history        | skipped           |

use super::{Strategy, TablePlanEntry};

const RESTORE_PLAN: &[(&str, Strategy, i32)] = &[
    ("roles", Strategy::Upsert, 10),
    ("tags", Strategy::Upsert, 20),
    ("users", Strategy::SmartMergeUser, 30),
    ("activities", Strategy::ClearInsert, 40),
    ("activity_registrations", Strategy::ClearInsert, 50),
    ("activity_tags", Strategy::ClearInsert, 60),
    ("user_tags", Strategy::ClearInsert, 70),
    ("checkin_records", Strategy::ClearInsert, 80),
    ("messages", Strategy::ClearInsert, 90),
    ("notifications", Strategy::ClearInsert, 100),
    ("system_logs", Strategy::AppendWithRemap, 110),
    ("ai_chat_history", Strategy::ReadOnlySkip, 120),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyCatalog {
    entries: Vec<TablePlanEntry>,
}

impl StrategyCatalog {
    /// Build a catalog from arbitrary entries, ordered by priority.
    ///
    /// Entries with equal priority keep their given order. A table listed
    /// twice keeps its first entry.
    pub fn new(entries: impl IntoIterator<Item = TablePlanEntry>) -> Self {
        let mut entries: Vec<TablePlanEntry> = entries.into_iter().collect();
        entries.sort_by_key(|e| e.priority);
        let mut seen = std::collections::HashSet::new();
        entries.retain(|e| seen.insert(e.table.clone()));
        Self { entries }
    }

    /// Plan for primary → backup. The primary is the copy of record, so
    /// every table is mirrored exactly; chat history is never copied.
    #[must_use]
    pub fn backup_default() -> Self {
        Self::new(RESTORE_PLAN.iter().map(|&(table, strategy, priority)| {
            let strategy = match strategy {
                Strategy::ReadOnlySkip => Strategy::ReadOnlySkip,
                _ => Strategy::ClearInsert,
            };
            TablePlanEntry::new(table, strategy, priority)
        }))
    }

    /// Plan for backup → primary on a new deployment.
    #[must_use]
    pub fn restore_default() -> Self {
        Self::new(
            RESTORE_PLAN
                .iter()
                .map(|&(table, strategy, priority)| TablePlanEntry::new(table, strategy, priority)),
        )
    }

    /// Reference tables only: the plan used when the primary already holds
    /// live data.
    #[must_use]
    pub fn safe_subset(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| e.strategy == Strategy::Upsert)
                .cloned()
                .collect(),
        }
    }

    /// Same tables, every non-skipped one forced to clear-insert.
    #[must_use]
    pub fn as_full_overwrite(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| e.strategy != Strategy::ReadOnlySkip)
                .map(|e| TablePlanEntry::new(e.table.clone(), Strategy::ClearInsert, e.priority))
                .collect(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[TablePlanEntry] {
        &self.entries
    }

    #[must_use]
    pub fn strategy_for(&self, table: &str) -> Option<Strategy> {
        self.entries.iter().find(|e| e.table == table).map(|e| e.strategy)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
