// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL dialect differences behind the sqlx `Any` driver.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver only decodes a handful of portable types (integers,
//! floats, text, blobs, booleans). Everything else has to be routed through
//! text:
//!
//! - **PostgreSQL** → every column is read as `CAST(col AS TEXT)` and every
//!   bind is written as `CAST($n AS <declared type>)`. The text form of any
//!   Postgres value casts back to the same type (that is how `COPY` works).
//! - **MySQL** → non-portable columns (DATETIME, DECIMAL, JSON, ...) are read
//!   as `CAST(col AS CHAR)`; MySQL coerces strings on insert by itself.
//! - **SQLite** → dynamically typed, nothing to do.
//!
//! Identifiers never reach SQL unquoted: every table and column name goes
//! through [`Dialect::quote_ident`].

use serde::Serialize;

use super::ColumnInfo;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

/// MySQL `DATA_TYPE`s the Any driver decodes natively.
const MYSQL_NATIVE_TYPES: &[&str] = &[
    "tinyint", "smallint", "mediumint", "int", "integer", "bigint",
    "float", "double", "real",
    "char", "varchar", "tinytext", "text", "mediumtext", "longtext",
    "binary", "varbinary", "tinyblob", "blob", "mediumblob", "longblob",
];

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, SyncError> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(SyncError::Config(format!(
                "unsupported database scheme '{}'",
                other
            ))),
        }
    }

    /// Quote an identifier, doubling any embedded quote character.
    #[must_use]
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Sqlite | Self::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    #[must_use]
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${}", n),
            Self::Sqlite | Self::MySql => "?".to_string(),
        }
    }

    /// Upper bound on bind parameters in one statement.
    #[must_use]
    pub fn max_bind_params(self) -> usize {
        match self {
            Self::Sqlite => 32_766,
            Self::Postgres | Self::MySql => 65_535,
        }
    }

    /// Expression used to read `col` in a SELECT list.
    #[must_use]
    pub fn select_expr(self, col: &ColumnInfo) -> String {
        let quoted = self.quote_ident(&col.name);
        match self {
            Self::Postgres => format!("CAST({} AS TEXT)", quoted),
            Self::MySql if !is_mysql_native(&col.data_type) => {
                format!("CAST({} AS CHAR)", quoted)
            }
            _ => quoted,
        }
    }

    /// Expression used to write parameter `n` into `col`.
    #[must_use]
    pub fn insert_expr(self, col: &ColumnInfo, n: usize) -> String {
        match self {
            Self::Postgres if !col.data_type.is_empty() => {
                format!("CAST(${} AS {})", n, col.data_type)
            }
            _ => self.placeholder(n),
        }
    }

    /// Cast an integer aggregate so it always decodes as i64.
    #[must_use]
    pub fn bigint(self, expr: &str) -> String {
        match self {
            Self::Postgres => format!("CAST({} AS BIGINT)", expr),
            Self::MySql => format!("CAST({} AS SIGNED)", expr),
            Self::Sqlite => expr.to_string(),
        }
    }

    pub(crate) fn table_exists_sql(self) -> &'static str {
        match self {
            Self::Sqlite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?"
            }
            Self::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Self::MySql => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?"
            }
        }
    }

    /// Returns rows of `(name TEXT, data_type TEXT, pk BIGINT)` in ordinal order.
    pub(crate) fn columns_sql(self) -> &'static str {
        match self {
            Self::Sqlite => "SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid",
            Self::Postgres => {
                "SELECT CAST(c.column_name AS TEXT), \
                        CAST(CASE WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') \
                                  THEN c.udt_name ELSE c.data_type END AS TEXT), \
                        CAST(CASE WHEN EXISTS ( \
                            SELECT 1 FROM information_schema.table_constraints tc \
                            JOIN information_schema.key_column_usage k \
                              ON k.constraint_name = tc.constraint_name \
                             AND k.table_schema = tc.table_schema \
                             AND k.table_name = tc.table_name \
                            WHERE tc.constraint_type = 'PRIMARY KEY' \
                              AND tc.table_schema = c.table_schema \
                              AND tc.table_name = c.table_name \
                              AND k.column_name = c.column_name) \
                        THEN 1 ELSE 0 END AS BIGINT) \
                 FROM information_schema.columns c \
                 WHERE c.table_schema = current_schema() AND c.table_name = $1 \
                 ORDER BY c.ordinal_position"
            }
            Self::MySql => {
                "SELECT CAST(column_name AS CHAR), CAST(data_type AS CHAR), \
                        CAST(CASE WHEN column_key = 'PRI' THEN 1 ELSE 0 END AS SIGNED) \
                 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 ORDER BY ordinal_position"
            }
        }
    }

    pub(crate) fn foreign_keys_sql(self, enabled: bool) -> &'static str {
        match (self, enabled) {
            (Self::Sqlite, true) => "PRAGMA foreign_keys = ON",
            (Self::Sqlite, false) => "PRAGMA foreign_keys = OFF",
            (Self::Postgres, true) => "SET session_replication_role = DEFAULT",
            (Self::Postgres, false) => "SET session_replication_role = replica",
            (Self::MySql, true) => "SET FOREIGN_KEY_CHECKS = 1",
            (Self::MySql, false) => "SET FOREIGN_KEY_CHECKS = 0",
        }
    }

    pub(crate) fn foreign_keys_status_sql(self) -> &'static str {
        match self {
            Self::Sqlite => "PRAGMA foreign_keys",
            Self::Postgres => "SELECT current_setting('session_replication_role')",
            Self::MySql => "SELECT CAST(@@FOREIGN_KEY_CHECKS AS SIGNED)",
        }
    }

    /// Conflict clause turning a plain INSERT into an upsert on the
    /// primary-key columns `keys`. MySQL matches on every unique index.
    #[must_use]
    pub fn upsert_clause(self, columns: &[ColumnInfo], keys: &[String]) -> String {
        let updates: Vec<&ColumnInfo> = columns.iter().filter(|c| !keys.contains(&c.name)).collect();
        match self {
            Self::Sqlite | Self::Postgres => {
                let target = keys.iter().map(|k| self.quote_ident(k)).collect::<Vec<_>>().join(", ");
                if updates.is_empty() {
                    return format!(" ON CONFLICT ({}) DO NOTHING", target);
                }
                let sets: Vec<String> = updates
                    .iter()
                    .map(|c| {
                        let q = self.quote_ident(&c.name);
                        format!("{} = excluded.{}", q, q)
                    })
                    .collect();
                format!(" ON CONFLICT ({}) DO UPDATE SET {}", target, sets.join(", "))
            }
            Self::MySql => {
                if updates.is_empty() {
                    let q = keys.first().map(|k| self.quote_ident(k)).unwrap_or_default();
                    return format!(" ON DUPLICATE KEY UPDATE {} = {}", q, q);
                }
                let sets: Vec<String> = updates
                    .iter()
                    .map(|c| {
                        let q = self.quote_ident(&c.name);
                        format!("{} = VALUES({})", q, q)
                    })
                    .collect();
                format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", "))
            }
        }
    }

    /// Statement that moves a serial sequence past the current key maximum.
    ///
    /// Only PostgreSQL needs this: SQLite and MySQL advance their counters
    /// when explicit keys are inserted.
    #[must_use]
    pub fn sequence_resync_sql(self, table: &str, key: &str) -> Option<String> {
        match self {
            Self::Postgres => {
                let table_literal = self.quote_ident(table).replace('\'', "''");
                let key_literal = key.replace('\'', "''");
                Some(format!(
                    "SELECT setval(pg_get_serial_sequence('{}', '{}'), COALESCE(MAX({}), 0) + 1, false) FROM {}",
                    table_literal,
                    key_literal,
                    self.quote_ident(key),
                    self.quote_ident(table),
                ))
            }
            Self::Sqlite | Self::MySql => None,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Postgres => write!(f, "postgres"),
            Self::MySql => write!(f, "mysql"),
        }
    }
}

fn is_mysql_native(data_type: &str) -> bool {
    let lower = data_type.to_ascii_lowercase();
    MYSQL_NATIVE_TYPES.contains(&lower.as_str())
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
    fn test_from_url() {
        assert_eq!(Dialect::from_url("sqlite://temp/a.db?mode=rwc").unwrap(), Dialect::Sqlite);
        assert_eq!(Dialect::from_url("postgresql://u:p@h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("postgres://u:p@h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("mysql://u:p@h/db").unwrap(), Dialect::MySql);
        assert!(matches!(Dialect::from_url("redis://h"), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(Dialect::Postgres.quote_ident("users"), "\"users\"");
        assert_eq!(Dialect::Sqlite.quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(Dialect::MySql.quote_ident("a`b"), "`a``b`");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?");
        assert_eq!(Dialect::MySql.placeholder(3), "?");
    }

    #[test]
    fn test_postgres_reads_text_and_casts_back() {
        let c = col("created_at", "timestamp without time zone", false);
        assert_eq!(Dialect::Postgres.select_expr(&c), "CAST(\"created_at\" AS TEXT)");
        assert_eq!(
            Dialect::Postgres.insert_expr(&c, 2),
            "CAST($2 AS timestamp without time zone)"
        );
    }

    #[test]
    fn test_mysql_casts_only_non_native() {
        assert_eq!(Dialect::MySql.select_expr(&col("name", "varchar", false)), "`name`");
        assert_eq!(
            Dialect::MySql.select_expr(&col("created_at", "datetime", false)),
            "CAST(`created_at` AS CHAR)"
        );
    }

    #[test]
    fn test_upsert_clause_sqlite() {
        let cols = vec![col("id", "INTEGER", true), col("name", "TEXT", false)];
        assert_eq!(
            Dialect::Sqlite.upsert_clause(&cols, &["id".to_string()]),
            " ON CONFLICT (\"id\") DO UPDATE SET \"name\" = excluded.\"name\""
        );
    }

    #[test]
    fn test_upsert_clause_composite_key() {
        let cols = vec![
            col("activity_id", "INTEGER", true),
            col("tag_id", "INTEGER", true),
            col("note", "TEXT", false),
        ];
        let keys = vec!["activity_id".to_string(), "tag_id".to_string()];
        assert_eq!(
            Dialect::Postgres.upsert_clause(&cols, &keys),
            " ON CONFLICT (\"activity_id\", \"tag_id\") DO UPDATE SET \"note\" = excluded.\"note\""
        );
        assert_eq!(
            Dialect::MySql.upsert_clause(&cols, &keys),
            " ON DUPLICATE KEY UPDATE `note` = VALUES(`note`)"
        );
        assert_eq!(
            Dialect::Sqlite.upsert_clause(&cols[..2], &keys),
            " ON CONFLICT (\"activity_id\", \"tag_id\") DO NOTHING"
        );
    }

    #[test]
    fn test_upsert_clause_key_only() {
        let cols = vec![col("id", "INTEGER", true)];
        let keys = vec!["id".to_string()];
        assert_eq!(Dialect::Sqlite.upsert_clause(&cols, &keys), " ON CONFLICT (\"id\") DO NOTHING");
        assert_eq!(Dialect::MySql.upsert_clause(&cols, &keys), " ON DUPLICATE KEY UPDATE `id` = `id`");
    }

    #[test]
    fn test_sequence_resync_only_postgres() {
        assert!(Dialect::Sqlite.sequence_resync_sql("users", "id").is_none());
        assert!(Dialect::MySql.sequence_resync_sql("users", "id").is_none());
        let sql = Dialect::Postgres.sequence_resync_sql("users", "id").unwrap();
        assert!(sql.contains("pg_get_serial_sequence('\"users\"', 'id')"));
        assert!(sql.ends_with("FROM \"users\""));
    }
}
