// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! A dedicated pooled connection held for the lifetime of one job.
//!
//! Foreign-key toggles are session state in every supported dialect, so the
//! connection that disabled them has to be the one that writes and the one
//! that re-enables them. Jobs never share a session.

use std::collections::HashSet;

use sqlx::any::Any;
use sqlx::pool::PoolConnection;
use sqlx::{AnyConnection, Row};

use super::dialect::Dialect;
use super::value::{SqlRow, SqlValue};
use super::ColumnInfo;
use crate::connection::DbRole;
use crate::error::SyncError;

pub struct DbSession {
    conn: PoolConnection<Any>,
    dialect: Dialect,
    role: DbRole,
}

impl DbSession {
    pub(crate) fn new(conn: PoolConnection<Any>, dialect: Dialect, role: DbRole) -> Self {
        Self { conn, dialect, role }
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn role(&self) -> DbRole {
        self.role
    }

    /// Raw connection, for strategy code that manages its own transactions.
    pub fn conn(&mut self) -> &mut AnyConnection {
        &mut *self.conn
    }

    pub async fn ping(&mut self) -> Result<(), SyncError> {
        sqlx::query("SELECT 1")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| SyncError::connection(self.role, e))?;
        Ok(())
    }

    pub async fn table_exists(&mut self, table: &str) -> Result<bool, SyncError> {
        let count: i64 = sqlx::query(self.dialect.table_exists_sql())
            .bind(table.to_string())
            .fetch_one(&mut *self.conn)
            .await?
            .try_get(0)?;
        Ok(count > 0)
    }

    /// Introspect the column set of `table`, in ordinal order.
    pub async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, SyncError> {
        let rows = sqlx::query(self.dialect.columns_sql())
            .bind(table.to_string())
            .fetch_all(&mut *self.conn)
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            let data_type = match SqlValue::decode(&row, 1)? {
                SqlValue::Null => String::new(),
                other => other.key_string().unwrap_or_default(),
            };
            let pk = SqlValue::decode(&row, 2)?.as_i64().unwrap_or(0);
            columns.push(ColumnInfo {
                name,
                data_type,
                primary_key: pk > 0,
            });
        }
        Ok(columns)
    }

    pub async fn count_rows(&mut self, table: &str) -> Result<i64, SyncError> {
        let sql = format!(
            "SELECT {} FROM {}",
            self.dialect.bigint("COUNT(*)"),
            self.dialect.quote_ident(table)
        );
        let count: i64 = sqlx::query(&sql)
            .fetch_one(&mut *self.conn)
            .await?
            .try_get(0)?;
        Ok(count)
    }

    /// Row count, treating a missing table as empty.
    pub async fn count_rows_if_exists(&mut self, table: &str) -> Result<i64, SyncError> {
        if !self.table_exists(table).await? {
            return Ok(0);
        }
        self.count_rows(table).await
    }

    /// Largest integer value of `column`, `None` for an empty table.
    pub async fn max_integer(&mut self, table: &str, column: &str) -> Result<Option<i64>, SyncError> {
        let sql = format!(
            "SELECT {} FROM {}",
            self.dialect.bigint(&format!("MAX({})", self.dialect.quote_ident(column))),
            self.dialect.quote_ident(table)
        );
        let row = sqlx::query(&sql).fetch_one(&mut *self.conn).await?;
        Ok(SqlValue::decode(&row, 0)?.as_i64())
    }

    /// Read every row of `table` restricted to `columns`, ordered by the
    /// primary-key columns when there are any.
    pub async fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[ColumnInfo],
    ) -> Result<Vec<SqlRow>, SyncError> {
        let select: Vec<String> = columns.iter().map(|c| self.dialect.select_expr(c)).collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            select.join(", "),
            self.dialect.quote_ident(table)
        );
        let keys: Vec<String> = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| self.dialect.quote_ident(&c.name))
            .collect();
        if !keys.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }

        let rows = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(SqlValue::decode_row(row)?);
        }
        Ok(out)
    }

    /// Distinct non-null values of `column`, as comparison strings.
    pub async fn key_set(&mut self, table: &str, column: &ColumnInfo) -> Result<HashSet<String>, SyncError> {
        let sql = format!(
            "SELECT {} FROM {}",
            self.dialect.select_expr(column),
            self.dialect.quote_ident(table)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;
        let mut keys = HashSet::with_capacity(rows.len());
        for row in &rows {
            if let Some(key) = SqlValue::decode(row, 0)?.key_string() {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    pub async fn set_foreign_keys(&mut self, enabled: bool) -> Result<(), SyncError> {
        sqlx::query(self.dialect.foreign_keys_sql(enabled))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn foreign_keys_enabled(&mut self) -> Result<bool, SyncError> {
        let row = sqlx::query(self.dialect.foreign_keys_status_sql())
            .fetch_one(&mut *self.conn)
            .await?;
        let value = SqlValue::decode(&row, 0)?;
        Ok(match self.dialect {
            Dialect::Postgres => value.key_string().as_deref() != Some("replica"),
            Dialect::Sqlite | Dialect::MySql => value.as_i64().unwrap_or(0) != 0,
        })
    }

    /// Best-effort sequence catch-up after explicit-key inserts.
    pub async fn resync_sequence(&mut self, table: &str, key: &str) {
        let Some(sql) = self.dialect.sequence_resync_sql(table, key) else {
            return;
        };
        if let Err(e) = sqlx::query(&sql).execute(&mut *self.conn).await {
            tracing::debug!(table, error = %e, "Sequence resync skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::DbRole;
    use crate::test_support::{exec, sqlite_pool, TempDb};

    use super::*;

    #[tokio::test]
    async fn test_introspection_on_sqlite() {
        let db = TempDb::new("session_introspect");
        let pool = sqlite_pool(&db).await;
        exec(&pool, "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT NOT NULL, score REAL)").await;
        exec(&pool, "INSERT INTO users (id, username, score) VALUES (1, 'admin', 1.5), (2, 'bob', NULL)").await;

        let conn = pool.acquire().await.unwrap();
        let mut session = DbSession::new(conn, Dialect::Sqlite, DbRole::Primary);

        assert!(session.table_exists("users").await.unwrap());
        assert!(!session.table_exists("missing").await.unwrap());
        assert_eq!(session.count_rows("users").await.unwrap(), 2);
        assert_eq!(session.count_rows_if_exists("missing").await.unwrap(), 0);
        assert_eq!(session.max_integer("users", "id").await.unwrap(), Some(2));

        let columns = session.columns("users").await.unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "username", "score"]);
        assert!(columns[0].primary_key);
        assert!(!columns[1].primary_key);

        let rows = session.fetch_rows("users", &columns).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], SqlValue::Text("admin".into()));
        assert_eq!(rows[1][2], SqlValue::Null);

        let keys = session.key_set("users", &columns[1]).await.unwrap();
        assert!(keys.contains("admin") && keys.contains("bob"));
    }

    #[tokio::test]
    async fn test_foreign_key_toggle_on_sqlite() {
        let db = TempDb::new("session_fk");
        let pool = sqlite_pool(&db).await;
        let conn = pool.acquire().await.unwrap();
        let mut session = DbSession::new(conn, Dialect::Sqlite, DbRole::Backup);

        session.set_foreign_keys(false).await.unwrap();
        assert!(!session.foreign_keys_enabled().await.unwrap());
        session.set_foreign_keys(true).await.unwrap();
        assert!(session.foreign_keys_enabled().await.unwrap());
    }
}
