// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batched inserts.
//!
//! ```text
//! rows ─► groups of (batch_size × commit_every) ─► one transaction each
//!              └─► batches of batch_size ─► one savepoint + one INSERT each
//!                       └─ on failure ─► one savepoint + one INSERT per row,
//!                                        rejected rows skipped
//! ```
//!
//! Rows already committed by earlier groups stay committed if a later group
//! is cancelled or fails.

use sqlx::AnyConnection;
use sqlx::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TableOutcome;
use crate::error::SyncError;
use crate::storage::{ColumnInfo, DbSession, Dialect, SqlRow};

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Rows per INSERT statement
    pub batch_size: usize,
    /// Batches per transaction
    pub commit_every: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            commit_every: 10,
        }
    }
}

impl BatchOptions {
    /// Rows per statement after applying the dialect's bind-parameter limit.
    #[must_use]
    pub fn rows_per_statement(&self, dialect: Dialect, column_count: usize) -> usize {
        let by_params = dialect.max_bind_params() / column_count.max(1);
        self.batch_size.max(1).min(by_params.max(1))
    }
}

/// How a conflicting row is treated by the bulk statement.
#[derive(Debug, Clone)]
pub(crate) enum Conflict {
    /// Plain INSERT; a conflicting batch falls back to per-row inserts.
    Reject,
    /// Update the existing row keyed by the given primary-key columns.
    Update(Vec<String>),
}

/// Everything the engine needs to write one table.
pub(crate) struct InsertJob<'a> {
    pub table: &'a str,
    pub columns: &'a [ColumnInfo],
    pub conflict: Conflict,
    /// Statement run inside the first transaction, before any insert.
    pub preamble: Option<String>,
}

impl InsertJob<'_> {
    fn sql(&self, dialect: Dialect, row_count: usize) -> String {
        let names: Vec<String> = self.columns.iter().map(|c| dialect.quote_ident(&c.name)).collect();
        let width = self.columns.len();
        let tuples: Vec<String> = (0..row_count)
            .map(|r| {
                let exprs: Vec<String> = self
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| dialect.insert_expr(c, r * width + i + 1))
                    .collect();
                format!("({})", exprs.join(", "))
            })
            .collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            dialect.quote_ident(self.table),
            names.join(", "),
            tuples.join(", ")
        );
        if let Conflict::Update(keys) = &self.conflict {
            sql.push_str(&dialect.upsert_clause(self.columns, keys));
        }
        sql
    }
}

/// Write `rows` into the target session.
pub(crate) async fn insert_rows(
    target: &mut DbSession,
    job: &InsertJob<'_>,
    rows: &[SqlRow],
    options: &BatchOptions,
    cancel: &CancellationToken,
) -> Result<TableOutcome, SyncError> {
    let dialect = target.dialect();
    let per_statement = options.rows_per_statement(dialect, job.columns.len());
    let per_transaction = per_statement * options.commit_every.max(1);
    let mut outcome = TableOutcome::default();
    let mut preamble = job.preamble.clone();

    if rows.is_empty() {
        if let Some(sql) = preamble {
            let mut tx = target.conn().begin().await?;
            sqlx::query(&sql).execute(&mut *tx).await?;
            tx.commit().await?;
        }
        return Ok(outcome);
    }

    let mut offset = 0;
    for group in rows.chunks(per_transaction) {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut tx = target.conn().begin().await?;
        if let Some(sql) = preamble.take() {
            sqlx::query(&sql).execute(&mut *tx).await?;
        }

        for batch in group.chunks(per_statement) {
            if cancel.is_cancelled() {
                tx.rollback().await?;
                return Err(SyncError::Cancelled);
            }
            let written = insert_batch(&mut *tx, dialect, job, batch, offset).await?;
            outcome.merge(written);
            offset += batch.len();
        }

        tx.commit().await?;
        debug!(table = job.table, rows = offset, "Committed insert group");
    }

    Ok(outcome)
}

async fn insert_batch(
    conn: &mut AnyConnection,
    dialect: Dialect,
    job: &InsertJob<'_>,
    batch: &[SqlRow],
    offset: usize,
) -> Result<TableOutcome, SyncError> {
    let sql = job.sql(dialect, batch.len());
    let mut savepoint = conn.begin().await?;
    let mut query = sqlx::query(&sql);
    for row in batch {
        for value in row {
            query = value.bind_to(query);
        }
    }

    match query.execute(&mut *savepoint).await {
        Ok(_) => {
            savepoint.commit().await?;
            return Ok(TableOutcome {
                rows_affected: batch.len() as u64,
                rows_skipped: 0,
            });
        }
        Err(e) => {
            savepoint.rollback().await?;
            debug!(table = job.table, rows = batch.len(), error = %e, "Bulk insert failed, retrying row by row");
        }
    }

    let single = job.sql(dialect, 1);
    let mut outcome = TableOutcome::default();
    for (i, row) in batch.iter().enumerate() {
        let mut savepoint = conn.begin().await?;
        let mut query = sqlx::query(&single);
        for value in row {
            query = value.bind_to(query);
        }
        match query.execute(&mut *savepoint).await {
            Ok(_) => {
                savepoint.commit().await?;
                outcome.rows_affected += 1;
            }
            Err(e) => {
                savepoint.rollback().await?;
                outcome.rows_skipped += 1;
                warn!(table = job.table, row = offset + i, error = %e, "Row rejected, skipping");
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DbRole;
    use crate::storage::SqlValue;
    use crate::test_support::{exec, sqlite_pool, TempDb};

    fn col(name: &str, primary_key: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: String::new(),
            primary_key,
        }
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<SqlRow> {
        range
            .map(|i| vec![SqlValue::Int(i), SqlValue::Text(format!("name-{}", i))])
            .collect()
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        let options = BatchOptions::default();
        assert_eq!(options.rows_per_statement(Dialect::Postgres, 2), 1000);
        assert_eq!(options.rows_per_statement(Dialect::Sqlite, 100), 327);
        let tiny = BatchOptions { batch_size: 0, commit_every: 0 };
        assert_eq!(tiny.rows_per_statement(Dialect::MySql, 3), 1);
    }

    #[test]
    fn test_insert_sql_numbering() {
        let columns = vec![col("id", true), col("name", false)];
        let job = InsertJob {
            table: "tags",
            columns: &columns,
            conflict: Conflict::Update(vec!["id".into()]),
            preamble: None,
        };
        assert_eq!(
            job.sql(Dialect::Postgres, 2),
            "INSERT INTO \"tags\" (\"id\", \"name\") VALUES ($1, $2), ($3, $4) \
             ON CONFLICT (\"id\") DO UPDATE SET \"name\" = excluded.\"name\""
        );
    }

    #[tokio::test]
    async fn test_insert_rows_in_small_batches() {
        let db = TempDb::new("batch_small");
        let pool = sqlite_pool(&db).await;
        exec(&pool, "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT)").await;

        let mut session = DbSession::new(pool.acquire().await.unwrap(), Dialect::Sqlite, DbRole::Backup);
        let columns = vec![col("id", true), col("name", false)];
        let job = InsertJob {
            table: "tags",
            columns: &columns,
            conflict: Conflict::Reject,
            preamble: None,
        };
        let options = BatchOptions { batch_size: 3, commit_every: 2 };

        let outcome = insert_rows(&mut session, &job, &rows(0..20), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TableOutcome { rows_affected: 20, rows_skipped: 0 });
        assert_eq!(session.count_rows("tags").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_conflicting_rows_are_skipped_individually() {
        let db = TempDb::new("batch_conflict");
        let pool = sqlite_pool(&db).await;
        exec(&pool, "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT)").await;
        exec(&pool, "INSERT INTO tags (id, name) VALUES (2, 'taken'), (4, 'taken')").await;

        let mut session = DbSession::new(pool.acquire().await.unwrap(), Dialect::Sqlite, DbRole::Backup);
        let columns = vec![col("id", true), col("name", false)];
        let job = InsertJob {
            table: "tags",
            columns: &columns,
            conflict: Conflict::Reject,
            preamble: None,
        };

        let outcome = insert_rows(&mut session, &job, &rows(0..6), &BatchOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TableOutcome { rows_affected: 4, rows_skipped: 2 });
        assert_eq!(session.count_rows("tags").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_preamble_runs_even_without_rows() {
        let db = TempDb::new("batch_preamble");
        let pool = sqlite_pool(&db).await;
        exec(&pool, "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT)").await;
        exec(&pool, "INSERT INTO tags (id, name) VALUES (1, 'old')").await;

        let mut session = DbSession::new(pool.acquire().await.unwrap(), Dialect::Sqlite, DbRole::Backup);
        let columns = vec![col("id", true), col("name", false)];
        let job = InsertJob {
            table: "tags",
            columns: &columns,
            conflict: Conflict::Reject,
            preamble: Some("DELETE FROM \"tags\"".into()),
        };

        insert_rows(&mut session, &job, &[], &BatchOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.count_rows("tags").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_group() {
        let db = TempDb::new("batch_cancel");
        let pool = sqlite_pool(&db).await;
        exec(&pool, "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT)").await;

        let mut session = DbSession::new(pool.acquire().await.unwrap(), Dialect::Sqlite, DbRole::Backup);
        let columns = vec![col("id", true), col("name", false)];
        let job = InsertJob {
            table: "tags",
            columns: &columns,
            conflict: Conflict::Reject,
            preamble: None,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = insert_rows(&mut session, &job, &rows(0..5), &BatchOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(session.count_rows("tags").await.unwrap(), 0);
    }
}
