// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The five per-table strategies.
//!
//! Every strategy reads the shared columns from the source session, writes
//! through [`super::batch`], and commits its own transactions.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::batch::{insert_rows, BatchOptions, Conflict, InsertJob};
use super::{Strategy, TableCopy, TableOutcome};
use crate::error::SyncError;
use crate::metrics;
use crate::storage::{DbSession, SqlRow};

/// Per-job settings every strategy sees.
#[derive(Debug, Clone)]
pub struct StrategyContext<'a> {
    pub batch: BatchOptions,
    pub cancel: &'a CancellationToken,
    /// Move PostgreSQL sequences past explicitly inserted keys
    pub reset_sequences: bool,
    /// Business key for [`Strategy::SmartMergeUser`]
    pub user_key_column: &'a str,
}

/// Run `strategy` for one table.
pub async fn apply(
    strategy: Strategy,
    source: &mut DbSession,
    target: &mut DbSession,
    copy: &TableCopy<'_>,
    ctx: &StrategyContext<'_>,
) -> Result<TableOutcome, SyncError> {
    let started = Instant::now();
    let outcome = match strategy {
        Strategy::ReadOnlySkip => {
            info!(table = copy.table, "Synchronization disabled for table, skipped");
            return Ok(TableOutcome::default());
        }
        Strategy::ClearInsert => clear_insert(source, target, copy, ctx).await?,
        Strategy::Upsert => upsert(source, target, copy, ctx).await?,
        Strategy::AppendWithRemap => append_with_remap(source, target, copy, ctx).await?,
        Strategy::SmartMergeUser => smart_merge_user(source, target, copy, ctx).await?,
    };

    metrics::record_rows_written(strategy.as_str(), outcome.rows_affected);
    if outcome.rows_skipped > 0 {
        metrics::record_rows_skipped(strategy.as_str(), outcome.rows_skipped);
    }
    metrics::record_table_latency(strategy.as_str(), started.elapsed());
    Ok(outcome)
}

async fn clear_insert(
    source: &mut DbSession,
    target: &mut DbSession,
    copy: &TableCopy<'_>,
    ctx: &StrategyContext<'_>,
) -> Result<TableOutcome, SyncError> {
    let rows = source.fetch_rows(copy.table, copy.columns).await?;
    let job = InsertJob {
        table: copy.table,
        columns: copy.columns,
        conflict: Conflict::Reject,
        preamble: Some(format!("DELETE FROM {}", target.dialect().quote_ident(copy.table))),
    };
    let outcome = insert_rows(target, &job, &rows, &ctx.batch, ctx.cancel).await?;
    ensure_any_written(copy.table, rows.len(), &outcome)?;
    resync_sequence(target, copy, ctx).await;
    Ok(outcome)
}

async fn upsert(
    source: &mut DbSession,
    target: &mut DbSession,
    copy: &TableCopy<'_>,
    ctx: &StrategyContext<'_>,
) -> Result<TableOutcome, SyncError> {
    let keys = copy.key_columns();
    let conflict = if keys.is_empty() {
        debug!(table = copy.table, "No primary key, inserting and skipping conflicts");
        Conflict::Reject
    } else {
        Conflict::Update(keys.iter().map(|k| k.name.clone()).collect())
    };
    let rows = source.fetch_rows(copy.table, copy.columns).await?;
    let job = InsertJob {
        table: copy.table,
        columns: copy.columns,
        conflict,
        preamble: None,
    };
    let outcome = insert_rows(target, &job, &rows, &ctx.batch, ctx.cancel).await?;
    ensure_any_written(copy.table, rows.len(), &outcome)?;
    resync_sequence(target, copy, ctx).await;
    Ok(outcome)
}

async fn append_with_remap(
    source: &mut DbSession,
    target: &mut DbSession,
    copy: &TableCopy<'_>,
    ctx: &StrategyContext<'_>,
) -> Result<TableOutcome, SyncError> {
    let mut rows = source.fetch_rows(copy.table, copy.columns).await?;

    if let Some((idx, key)) = copy.integer_key() {
        let offset = target.max_integer(copy.table, &key.name).await?.unwrap_or(0);
        if offset > 0 {
            info!(table = copy.table, offset, "Shifting keys past target maximum");
            remap_keys(&mut rows, idx, offset);
        }
    }

    let job = InsertJob {
        table: copy.table,
        columns: copy.columns,
        conflict: Conflict::Reject,
        preamble: None,
    };
    let outcome = insert_rows(target, &job, &rows, &ctx.batch, ctx.cancel).await?;
    resync_sequence(target, copy, ctx).await;
    Ok(outcome)
}

async fn smart_merge_user(
    source: &mut DbSession,
    target: &mut DbSession,
    copy: &TableCopy<'_>,
    ctx: &StrategyContext<'_>,
) -> Result<TableOutcome, SyncError> {
    let Some((idx, key)) = copy
        .columns
        .iter()
        .enumerate()
        .find(|(_, c)| c.name == ctx.user_key_column)
    else {
        return Err(SyncError::SchemaMismatch {
            table: copy.table.to_string(),
            side: target.role(),
            reason: format!("business key column '{}' missing", ctx.user_key_column),
        });
    };

    let existing = target.key_set(copy.table, key).await?;
    let rows = source.fetch_rows(copy.table, copy.columns).await?;
    let total = rows.len();
    let fresh = new_by_business_key(rows, idx, existing);
    let already_present = (total - fresh.len()) as u64;

    info!(
        table = copy.table,
        new = fresh.len(),
        existing = already_present,
        "Merging by business key, existing rows untouched"
    );

    let job = InsertJob {
        table: copy.table,
        columns: copy.columns,
        conflict: Conflict::Reject,
        preamble: None,
    };
    let mut outcome = insert_rows(target, &job, &fresh, &ctx.batch, ctx.cancel).await?;
    outcome.rows_skipped += already_present;
    resync_sequence(target, copy, ctx).await;
    Ok(outcome)
}

/// Shift integer keys in column `idx` by `offset`.
fn remap_keys(rows: &mut [SqlRow], idx: usize, offset: i64) {
    for row in rows.iter_mut() {
        if let Some(key) = row[idx].as_i64() {
            row[idx] = row[idx].with_i64(key.saturating_add(offset));
        }
    }
}

/// Rows whose business key is neither on the target nor earlier in `rows`.
/// Rows with a NULL key are dropped.
fn new_by_business_key(
    rows: Vec<SqlRow>,
    idx: usize,
    mut seen: std::collections::HashSet<String>,
) -> Vec<SqlRow> {
    rows.into_iter()
        .filter(|row| row[idx].key_string().map_or(false, |key| seen.insert(key)))
        .collect()
}

fn ensure_any_written(table: &str, source_rows: usize, outcome: &TableOutcome) -> Result<(), SyncError> {
    if source_rows > 0 && outcome.rows_affected == 0 {
        return Err(SyncError::ConstraintViolation {
            table: table.to_string(),
            message: format!("all {} rows rejected by the target", source_rows),
        });
    }
    Ok(())
}

async fn resync_sequence(target: &mut DbSession, copy: &TableCopy<'_>, ctx: &StrategyContext<'_>) {
    if !ctx.reset_sequences {
        return;
    }
    if let Some((_, key)) = copy.integer_key() {
        target.resync_sequence(copy.table, &key.name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DbRole;
    use crate::storage::{shared_columns, Dialect, SqlValue};
    use crate::test_support::{exec, sqlite_pool, TempDb};
    use sqlx::AnyPool;

    struct Pair {
        _source_db: TempDb,
        _target_db: TempDb,
        source_pool: AnyPool,
        target_pool: AnyPool,
    }

    impl Pair {
        async fn new(name: &str, schema: &str) -> Self {
            let source_db = TempDb::new(&format!("{}_src", name));
            let target_db = TempDb::new(&format!("{}_dst", name));
            let source_pool = sqlite_pool(&source_db).await;
            let target_pool = sqlite_pool(&target_db).await;
            exec(&source_pool, schema).await;
            exec(&target_pool, schema).await;
            Self {
                _source_db: source_db,
                _target_db: target_db,
                source_pool,
                target_pool,
            }
        }

        async fn run(&self, strategy: Strategy, table: &str) -> Result<TableOutcome, SyncError> {
            let mut source = DbSession::new(self.source_pool.acquire().await.unwrap(), Dialect::Sqlite, DbRole::Primary);
            let mut target = DbSession::new(self.target_pool.acquire().await.unwrap(), Dialect::Sqlite, DbRole::Backup);
            let columns = shared_columns(
                &source.columns(table).await.unwrap(),
                &target.columns(table).await.unwrap(),
            );
            let cancel = CancellationToken::new();
            let ctx = StrategyContext {
                batch: BatchOptions { batch_size: 2, commit_every: 2 },
                cancel: &cancel,
                reset_sequences: true,
                user_key_column: "username",
            };
            let copy = TableCopy { table, columns: &columns };
            apply(strategy, &mut source, &mut target, &copy, &ctx).await
        }

        async fn target_rows(&self, sql: &str) -> Vec<SqlRow> {
            let rows = sqlx::query(sql).fetch_all(&self.target_pool).await.unwrap();
            rows.iter().map(|r| SqlValue::decode_row(r).unwrap()).collect()
        }
    }

    const TAGS: &str = "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL)";
    const USERS: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT NOT NULL UNIQUE, email TEXT)";
    const LOGS: &str = "CREATE TABLE system_logs (id INTEGER PRIMARY KEY, action TEXT)";
    const ACTIVITY_TAGS: &str =
        "CREATE TABLE activity_tags (activity_id INTEGER, tag_id INTEGER, note TEXT, PRIMARY KEY (activity_id, tag_id))";

    #[tokio::test]
    async fn test_clear_insert_replaces_target() {
        let pair = Pair::new("apply_clear", TAGS).await;
        exec(&pair.source_pool, "INSERT INTO tags VALUES (1, 'a'), (2, 'b'), (3, 'c')").await;
        exec(&pair.target_pool, "INSERT INTO tags VALUES (9, 'stale')").await;

        let outcome = pair.run(Strategy::ClearInsert, "tags").await.unwrap();
        assert_eq!(outcome.rows_affected, 3);

        // Idempotent
        let again = pair.run(Strategy::ClearInsert, "tags").await.unwrap();
        assert_eq!(again.rows_affected, 3);

        let rows = pair.target_rows("SELECT id FROM tags ORDER BY id").await;
        assert_eq!(rows, vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)], vec![SqlValue::Int(3)]]);
    }

    #[tokio::test]
    async fn test_clear_insert_empty_source_empties_target() {
        let pair = Pair::new("apply_clear_empty", TAGS).await;
        exec(&pair.target_pool, "INSERT INTO tags VALUES (9, 'stale')").await;

        let outcome = pair.run(Strategy::ClearInsert, "tags").await.unwrap();
        assert_eq!(outcome, TableOutcome::default());
        assert!(pair.target_rows("SELECT id FROM tags").await.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_updates_and_preserves_target_only_rows() {
        let pair = Pair::new("apply_upsert", TAGS).await;
        exec(&pair.source_pool, "INSERT INTO tags VALUES (1, 'admin'), (2, 'student')").await;
        exec(&pair.target_pool, "INSERT INTO tags VALUES (1, 'old'), (5, 'local')").await;

        let outcome = pair.run(Strategy::Upsert, "tags").await.unwrap();
        assert_eq!(outcome.rows_affected, 2);

        let rows = pair.target_rows("SELECT id, name FROM tags ORDER BY id").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][1], SqlValue::Text("admin".into()));
        assert_eq!(rows[2][1], SqlValue::Text("local".into()));
    }

    #[tokio::test]
    async fn test_upsert_composite_key() {
        let pair = Pair::new("apply_upsert_composite", ACTIVITY_TAGS).await;
        exec(&pair.source_pool, "INSERT INTO activity_tags VALUES (1, 1, 'a'), (1, 2, 'b')").await;

        // Empty target first, then again over the rows it just wrote
        let outcome = pair.run(Strategy::Upsert, "activity_tags").await.unwrap();
        assert_eq!(outcome, TableOutcome { rows_affected: 2, rows_skipped: 0 });

        exec(&pair.target_pool, "UPDATE activity_tags SET note = 'old' WHERE activity_id = 1 AND tag_id = 1").await;
        exec(&pair.target_pool, "INSERT INTO activity_tags VALUES (2, 2, 'local')").await;
        let outcome = pair.run(Strategy::Upsert, "activity_tags").await.unwrap();
        assert_eq!(outcome.rows_affected, 2);

        let rows = pair
            .target_rows("SELECT activity_id, tag_id, note FROM activity_tags ORDER BY activity_id, tag_id")
            .await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][2], SqlValue::Text("a".into()));
        assert_eq!(rows[1][2], SqlValue::Text("b".into()));
        assert_eq!(rows[2][2], SqlValue::Text("local".into()));
    }

    #[tokio::test]
    async fn test_append_composite_key_skips_conflicts_without_remap() {
        let pair = Pair::new("apply_append_composite", ACTIVITY_TAGS).await;
        exec(&pair.source_pool, "INSERT INTO activity_tags VALUES (1, 1, 'a'), (3, 1, 'c')").await;
        exec(&pair.target_pool, "INSERT INTO activity_tags VALUES (1, 1, 'kept')").await;

        let outcome = pair.run(Strategy::AppendWithRemap, "activity_tags").await.unwrap();
        assert_eq!(outcome, TableOutcome { rows_affected: 1, rows_skipped: 1 });

        let rows = pair
            .target_rows("SELECT activity_id, note FROM activity_tags ORDER BY activity_id")
            .await;
        assert_eq!(rows[0], vec![SqlValue::Int(1), SqlValue::Text("kept".into())]);
        assert_eq!(rows[1], vec![SqlValue::Int(3), SqlValue::Text("c".into())]);
    }

    #[tokio::test]
    async fn test_append_with_remap_shifts_keys() {
        let pair = Pair::new("apply_append", LOGS).await;
        exec(&pair.source_pool, "INSERT INTO system_logs VALUES (1, 'login'), (2, 'logout')").await;
        exec(&pair.target_pool, "INSERT INTO system_logs VALUES (1, 'boot'), (2, 'seed'), (3, 'check')").await;

        let outcome = pair.run(Strategy::AppendWithRemap, "system_logs").await.unwrap();
        assert_eq!(outcome, TableOutcome { rows_affected: 2, rows_skipped: 0 });

        let rows = pair.target_rows("SELECT id, action FROM system_logs ORDER BY id").await;
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[3], vec![SqlValue::Int(4), SqlValue::Text("login".into())]);
        assert_eq!(rows[4], vec![SqlValue::Int(5), SqlValue::Text("logout".into())]);
    }

    #[tokio::test]
    async fn test_smart_merge_never_overwrites() {
        let pair = Pair::new("apply_merge", USERS).await;
        exec(
            &pair.source_pool,
            "INSERT INTO users VALUES (1, 'admin', 'evil@example.com'), (2, 'alice', 'a@example.com')",
        )
        .await;
        exec(&pair.target_pool, "INSERT INTO users VALUES (1, 'admin', 'admin@example.com')").await;

        let outcome = pair.run(Strategy::SmartMergeUser, "users").await.unwrap();
        assert_eq!(outcome, TableOutcome { rows_affected: 1, rows_skipped: 1 });

        let rows = pair.target_rows("SELECT username, email FROM users ORDER BY id").await;
        assert_eq!(rows[0][1], SqlValue::Text("admin@example.com".into()));
        assert_eq!(rows[1][0], SqlValue::Text("alice".into()));
    }

    #[tokio::test]
    async fn test_smart_merge_requires_business_key() {
        let pair = Pair::new("apply_merge_nokey", TAGS).await;
        let err = pair.run(Strategy::SmartMergeUser, "tags").await.unwrap_err();
        assert!(matches!(err, SyncError::SchemaMismatch { side: DbRole::Backup, .. }));
    }

    #[tokio::test]
    async fn test_read_only_skip_touches_nothing() {
        let pair = Pair::new("apply_skip", TAGS).await;
        exec(&pair.source_pool, "INSERT INTO tags VALUES (1, 'a')").await;
        let outcome = pair.run(Strategy::ReadOnlySkip, "tags").await.unwrap();
        assert_eq!(outcome, TableOutcome::default());
        assert!(pair.target_rows("SELECT id FROM tags").await.is_empty());
    }

    #[test]
    fn test_remap_keys_keeps_text_keys_as_text() {
        let mut rows = vec![vec![SqlValue::Text("7".into())], vec![SqlValue::Null]];
        remap_keys(&mut rows, 0, 10);
        assert_eq!(rows[0][0], SqlValue::Text("17".into()));
        assert_eq!(rows[1][0], SqlValue::Null);
    }

    #[test]
    fn test_new_by_business_key_dedupes() {
        let rows = vec![
            vec![SqlValue::Text("admin".into())],
            vec![SqlValue::Text("bob".into())],
            vec![SqlValue::Text("bob".into())],
            vec![SqlValue::Null],
        ];
        let existing = ["admin".to_string()].into_iter().collect();
        let fresh = new_by_business_key(rows, 0, existing);
        assert_eq!(fresh, vec![vec![SqlValue::Text("bob".into())]]);
    }
}
