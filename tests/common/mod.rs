// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures for the SQLite integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use dual_sync_engine::{ConnectionManager, RetryConfig, SyncConfig, SyncOrchestrator};
use sqlx::SqlitePool;

/// SQLite file under the local `temp/` folder, removed on drop.
pub struct TempDb {
    path: PathBuf,
}

impl TempDb {
    pub fn new(name: &str) -> Self {
        std::fs::create_dir_all("temp").unwrap();
        let path = PathBuf::from("temp").join(format!("it_{}_{}.db", name, uuid::Uuid::new_v4().simple()));
        Self { path }
    }

    pub fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }

    pub async fn pool(&self) -> SqlitePool {
        SqlitePool::connect(&self.url()).await.unwrap()
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        for suffix in ["-wal", "-shm"] {
            let mut extra = self.path.clone().into_os_string();
            extra.push(suffix);
            let _ = std::fs::remove_file(extra);
        }
    }
}

/// A sqlite URL that can never be opened.
pub const UNREACHABLE: &str = "sqlite://temp/missing_dir/none/unreachable.db";

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: Some(2),
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2.0,
    }
}

/// Orchestrator over the two URLs with fast connect retries.
pub fn orchestrator(primary: &str, backup: &str, tweak: impl FnOnce(&mut SyncConfig)) -> SyncOrchestrator {
    let mut config = SyncConfig {
        primary_url: Some(primary.to_string()),
        backup_url: Some(backup.to_string()),
        ..Default::default()
    };
    tweak(&mut config);
    let connections = ConnectionManager::new(&config).unwrap().with_retry(fast_retry());
    SyncOrchestrator::with_connections(config, connections)
}

pub async fn exec(pool: &SqlitePool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap();
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

/// A cut-down school schema: reference tables, users, business tables and
/// the audit sink.
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE roles (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT NOT NULL UNIQUE, email TEXT, role_id INTEGER REFERENCES roles(id))",
    "CREATE TABLE activities (id INTEGER PRIMARY KEY, title TEXT NOT NULL, created_by INTEGER REFERENCES users(id))",
    "CREATE TABLE activity_registrations (id INTEGER PRIMARY KEY, activity_id INTEGER REFERENCES activities(id), user_id INTEGER REFERENCES users(id))",
    "CREATE TABLE system_logs (id INTEGER PRIMARY KEY, action TEXT, details TEXT, user_id INTEGER, created_at TEXT)",
];

pub async fn create_schema(pool: &SqlitePool) {
    for sql in SCHEMA {
        exec(pool, sql).await;
    }
}

/// Two roles, two tags, three users, two activities and one registration.
pub async fn seed(pool: &SqlitePool) {
    exec(pool, "INSERT INTO roles VALUES (1, 'admin'), (2, 'student')").await;
    exec(pool, "INSERT INTO tags VALUES (1, 'sport'), (2, 'music')").await;
    exec(
        pool,
        "INSERT INTO users VALUES (1, 'admin', 'admin@school.test', 1), \
         (2, 'alice', 'alice@school.test', 2), (3, 'bob', 'bob@school.test', 2)",
    )
    .await;
    exec(pool, "INSERT INTO activities VALUES (1, 'Football', 1), (2, 'Choir', 1)").await;
    exec(pool, "INSERT INTO activity_registrations VALUES (1, 1, 2)").await;
}
