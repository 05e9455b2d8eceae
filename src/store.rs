// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable queue storage.
//!
//! When enabled, every queue mutation is written through to SQLite while the
//! queue holds its own lock, so the table always mirrors the in-memory item
//! list. On startup each queue reloads its rows in enqueue order.
//!
//! # Recovery
//!
//! An item that was `IN_PROGRESS` when the process stopped is restored as
//! `QUEUED`: the import may or may not have landed, and re-delivering it is
//! safe because imports are idempotent.
//!
//! ```text
//! enqueue → INSERT (seq assigned) → worker attempt → UPDATE state/attempts
//!                                                  → ack: DELETE
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (max 5 attempts).

use crate::config::StoreConfig;
use crate::error::{DistributionError, Result};
use crate::package::DistributionPackage;
use crate::queue::{ItemState, QueueItem};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Persistent queue item storage backed by SQLite.
pub struct QueueStore {
    pool: SqlitePool,
    path: String,
}

impl QueueStore {
    /// Open (or create) the store described by `config`.
    pub async fn from_config(config: &StoreConfig) -> Result<Arc<Self>> {
        let store = if config.sqlite_path == ":memory:" {
            Self::in_memory().await?
        } else {
            Self::new(&config.sqlite_path, config.wal_mode).await?
        };
        Ok(Arc::new(store))
    }

    /// Open the database at `path`, creating tables if they don't exist.
    pub async fn new(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing queue store");

        let journal = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| DistributionError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::init(pool, path_str).await
    }

    /// Private in-memory database; a single connection keeps the data alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DistributionError::Config(format!("Invalid SQLite path: {}", e)))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool, ":memory:".to_string()).await
    }

    async fn init(pool: SqlitePool, path: String) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL UNIQUE,
                agent TEXT NOT NULL,
                queue TEXT NOT NULL,
                package BLOB NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                last_attempt_at INTEGER,
                last_error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_items_queue ON queue_items (agent, queue, seq)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, path })
    }

    /// Load a queue's items in enqueue order.
    ///
    /// Rows whose package no longer decodes are dropped with a warning.
    pub async fn load_queue(&self, agent: &str, queue: &str) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, package, state, attempts, enqueued_at, last_attempt_at, last_error
            FROM queue_items
            WHERE agent = ? AND queue = ?
            ORDER BY seq
            "#,
        )
        .bind(agent)
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        let mut recovered = 0usize;
        for row in rows {
            let item_id: String = row.try_get("item_id")?;
            let bytes: Vec<u8> = row.try_get("package")?;
            let package = match DistributionPackage::from_bytes(&bytes) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    warn!(agent, queue, item_id = %item_id, error = %e, "Dropping undecodable queue row");
                    self.delete(agent, queue, &item_id).await?;
                    continue;
                }
            };

            let state_str: String = row.try_get("state")?;
            let mut state = ItemState::parse(&state_str).unwrap_or(ItemState::Queued);
            if state == ItemState::InProgress {
                state = ItemState::Queued;
                recovered += 1;
            }

            let attempts: i64 = row.try_get("attempts")?;
            let enqueued_at: i64 = row.try_get("enqueued_at")?;
            let last_attempt_at: Option<i64> = row.try_get("last_attempt_at")?;
            let last_error: Option<String> = row.try_get("last_error")?;

            items.push(QueueItem {
                id: item_id,
                queue: queue.to_string(),
                package,
                attempts: attempts.clamp(0, u32::MAX as i64) as u32,
                state,
                enqueued_at: from_millis(enqueued_at),
                last_attempt_at: last_attempt_at.map(from_millis),
                last_error,
            });
        }

        if !items.is_empty() {
            info!(agent, queue, count = items.len(), recovered, "Restored queue items from previous run");
        }
        Ok(items)
    }

    pub async fn insert(&self, agent: &str, item: &QueueItem) -> Result<()> {
        let bytes = item.package.to_bytes()?;
        let pool = &self.pool;

        execute_with_retry("insert", || async {
            sqlx::query(
                r#"
                INSERT INTO queue_items
                    (item_id, agent, queue, package, state, attempts, enqueued_at, last_attempt_at, last_error)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(agent)
            .bind(&item.queue)
            .bind(&bytes)
            .bind(item.state.as_str())
            .bind(item.attempts as i64)
            .bind(millis(item.enqueued_at))
            .bind(item.last_attempt_at.map(millis))
            .bind(&item.last_error)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Persist state, attempts and error of an existing item.
    pub async fn update(&self, item: &QueueItem) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("update", || async {
            sqlx::query(
                r#"
                UPDATE queue_items
                SET state = ?, attempts = ?, last_attempt_at = ?, last_error = ?
                WHERE item_id = ?
                "#,
            )
            .bind(item.state.as_str())
            .bind(item.attempts as i64)
            .bind(item.last_attempt_at.map(millis))
            .bind(&item.last_error)
            .bind(&item.id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn delete(&self, agent: &str, queue: &str, item_id: &str) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("delete", || async {
            sqlx::query("DELETE FROM queue_items WHERE agent = ? AND queue = ? AND item_id = ?")
                .bind(agent)
                .bind(queue)
                .bind(item_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Delete several items in one transaction.
    pub async fn delete_many(&self, agent: &str, queue: &str, item_ids: &[String]) -> Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for item_id in item_ids {
            sqlx::query("DELETE FROM queue_items WHERE agent = ? AND queue = ? AND item_id = ?")
                .bind(agent)
                .bind(queue)
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete every item of an agent. Returns the number of rows removed.
    pub async fn delete_agent(&self, agent: &str) -> Result<u64> {
        let pool = &self.pool;

        let result = execute_with_retry("delete_agent", || async {
            sqlx::query("DELETE FROM queue_items WHERE agent = ?")
                .bind(agent)
                .execute(pool)
                .await
        })
        .await?;

        info!(agent, rows = result.rows_affected(), "Deleted stored queue items");
        Ok(result.rows_affected())
    }

    /// Row count for a queue (diagnostics and tests).
    pub async fn count(&self, agent: &str, queue: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_items WHERE agent = ? AND queue = ?")
            .bind(agent)
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Queue store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{ContentNode, DistributionPackage, DistributionRequestType, PackagePayload, SnapshotEntry};
    use tempfile::tempdir;

    fn item(queue: &str) -> QueueItem {
        let package = DistributionPackage::new(
            DistributionRequestType::Delete,
            vec!["/content/a".to_string()],
            PackagePayload::Deletion,
        )
        .unwrap();
        QueueItem::new(queue, Arc::new(package))
    }

    #[tokio::test]
    async fn test_insert_and_load_in_order() {
        let store = QueueStore::in_memory().await.unwrap();

        let first = item("endpoint1");
        let second = item("endpoint1");
        store.insert("publish", &first).await.unwrap();
        store.insert("publish", &second).await.unwrap();
        store.insert("publish", &item("endpoint2")).await.unwrap();

        let loaded = store.load_queue("publish", "endpoint1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, first.id);
        assert_eq!(loaded[1].id, second.id);
        assert_eq!(loaded[0].package.id, first.package.id);
        assert_eq!(store.count("publish", "endpoint2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_numeric_properties_survive_reload() {
        let store = QueueStore::in_memory().await.unwrap();
        let node = ContentNode::new()
            .with_property("score", 1.8597941207808166e-5)
            .with_property("weight", 0.1 + 0.2)
            .with_property("views", 1024u64)
            .with_property("featured", false);
        let package = DistributionPackage::new(
            DistributionRequestType::Add,
            vec!["/content/a".to_string()],
            PackagePayload::Snapshot {
                entries: vec![SnapshotEntry {
                    path: "/content/a".to_string(),
                    node,
                }],
            },
        )
        .unwrap();
        let it = QueueItem::new("endpoint1", Arc::new(package));
        store.insert("publish", &it).await.unwrap();

        let loaded = store.load_queue("publish", "endpoint1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(*loaded[0].package, *it.package);
        assert_eq!(store.count("publish", "endpoint1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_in_progress_recovers_as_queued() {
        let store = QueueStore::in_memory().await.unwrap();

        let mut it = item("endpoint1");
        store.insert("publish", &it).await.unwrap();
        it.state = ItemState::InProgress;
        it.attempts = 2;
        it.last_attempt_at = Some(Utc::now());
        store.update(&it).await.unwrap();

        let loaded = store.load_queue("publish", "endpoint1").await.unwrap();
        assert_eq!(loaded[0].state, ItemState::Queued);
        assert_eq!(loaded[0].attempts, 2);
        assert!(loaded[0].last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_error_state_survives_reload() {
        let store = QueueStore::in_memory().await.unwrap();

        let mut it = item("endpoint1");
        store.insert("publish", &it).await.unwrap();
        it.state = ItemState::Error;
        it.last_error = Some("rejected".to_string());
        store.update(&it).await.unwrap();

        let loaded = store.load_queue("publish", "endpoint1").await.unwrap();
        assert_eq!(loaded[0].state, ItemState::Error);
        assert_eq!(loaded[0].last_error.as_deref(), Some("rejected"));
    }

    #[tokio::test]
    async fn test_delete_many_and_agent() {
        let store = QueueStore::in_memory().await.unwrap();

        let a = item("q");
        let b = item("q");
        let c = item("q");
        for it in [&a, &b, &c] {
            store.insert("reverse", it).await.unwrap();
        }

        store.delete_many("reverse", "q", &[a.id.clone(), b.id.clone()]).await.unwrap();
        assert_eq!(store.count("reverse", "q").await.unwrap(), 1);

        store.delete("reverse", "q", &c.id).await.unwrap();
        assert_eq!(store.count("reverse", "q").await.unwrap(), 0);

        store.insert("reverse", &item("q")).await.unwrap();
        assert_eq!(store.delete_agent("reverse").await.unwrap(), 1);
        assert_eq!(store.delete_agent("reverse").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("queues.db");

        let it = item("endpoint1");
        {
            let store = QueueStore::new(&db_path, true).await.unwrap();
            store.insert("publish", &it).await.unwrap();
            store.close().await;
        }
        {
            let store = QueueStore::new(&db_path, true).await.unwrap();
            let loaded = store.load_queue("publish", "endpoint1").await.unwrap();
            assert_eq!(loaded.len(), 1);
            assert_eq!(loaded[0].id, it.id);
            assert!(store.path().contains("queues.db"));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_non_database() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
