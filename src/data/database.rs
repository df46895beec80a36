//! SQLite database operations
//!
//! All database access goes through this module.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
///
/// Follower writes go through `write_gate` so an upsert from an inbound
/// Follow never interleaves with a removal triggered by delivery eviction.
pub struct Database {
    pool: Pool<Sqlite>,
    write_gate: Mutex<()>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self {
            pool,
            write_gate: Mutex::new(()),
        })
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Add a follower or replace the inbox of an existing one
    pub async fn upsert_follower(
        &self,
        account: &str,
        follower: &str,
        inbox: &str,
    ) -> Result<(), AppError> {
        let _guard = self.write_gate.lock().await;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO followers (account, follower, inbox, created_at, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(account, follower) DO UPDATE SET inbox = excluded.inbox, updated_at = excluded.updated_at",
        )
        .bind(account)
        .bind(follower)
        .bind(inbox)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a follower of an account
    ///
    /// # Returns
    /// Whether a row was deleted
    pub async fn remove_follower(&self, account: &str, follower: &str) -> Result<bool, AppError> {
        let _guard = self.write_gate.lock().await;

        let result = sqlx::query("DELETE FROM followers WHERE account = ? AND follower = ?")
            .bind(account)
            .bind(follower)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every follower that receives deliveries at `inbox`
    ///
    /// # Returns
    /// The removed rows
    pub async fn remove_inbox(&self, inbox: &str) -> Result<Vec<Follower>, AppError> {
        let _guard = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query_as::<_, Follower>(
            "SELECT account, follower, inbox, created_at, updated_at FROM followers WHERE inbox = ?",
        )
        .bind(inbox)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM followers WHERE inbox = ?")
            .bind(inbox)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(removed)
    }

    /// All followers of an account, follower IRI → inbox URL
    pub async fn list_followers(&self, account: &str) -> Result<BTreeMap<String, String>, AppError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT follower, inbox FROM followers WHERE account = ?",
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Get a single follower row
    pub async fn get_follower(
        &self,
        account: &str,
        follower: &str,
    ) -> Result<Option<Follower>, AppError> {
        let row = sqlx::query_as::<_, Follower>(
            "SELECT account, follower, inbox, created_at, updated_at FROM followers WHERE account = ? AND follower = ?",
        )
        .bind(account)
        .bind(follower)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Persist a new queue item
    ///
    /// # Returns
    /// ID of the stored item
    pub async fn enqueue(
        &self,
        name: &str,
        content: &[u8],
        run_at: DateTime<Utc>,
    ) -> Result<String, AppError> {
        let id = EntityId::new().0;

        sqlx::query(
            "INSERT INTO queue (id, name, content, schedule_ms, attempts, created_at) VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(content)
        .bind(run_at.timestamp_millis())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Up to `limit` items of a queue that are due at `now`, oldest
    /// schedule first
    pub async fn due_queue_items(
        &self,
        name: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, AppError> {
        let items = sqlx::query_as::<_, QueueItem>(
            "SELECT id, name, content, schedule_ms, attempts, created_at FROM queue \
             WHERE name = ? AND schedule_ms <= ? ORDER BY schedule_ms ASC LIMIT ?",
        )
        .bind(name)
        .bind(now.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// All items of a queue regardless of due time
    pub async fn queue_items(&self, name: &str) -> Result<Vec<QueueItem>, AppError> {
        let items = sqlx::query_as::<_, QueueItem>(
            "SELECT id, name, content, schedule_ms, attempts, created_at FROM queue \
             WHERE name = ? ORDER BY schedule_ms ASC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Remove an item from its queue
    pub async fn dequeue(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store new content and due time for an item and count the attempt
    pub async fn reschedule_queue_item(
        &self,
        id: &str,
        content: &[u8],
        run_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE queue SET content = ?, schedule_ms = ?, attempts = attempts + 1 WHERE id = ?",
        )
        .bind(content)
        .bind(run_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of items stored in a queue
    pub async fn queue_len(&self, name: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
