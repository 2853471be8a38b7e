//! Shared Key-Value Store using SQLite
//!
//! Several worker processes pointing at the same database file share sets
//! and leases through this store. Expiry is evaluated against the injected
//! clock at access time; expired rows are purged lazily.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    store::{LockAttempt, LockRecord, LockStore, ScanPage, SetStore},
    time::{Clock, SystemClock},
};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row, Sqlite, Transaction,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS kv_keys (
        key TEXT PRIMARY KEY,
        expires_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kv_set_members (
        key TEXT NOT NULL,
        member TEXT NOT NULL,
        PRIMARY KEY (key, member)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kv_locks (
        key TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
];

fn db_error(operation: &str, e: sqlx::Error) -> BridgeError {
    BridgeError::DatabaseError(format!("{}: {}", operation, e))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite-backed [`SetStore`] and [`LockStore`].
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
    store_id: String,
    clock: Arc<dyn Clock>,
}

impl SqliteKeyValueStore {
    /// Open (or create) a store in the given database file.
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        let path_str = db_path.to_string_lossy().replace('\\', "/");
        let db_url = format!("sqlite://{}", path_str);
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| db_error("Invalid database path", e))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to connect to DB", e))?;

        debug!(path = ?db_path, "Opened key-value store");
        Self::with_pool(pool, db_url).await
    }

    /// A private in-memory store. Every call creates a new, isolated store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("Failed to connect to DB", e))?;

        let store_id = format!("sqlite-memory:{}", uuid::Uuid::new_v4());
        Self::with_pool(pool, store_id).await
    }

    /// Use an existing pool. `store_id` must be equal for every handle that
    /// shares the same database.
    pub async fn with_pool(pool: SqlitePool, store_id: impl Into<String>) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| db_error("Failed to create table", e))?;
        }

        Ok(Self {
            pool,
            store_id: store_id.into(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Evaluate expiry against a different clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now_millis(&self) -> i64 {
        self.clock.unix_timestamp_millis()
    }

    async fn purge_expired(&self, tx: &mut Transaction<'_, Sqlite>, key: &str) -> Result<()> {
        let now = self.now_millis();
        let expired = sqlx::query(
            "DELETE FROM kv_keys WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(key)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to purge key", e))?;

        if expired.rows_affected() > 0 {
            sqlx::query("DELETE FROM kv_set_members WHERE key = ?")
                .bind(key)
                .execute(&mut **tx)
                .await
                .map_err(|e| db_error("Failed to purge members", e))?;
            debug!(key = key, "Purged expired set");
        }
        Ok(())
    }

    async fn drop_if_empty(&self, tx: &mut Transaction<'_, Sqlite>, key: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM kv_keys
            WHERE key = ?
              AND NOT EXISTS (SELECT 1 FROM kv_set_members WHERE key = kv_keys.key)
            "#,
        )
        .bind(key)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to drop empty set", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))
    }

    async fn commit(tx: Transaction<'_, Sqlite>) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))
    }

    async fn live_members(&self, key: &str) -> Result<Vec<String>> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;
        let rows = sqlx::query("SELECT member FROM kv_set_members WHERE key = ?")
            .bind(key)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to read set", e))?;
        Self::commit(tx).await?;
        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }

    fn lock_record(key: &str, row: &sqlx::sqlite::SqliteRow) -> LockRecord {
        LockRecord {
            key: key.to_string(),
            owner: row.get("owner"),
            acquired_at: from_millis(row.get("acquired_at")),
            expires_at: from_millis(row.get("expires_at")),
        }
    }
}

#[async_trait]
impl SetStore for SqliteKeyValueStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<usize> {
        if members.is_empty() {
            self.expire(key, ttl).await?;
            return Ok(0);
        }

        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;

        sqlx::query(
            "INSERT INTO kv_keys (key, expires_at) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(self.now_millis().saturating_add(ttl_millis(ttl)))
        .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to create set", e))?;

        let mut added = 0;
        for member in members {
            let result =
                sqlx::query("INSERT OR IGNORE INTO kv_set_members (key, member) VALUES (?, ?)")
                    .bind(key)
                    .bind(member)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("Failed to add member", e))?;
            added += result.rows_affected() as usize;
        }

        Self::commit(tx).await?;
        Ok(added)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;

        let mut removed = 0;
        for member in members {
            let result = sqlx::query("DELETE FROM kv_set_members WHERE key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to remove member", e))?;
            removed += result.rows_affected() as usize;
        }

        self.drop_if_empty(&mut tx, key).await?;
        Self::commit(tx).await?;
        Ok(removed)
    }

    async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;

        let rows = sqlx::query("SELECT member FROM kv_set_members WHERE key = ? LIMIT ?")
            .bind(key)
            .bind(count as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to pop members", e))?;
        let popped: Vec<String> = rows.iter().map(|row| row.get::<String, _>(0)).collect();

        for member in &popped {
            sqlx::query("DELETE FROM kv_set_members WHERE key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to pop members", e))?;
        }

        self.drop_if_empty(&mut tx, key).await?;
        Self::commit(tx).await?;
        Ok(popped)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.live_members(key).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;
        let row = sqlx::query("SELECT 1 FROM kv_set_members WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to check member", e))?;
        Self::commit(tx).await?;
        Ok(row.is_some())
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_set_members WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to count set", e))?;
        Self::commit(tx).await?;
        Ok(count as usize)
    }

    async fn set_scan(&self, key: &str, cursor: Option<&str>, count: usize) -> Result<ScanPage> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;

        // Fetch one extra row to learn whether another batch follows.
        let rows = sqlx::query(
            r#"
            SELECT member FROM kv_set_members
            WHERE key = ? AND member > ?
            ORDER BY member
            LIMIT ?
            "#,
        )
        .bind(key)
        .bind(cursor.unwrap_or(""))
        .bind(count as i64 + 1)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to scan set", e))?;
        Self::commit(tx).await?;

        let mut members: Vec<String> = rows.iter().map(|row| row.get::<String, _>(0)).collect();
        let next_cursor = if members.len() > count {
            members.truncate(count);
            members.last().cloned()
        } else {
            None
        };

        Ok(ScanPage {
            members,
            next_cursor,
        })
    }

    async fn set_difference(&self, key: &str, other: &str) -> Result<Vec<String>> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;
        self.purge_expired(&mut tx, other).await?;

        let rows = sqlx::query(
            r#"
            SELECT member FROM kv_set_members WHERE key = ?
            EXCEPT
            SELECT member FROM kv_set_members WHERE key = ?
            "#,
        )
        .bind(key)
        .bind(other)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to diff sets", e))?;
        Self::commit(tx).await?;

        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.set_len(key).await? > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;

        let members = sqlx::query("DELETE FROM kv_set_members WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete set", e))?;
        sqlx::query("DELETE FROM kv_keys WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete set", e))?;

        Self::commit(tx).await?;
        Ok(members.rows_affected() > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut tx = self.begin().await?;
        self.purge_expired(&mut tx, key).await?;

        let result = sqlx::query("UPDATE kv_keys SET expires_at = ? WHERE key = ?")
            .bind(self.now_millis().saturating_add(ttl_millis(ttl)))
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to set expiry", e))?;

        Self::commit(tx).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl LockStore for SqliteKeyValueStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockAttempt> {
        let now = self.now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));
        let mut tx = self.begin().await?;

        sqlx::query("DELETE FROM kv_locks WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to clear stale lock", e))?;

        let current = sqlx::query("SELECT owner, acquired_at, expires_at FROM kv_locks WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to read lock", e))?
            .map(|row| Self::lock_record(key, &row));

        let attempt = match current {
            Some(record) if record.owner == owner => {
                sqlx::query("UPDATE kv_locks SET expires_at = ? WHERE key = ? AND owner = ?")
                    .bind(expires_at)
                    .bind(key)
                    .bind(owner)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("Failed to refresh lock", e))?;
                LockAttempt::Reentered(LockRecord {
                    expires_at: from_millis(expires_at),
                    ..record
                })
            }
            Some(record) => LockAttempt::Held(record),
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO kv_locks (key, owner, acquired_at, expires_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(owner)
                .bind(now)
                .bind(expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to acquire lock", e))?;

                if inserted.rows_affected() == 1 {
                    LockAttempt::Acquired(LockRecord {
                        key: key.to_string(),
                        owner: owner.to_string(),
                        acquired_at: from_millis(now),
                        expires_at: from_millis(expires_at),
                    })
                } else {
                    // Another process won the race between our read and insert.
                    let row = sqlx::query(
                        "SELECT owner, acquired_at, expires_at FROM kv_locks WHERE key = ?",
                    )
                    .bind(key)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| db_error("Failed to read lock", e))?;
                    LockAttempt::Held(Self::lock_record(key, &row))
                }
            }
        };

        Self::commit(tx).await?;
        Ok(attempt)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_locks WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to release lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.now_millis();
        let result = sqlx::query(
            "UPDATE kv_locks SET expires_at = ? WHERE key = ? AND owner = ? AND expires_at > ?",
        )
        .bind(now.saturating_add(ttl_millis(ttl)))
        .bind(key)
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to extend lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn holder(&self, key: &str) -> Result<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT owner, acquired_at, expires_at FROM kv_locks WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(self.now_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read lock", e))?;

        Ok(row.map(|row| Self::lock_record(key, &row)))
    }
}
