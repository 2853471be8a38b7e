//! # Watermark Repository
//!
//! Durable storage of [`Watermark`]s, one row per `(source, service)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::error::{Result, SyncError};
use crate::source::SourceId;
use crate::watermark::Watermark;

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Load the watermark of a source, if one was ever created.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn load(&self, source_id: SourceId, service: &str) -> Result<Option<Watermark>>;

    /// Load the watermark, creating an empty one on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn get_or_create(&self, source_id: SourceId, service: &str) -> Result<Watermark>;

    /// Set `start` and `finish` together in one write.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn advance(
        &self,
        source_id: SourceId,
        service: &str,
        start: DateTime<Utc>,
        finish: DateTime<Utc>,
    ) -> Result<Watermark>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteWatermarkStore {
    pool: SqlitePool,
}

impl SqliteWatermarkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it does not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_watermarks (
                source_id INTEGER NOT NULL,
                service TEXT NOT NULL,
                start_ms INTEGER,
                finish_ms INTEGER,
                PRIMARY KEY (source_id, service)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct WatermarkRow {
    source_id: i64,
    service: String,
    start_ms: Option<i64>,
    finish_ms: Option<i64>,
}

fn from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(|ms| {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| SyncError::Database(format!("Invalid watermark timestamp: {}", ms)))
    })
    .transpose()
}

impl TryFrom<WatermarkRow> for Watermark {
    type Error = SyncError;

    fn try_from(row: WatermarkRow) -> Result<Self> {
        Ok(Watermark {
            source_id: SourceId::new(row.source_id),
            service: row.service,
            start: from_millis(row.start_ms)?,
            finish: from_millis(row.finish_ms)?,
        })
    }
}

#[async_trait]
impl WatermarkStore for SqliteWatermarkStore {
    async fn load(&self, source_id: SourceId, service: &str) -> Result<Option<Watermark>> {
        let row: Option<WatermarkRow> = sqlx::query_as(
            "SELECT source_id, service, start_ms, finish_ms FROM sync_watermarks
             WHERE source_id = ? AND service = ?",
        )
        .bind(source_id.value())
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Watermark::try_from).transpose()
    }

    async fn get_or_create(&self, source_id: SourceId, service: &str) -> Result<Watermark> {
        sqlx::query(
            "INSERT INTO sync_watermarks (source_id, service) VALUES (?, ?)
             ON CONFLICT (source_id, service) DO NOTHING",
        )
        .bind(source_id.value())
        .bind(service)
        .execute(&self.pool)
        .await?;

        self.load(source_id, service)
            .await?
            .ok_or_else(|| SyncError::Database(format!("Watermark for source {} vanished", source_id)))
    }

    async fn advance(
        &self,
        source_id: SourceId,
        service: &str,
        start: DateTime<Utc>,
        finish: DateTime<Utc>,
    ) -> Result<Watermark> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (source_id, service, start_ms, finish_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (source_id, service) DO UPDATE SET
                start_ms = excluded.start_ms,
                finish_ms = excluded.finish_ms
            "#,
        )
        .bind(source_id.value())
        .bind(service)
        .bind(start.timestamp_millis())
        .bind(finish.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(Watermark {
            source_id,
            service: service.to_string(),
            start: Some(start),
            finish: Some(finish),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_store() -> SqliteWatermarkStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteWatermarkStore::new(pool);
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_stable() {
        let store = create_test_store().await;
        let source = SourceId::new(3);

        assert!(store.load(source, "Boundless Import").await.unwrap().is_none());

        let created = store.get_or_create(source, "Boundless Import").await.unwrap();
        assert!(created.is_initial());

        let again = store.get_or_create(source, "Boundless Import").await.unwrap();
        assert_eq!(created, again);
    }

    #[tokio::test]
    async fn test_advance_sets_both_bounds() {
        let store = create_test_store().await;
        let source = SourceId::new(3);
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let finish = start + chrono::Duration::minutes(7);

        store.get_or_create(source, "Overdrive Import").await.unwrap();
        store
            .advance(source, "Overdrive Import", start, finish)
            .await
            .unwrap();

        let loaded = store.load(source, "Overdrive Import").await.unwrap().unwrap();
        assert_eq!(loaded.start, Some(start));
        assert_eq!(loaded.finish, Some(finish));
    }

    #[tokio::test]
    async fn test_services_are_independent() {
        let store = create_test_store().await;
        let source = SourceId::new(3);
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        store.advance(source, "Boundless Import", start, start).await.unwrap();

        assert!(store.load(source, "Overdrive Import").await.unwrap().is_none());
    }
}
