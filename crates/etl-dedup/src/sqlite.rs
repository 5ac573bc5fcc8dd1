use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use etl_common::{ErrorKind, ProcessingRecord, NARRATIVE_PREVIEW_MAX_LENGTH};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::{DedupError, DeduplicationStore, StartContext};

/// Embedded, single-instance dedup store backed by a local SQLite file.
/// Retention is computed once at `mark_started` and never refreshed on
/// subsequent writes.
pub struct SqliteDedupStore {
    pool: SqlitePool,
    retention_hours: i64,
    initialized: AtomicBool,
}

impl SqliteDedupStore {
    pub fn new(pool: SqlitePool, retention_hours: i64) -> Self {
        Self {
            pool,
            retention_hours,
            initialized: AtomicBool::new(false),
        }
    }

    fn require_initialized(&self) -> Result<(), DedupError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DedupError::StoreUninitialized)
        }
    }
}

#[async_trait]
impl DeduplicationStore for SqliteDedupStore {
    async fn initialize(&self) -> Result<(), DedupError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_messages (
                idempotency_key TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                record_type TEXT NOT NULL,
                object_key TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                processing_time_seconds REAL,
                records_processed INTEGER,
                quality_score REAL,
                narrative_preview TEXT,
                error_message TEXT,
                error_kind TEXT,
                expires_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_status ON processed_messages(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_expires_at ON processed_messages(expires_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_user_id ON processed_messages(user_id)")
            .execute(&self.pool)
            .await?;

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_already_processed(&self, key: &str) -> Result<bool, DedupError> {
        self.require_initialized()?;
        let row = sqlx::query("SELECT 1 FROM processed_messages WHERE idempotency_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn mark_started(&self, key: &str, ctx: StartContext) -> Result<(), DedupError> {
        self.require_initialized()?;
        let started_at = Utc::now();
        let expires_at = started_at + Duration::hours(self.retention_hours);

        sqlx::query(
            r#"
            INSERT INTO processed_messages
                (idempotency_key, message_id, correlation_id, user_id, record_type,
                 object_key, status, started_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'started', ?7, ?8)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(&ctx.message_id)
        .bind(&ctx.correlation_id)
        .bind(&ctx.user_id)
        .bind(&ctx.record_type)
        .bind(&ctx.object_key)
        .bind(started_at.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        key: &str,
        duration_seconds: f64,
        records_processed: u64,
        narrative: &str,
        quality_score: f64,
    ) -> Result<(), DedupError> {
        self.require_initialized()?;
        let preview = ProcessingRecord::truncate_preview(narrative);
        debug_assert!(preview.chars().count() <= NARRATIVE_PREVIEW_MAX_LENGTH);

        sqlx::query(
            r#"
            UPDATE processed_messages
            SET status = 'completed',
                completed_at = ?1,
                processing_time_seconds = ?2,
                records_processed = ?3,
                quality_score = ?4,
                narrative_preview = ?5
            WHERE idempotency_key = ?6
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(duration_seconds)
        .bind(records_processed as i64)
        .bind(quality_score)
        .bind(preview)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &str,
        message: &str,
        kind: ErrorKind,
    ) -> Result<(), DedupError> {
        self.require_initialized()?;
        sqlx::query(
            r#"
            UPDATE processed_messages
            SET status = 'failed',
                completed_at = ?1,
                error_message = ?2,
                error_kind = ?3
            WHERE idempotency_key = ?4
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(message)
        .bind(kind.as_str())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64, DedupError> {
        self.require_initialized()?;
        let now: DateTime<Utc> = Utc::now();
        let result = sqlx::query("DELETE FROM processed_messages WHERE expires_at < ?1")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "cleaned up expired processed_messages rows");
        }
        Ok(deleted)
    }

    async fn close(&self) -> Result<(), DedupError> {
        self.pool.close().await;
        Ok(())
    }
}

#[allow(dead_code)]
fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ProcessingRecord, DedupError> {
    use std::str::FromStr;

    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let expires_at: String = row.try_get("expires_at")?;

    Ok(ProcessingRecord {
        idempotency_key: row.try_get("idempotency_key")?,
        message_id: row.try_get("message_id")?,
        correlation_id: row.try_get("correlation_id")?,
        user_id: row.try_get("user_id")?,
        record_type: row.try_get("record_type")?,
        object_key: row.try_get("object_key")?,
        status: etl_common::ProcessingStatus::from_str(&status)
            .map_err(DedupError::InvalidRecord)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map_err(|e| DedupError::InvalidRecord(e.to_string()))?
            .with_timezone(&Utc),
        completed_at: None,
        processing_time_seconds: row.try_get("processing_time_seconds").ok(),
        records_processed: row
            .try_get::<Option<i64>, _>("records_processed")?
            .map(|v| v as u64),
        quality_score: row.try_get("quality_score").ok(),
        narrative_preview: row.try_get("narrative_preview").ok(),
        error_message: row.try_get("error_message").ok(),
        error_kind: row.try_get("error_kind").ok(),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| DedupError::InvalidRecord(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteDedupStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteDedupStore::new(pool, 168);
        store.initialize().await.unwrap();
        store
    }

    fn ctx() -> StartContext {
        StartContext {
            message_id: "m1".into(),
            correlation_id: "c1".into(),
            user_id: "u1".into(),
            record_type: "BloodGlucoseRecord".into(),
            object_key: "raw/x.avro".into(),
        }
    }

    #[tokio::test]
    async fn uninitialized_store_rejects_calls() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteDedupStore::new(pool, 168);
        let err = store.is_already_processed("k1").await.unwrap_err();
        assert!(matches!(err, DedupError::StoreUninitialized));
    }

    #[tokio::test]
    async fn first_sight_then_processed() {
        let store = test_store().await;
        assert!(!store.is_already_processed("k1").await.unwrap());
        store.mark_started("k1", ctx()).await.unwrap();
        assert!(store.is_already_processed("k1").await.unwrap());
    }

    #[tokio::test]
    async fn mark_started_is_idempotent_under_redelivery() {
        let store = test_store().await;
        store.mark_started("k1", ctx()).await.unwrap();
        store.mark_completed("k1", 1.2, 10, "narrative", 0.9).await.unwrap();
        // redelivery re-marks started; ON CONFLICT DO NOTHING must not
        // clobber the completed row.
        store.mark_started("k1", ctx()).await.unwrap();
        assert!(store.is_already_processed("k1").await.unwrap());
    }

    #[tokio::test]
    async fn narrative_preview_is_truncated() {
        let store = test_store().await;
        store.mark_started("k1", ctx()).await.unwrap();
        let long_narrative = "x".repeat(500);
        store
            .mark_completed("k1", 1.0, 1, &long_narrative, 1.0)
            .await
            .unwrap();
        let row = sqlx::query("SELECT narrative_preview FROM processed_messages WHERE idempotency_key = 'k1'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let preview: String = row.get("narrative_preview");
        assert_eq!(preview.chars().count(), NARRATIVE_PREVIEW_MAX_LENGTH);
    }
}
