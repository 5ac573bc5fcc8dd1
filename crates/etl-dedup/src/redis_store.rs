use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use etl_common::{ErrorKind, ProcessingRecord, ProcessingStatus, NARRATIVE_PREVIEW_MAX_LENGTH};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::{DedupError, DeduplicationStore, StartContext};

const RECORD_PREFIX: &str = "etl:processed:";
const STATUS_PREFIX: &str = "etl:status:";

/// Distributed dedup store backed by a networked key-value store with
/// TTL-based expiry. `expires_at` is computed once at `mark_started` and
/// every subsequent write re-derives the remaining TTL (`expires_at - now`)
/// rather than resetting to a fresh `retention_seconds`, so retention is
/// always measured from creation.
pub struct RedisDedupStore {
    conn: Mutex<ConnectionManager>,
    retention_hours: i64,
    initialized: AtomicBool,
}

impl RedisDedupStore {
    pub fn new(conn: ConnectionManager, retention_hours: i64) -> Self {
        Self {
            conn: Mutex::new(conn),
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

    fn remaining_ttl_seconds(expires_at: DateTime<Utc>) -> i64 {
        (expires_at - Utc::now()).num_seconds().max(1)
    }

    async fn load_record(&self, key: &str) -> Result<Option<ProcessingRecord>, DedupError> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn.get(format!("{RECORD_PREFIX}{key}")).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_record(&self, key: &str, record: &ProcessingRecord) -> Result<(), DedupError> {
        let ttl = Self::remaining_ttl_seconds(record.expires_at) as u64;
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.lock().await;
        let _: () = conn.set_ex(format!("{RECORD_PREFIX}{key}"), json, ttl).await?;
        let _: () = conn
            .set_ex(format!("{STATUS_PREFIX}{key}"), record.status.as_str(), ttl)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeduplicationStore for RedisDedupStore {
    async fn initialize(&self) -> Result<(), DedupError> {
        // Connectivity is validated eagerly here, unlike the embedded
        // store's lazy first-command check, since there is no schema to
        // create for a key-value store otherwise.
        let mut conn = self.conn.lock().await;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        drop(conn);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_already_processed(&self, key: &str) -> Result<bool, DedupError> {
        self.require_initialized()?;
        let mut conn = self.conn.lock().await;
        let exists: bool = conn.exists(format!("{STATUS_PREFIX}{key}")).await?;
        Ok(exists)
    }

    async fn mark_started(&self, key: &str, ctx: StartContext) -> Result<(), DedupError> {
        self.require_initialized()?;
        if self.is_already_processed(key).await? {
            return Ok(());
        }
        let started_at = Utc::now();
        let expires_at = started_at + Duration::hours(self.retention_hours);
        let record = ProcessingRecord {
            idempotency_key: key.to_string(),
            message_id: ctx.message_id,
            correlation_id: ctx.correlation_id,
            user_id: ctx.user_id,
            record_type: ctx.record_type,
            object_key: ctx.object_key,
            status: ProcessingStatus::Started,
            started_at,
            completed_at: None,
            processing_time_seconds: None,
            records_processed: None,
            quality_score: None,
            narrative_preview: None,
            error_message: None,
            error_kind: None,
            expires_at,
        };
        self.store_record(key, &record).await
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
        let mut record = self
            .load_record(key)
            .await?
            .ok_or_else(|| DedupError::InvalidRecord(format!("no started row for {key}")))?;
        record.status = ProcessingStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.processing_time_seconds = Some(duration_seconds);
        record.records_processed = Some(records_processed);
        record.quality_score = Some(quality_score);
        record.narrative_preview = Some(ProcessingRecord::truncate_preview(narrative));
        debug_assert!(
            record
                .narrative_preview
                .as_ref()
                .map(|p| p.chars().count() <= NARRATIVE_PREVIEW_MAX_LENGTH)
                .unwrap_or(true)
        );
        self.store_record(key, &record).await
    }

    async fn mark_failed(
        &self,
        key: &str,
        message: &str,
        kind: ErrorKind,
    ) -> Result<(), DedupError> {
        self.require_initialized()?;
        let mut record = self
            .load_record(key)
            .await?
            .ok_or_else(|| DedupError::InvalidRecord(format!("no started row for {key}")))?;
        record.status = ProcessingStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.error_message = Some(message.to_string());
        record.error_kind = Some(kind.as_str().to_string());
        self.store_record(key, &record).await
    }

    /// TTL handles expiry automatically; there is nothing to sweep.
    async fn cleanup_expired(&self) -> Result<u64, DedupError> {
        self.require_initialized()?;
        Ok(0)
    }

    async fn close(&self) -> Result<(), DedupError> {
        Ok(())
    }
}
