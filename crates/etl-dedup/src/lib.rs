pub mod error;
pub mod redis_store;
pub mod sqlite;

pub use error::DedupError;
pub use redis_store::RedisDedupStore;
pub use sqlite::SqliteDedupStore;

use async_trait::async_trait;
use etl_common::ErrorKind;

/// Context needed to create the `started` row for a key. C7's training
/// dedup reuses the same store under the `training:` key namespace, so
/// this intentionally does not require a full `ProcessingEnvelope`.
#[derive(Debug, Clone)]
pub struct StartContext {
    pub message_id: String,
    pub correlation_id: String,
    pub user_id: String,
    pub record_type: String,
    pub object_key: String,
}

/// Polymorphic dedup-store capability. Callers never branch on
/// which concrete variant they hold.
#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    async fn initialize(&self) -> Result<(), DedupError>;

    /// Any non-absent row (started, completed, or failed) counts as
    /// already processed.
    async fn is_already_processed(&self, key: &str) -> Result<bool, DedupError>;

    async fn mark_started(&self, key: &str, ctx: StartContext) -> Result<(), DedupError>;

    async fn mark_completed(
        &self,
        key: &str,
        duration_seconds: f64,
        records_processed: u64,
        narrative: &str,
        quality_score: f64,
    ) -> Result<(), DedupError>;

    async fn mark_failed(
        &self,
        key: &str,
        message: &str,
        kind: ErrorKind,
    ) -> Result<(), DedupError>;

    /// SQLite: deletes expired rows and returns the count. Redis: a no-op
    /// returning 0, since TTL handles expiry.
    async fn cleanup_expired(&self) -> Result<u64, DedupError>;

    async fn close(&self) -> Result<(), DedupError>;
}
