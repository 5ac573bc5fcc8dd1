pub mod error;
pub mod templates;

pub use error::TrainingError;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use etl_common::{health_domain_for_record_type, EngineConfig, TrainingExample};
use etl_dedup::{DeduplicationStore, StartContext};
use etl_storage::{ObjectStoreClient, ObjectStoreError};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

const TRAINING_KEY_PREFIX: &str = "training:";

/// Everything about the record that produced a narrative, needed to route
/// and hash the resulting training line.
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub record_type: String,
    pub object_key: String,
    pub bucket: String,
    pub user_id: String,
    pub correlation_id: String,
}

/// Everything a clinical processor produced, needed to fill out the
/// training line's `input` and optional `metadata`.
#[derive(Debug, Clone)]
pub struct ProcessingMetadata {
    pub quality_score: f64,
    pub record_count: u64,
    pub processing_timestamp: DateTime<Utc>,
    pub clinical_insights: Value,
}

/// Turns a clinical narrative into one append-only JSONL line in the
/// domain-routed training corpus, with content-hash dedup so the same
/// narrative from the same source is never written twice.
pub struct TrainingEmitter {
    dedup_store: Arc<dyn DeduplicationStore>,
    object_store: Arc<dyn ObjectStoreClient>,
    bucket: String,
    training_prefix: String,
    include_metadata: bool,
    max_read_bytes: u64,
    key_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl TrainingEmitter {
    pub fn new(
        dedup_store: Arc<dyn DeduplicationStore>,
        object_store: Arc<dyn ObjectStoreClient>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            dedup_store,
            object_store,
            bucket: config.object_store_bucket.clone(),
            training_prefix: config.training_prefix.clone(),
            include_metadata: config.include_training_metadata,
            max_read_bytes: config.max_file_size_bytes(),
            key_locks: DashMap::new(),
        }
    }

    /// `SHA-256(narrative || "::" || source_key)`, hex-encoded. Same
    /// narrative from the same source hashes identically; anything else
    /// does not.
    pub fn content_hash(narrative: &str, source_key: &str) -> Result<String, TrainingError> {
        if narrative.is_empty() || source_key.is_empty() {
            return Err(TrainingError::EmptyContent);
        }
        let mut hasher = Sha256::new();
        hasher.update(narrative.as_bytes());
        hasher.update(b"::");
        hasher.update(source_key.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    fn training_output_key(&self, record_type: &str, at: DateTime<Utc>) -> String {
        let domain = health_domain_for_record_type(record_type).as_str();
        format!(
            "{}/{}/{:04}/{:02}/health_journal_{:04}_{:02}.jsonl",
            self.training_prefix,
            domain,
            at.year(),
            at.month(),
            at.year(),
            at.month()
        )
    }

    async fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.key_locks.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Appends one training line derived from `narrative`, unless it is
    /// empty (returns `Ok(false)`, no write) or a line with the same
    /// content hash was already emitted for this source (returns
    /// `Ok(true)`, no write).
    pub async fn emit(
        &self,
        narrative: &str,
        source: &SourceMetadata,
        processing: &ProcessingMetadata,
    ) -> Result<bool, TrainingError> {
        if narrative.is_empty() {
            return Ok(false);
        }

        let content_hash = match Self::content_hash(narrative, &source.object_key) {
            Ok(h) => h,
            Err(_) => return Ok(false),
        };
        let training_key = format!("{TRAINING_KEY_PREFIX}{content_hash}");

        let output_key = self.training_output_key(&source.record_type, processing.processing_timestamp);
        let lock = self.lock_for(&output_key).await;
        let _guard = lock.lock().await;

        // Re-checked under the per-key lock: two concurrent emit() calls for
        // the same content hash must not both observe "not yet processed".
        if self.is_duplicate(&training_key).await {
            debug!(content_hash = &content_hash[..16], "duplicate training example detected");
            return Ok(true);
        }

        let existing = match self.object_store.get(&self.bucket, &output_key, self.max_read_bytes).await {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::NotFound(_)) => Bytes::new(),
            Err(e) => return Err(TrainingError::Storage(e)),
        };

        let example = self.build_example(narrative, source, processing);
        let mut line = serde_json::to_vec(&example).map_err(|e| TrainingError::Dedup(etl_dedup::DedupError::from(e)))?;
        line.push(b'\n');

        let mut new_content = Vec::with_capacity(existing.len() + line.len());
        new_content.extend_from_slice(&existing);
        new_content.extend_from_slice(&line);

        self.object_store
            .put(&self.bucket, &output_key, Bytes::from(new_content), "application/jsonl")
            .await?;

        self.mark_processed(&training_key, source).await?;

        info!(
            record_type = %source.record_type,
            output_key = %output_key,
            content_hash = &content_hash[..16],
            "training example emitted"
        );

        Ok(true)
    }

    fn build_example(&self, narrative: &str, source: &SourceMetadata, processing: &ProcessingMetadata) -> TrainingExample {
        let (instruction, input) =
            templates::generate_instruction_input(&source.record_type, processing.record_count, &processing.clinical_insights);

        let metadata = if self.include_metadata {
            Some(json!({
                "record_type": source.record_type,
                "user_id": source.user_id,
                "correlation_id": source.correlation_id,
                "processing_timestamp": processing.processing_timestamp,
                "quality_score": processing.quality_score,
                "record_count": processing.record_count,
                "health_domain": health_domain_for_record_type(&source.record_type).as_str(),
                "clinical_insights": processing.clinical_insights,
            }))
        } else {
            None
        };

        TrainingExample {
            instruction,
            input,
            output: narrative.to_string(),
            metadata,
        }
    }

    /// Fails open: a dedup-store error is treated as "not a duplicate"
    /// rather than blocking the write.
    async fn is_duplicate(&self, training_key: &str) -> bool {
        match self.dedup_store.is_already_processed(training_key).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::error!(error = %e, "training dedup check failed, allowing write");
                false
            }
        }
    }

    /// Fails closed: propagates the error so a training line that could
    /// not be registered as processed is surfaced rather than silently
    /// risking a future duplicate.
    async fn mark_processed(&self, training_key: &str, source: &SourceMetadata) -> Result<(), TrainingError> {
        self.dedup_store
            .mark_started(
                training_key,
                StartContext {
                    message_id: training_key.to_string(),
                    correlation_id: source.correlation_id.clone(),
                    user_id: source.user_id.clone(),
                    record_type: source.record_type.clone(),
                    object_key: source.object_key.clone(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use etl_common::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeDedup {
        processed: StdMutex<std::collections::HashSet<String>>,
        fail_is_duplicate: bool,
    }

    #[async_trait]
    impl DeduplicationStore for FakeDedup {
        async fn initialize(&self) -> Result<(), etl_dedup::DedupError> {
            Ok(())
        }

        async fn is_already_processed(&self, key: &str) -> Result<bool, etl_dedup::DedupError> {
            if self.fail_is_duplicate {
                return Err(etl_dedup::DedupError::InvalidRecord("boom".into()));
            }
            Ok(self.processed.lock().unwrap().contains(key))
        }

        async fn mark_started(&self, key: &str, _ctx: StartContext) -> Result<(), etl_dedup::DedupError> {
            self.processed.lock().unwrap().insert(key.to_string());
            Ok(())
        }

        async fn mark_completed(
            &self,
            _key: &str,
            _duration_seconds: f64,
            _records_processed: u64,
            _narrative: &str,
            _quality_score: f64,
        ) -> Result<(), etl_dedup::DedupError> {
            Ok(())
        }

        async fn mark_failed(&self, _key: &str, _message: &str, _kind: ErrorKind) -> Result<(), etl_dedup::DedupError> {
            Ok(())
        }

        async fn cleanup_expired(&self) -> Result<u64, etl_dedup::DedupError> {
            Ok(0)
        }

        async fn close(&self) -> Result<(), etl_dedup::DedupError> {
            Ok(())
        }
    }

    struct FakeStorage {
        contents: StdMutex<std::collections::HashMap<String, Bytes>>,
        put_count: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStoreClient for FakeStorage {
        async fn get(&self, _bucket: &str, key: &str, _max_size_bytes: u64) -> Result<Bytes, ObjectStoreError> {
            self.contents
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        }

        async fn put(&self, _bucket: &str, key: &str, body: Bytes, _content_type: &str) -> Result<(), ObjectStoreError> {
            self.put_count.fetch_add(1, Ordering::SeqCst);
            self.contents.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }

        async fn head(&self, _bucket: &str, _key: &str) -> Result<Option<etl_storage::ObjectMetadata>, ObjectStoreError> {
            Ok(None)
        }
    }

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::from_env().expect("env defaults");
        cfg.object_store_bucket = "health-data".into();
        cfg.training_prefix = "training".into();
        cfg.include_training_metadata = true;
        cfg
    }

    fn source() -> SourceMetadata {
        SourceMetadata {
            record_type: "BloodGlucoseRecord".into(),
            object_key: "raw/BloodGlucoseRecord/2026/01/u1_123_abc.avro".into(),
            bucket: "health-data".into(),
            user_id: "u1".into(),
            correlation_id: "c1".into(),
        }
    }

    fn processing() -> ProcessingMetadata {
        ProcessingMetadata {
            quality_score: 0.95,
            record_count: 42,
            processing_timestamp: DateTime::parse_from_rfc3339("2026-01-15T00:00:00Z").unwrap().with_timezone(&Utc),
            clinical_insights: json!({"total_readings": 42}),
        }
    }

    #[tokio::test]
    async fn empty_narrative_is_rejected_without_writing() {
        let dedup = Arc::new(FakeDedup { processed: StdMutex::new(Default::default()), fail_is_duplicate: false });
        let storage = Arc::new(FakeStorage { contents: StdMutex::new(Default::default()), put_count: AtomicUsize::new(0) });
        let emitter = TrainingEmitter::new(dedup, storage.clone(), &config());

        let emitted = emitter.emit("", &source(), &processing()).await.unwrap();

        assert!(!emitted);
        assert_eq!(storage.put_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_emission_creates_the_training_file() {
        let dedup = Arc::new(FakeDedup { processed: StdMutex::new(Default::default()), fail_is_duplicate: false });
        let storage = Arc::new(FakeStorage { contents: StdMutex::new(Default::default()), put_count: AtomicUsize::new(0) });
        let emitter = TrainingEmitter::new(dedup, storage.clone(), &config());

        let emitted = emitter.emit("Glucose levels are stable.", &source(), &processing()).await.unwrap();

        assert!(emitted);
        assert_eq!(storage.put_count.load(Ordering::SeqCst), 1);
        let key = emitter.training_output_key("BloodGlucoseRecord", processing().processing_timestamp);
        assert!(key.contains("metabolic_diabetes"));
        assert!(key.ends_with("health_journal_2026_01.jsonl"));
    }

    #[tokio::test]
    async fn second_identical_emission_is_deduplicated_and_does_not_write_again() {
        let dedup = Arc::new(FakeDedup { processed: StdMutex::new(Default::default()), fail_is_duplicate: false });
        let storage = Arc::new(FakeStorage { contents: StdMutex::new(Default::default()), put_count: AtomicUsize::new(0) });
        let emitter = TrainingEmitter::new(dedup, storage.clone(), &config());

        emitter.emit("Glucose levels are stable.", &source(), &processing()).await.unwrap();
        let emitted_again = emitter.emit("Glucose levels are stable.", &source(), &processing()).await.unwrap();

        assert!(emitted_again);
        assert_eq!(storage.put_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dedup_check_failure_fails_open_and_still_writes() {
        let dedup = Arc::new(FakeDedup { processed: StdMutex::new(Default::default()), fail_is_duplicate: true });
        let storage = Arc::new(FakeStorage { contents: StdMutex::new(Default::default()), put_count: AtomicUsize::new(0) });
        let emitter = TrainingEmitter::new(dedup, storage.clone(), &config());

        let emitted = emitter.emit("Glucose levels are stable.", &source(), &processing()).await.unwrap();

        assert!(emitted);
        assert_eq!(storage.put_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn metadata_is_omitted_when_include_training_metadata_is_false() {
        let dedup = Arc::new(FakeDedup { processed: StdMutex::new(Default::default()), fail_is_duplicate: false });
        let storage = Arc::new(FakeStorage { contents: StdMutex::new(Default::default()), put_count: AtomicUsize::new(0) });
        let mut cfg = config();
        cfg.include_training_metadata = false;
        let emitter = TrainingEmitter::new(dedup, storage.clone(), &cfg);

        emitter.emit("Glucose levels are stable.", &source(), &processing()).await.unwrap();

        let key = emitter.training_output_key("BloodGlucoseRecord", processing().processing_timestamp);
        let bytes = storage.contents.lock().unwrap().get(&key).cloned().unwrap();
        let line: Value = serde_json::from_slice(bytes.split(|b| *b == b'\n').next().unwrap()).unwrap();
        assert!(line.get("metadata").is_none());
    }

    #[tokio::test]
    async fn concurrent_emissions_of_the_same_content_hash_write_exactly_once() {
        let dedup = Arc::new(FakeDedup { processed: StdMutex::new(Default::default()), fail_is_duplicate: false });
        let storage = Arc::new(FakeStorage { contents: StdMutex::new(Default::default()), put_count: AtomicUsize::new(0) });
        let emitter = Arc::new(TrainingEmitter::new(dedup, storage.clone(), &config()));

        let e1 = emitter.clone();
        let e2 = emitter.clone();
        let (r1, r2) = tokio::join!(
            e1.emit("Glucose levels are stable.", &source(), &processing()),
            e2.emit("Glucose levels are stable.", &source(), &processing()),
        );

        assert!(r1.unwrap());
        assert!(r2.unwrap());
        assert_eq!(storage.put_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn content_hash_is_deterministic_and_source_sensitive() {
        let h1 = TrainingEmitter::content_hash("same narrative", "raw/a").unwrap();
        let h2 = TrainingEmitter::content_hash("same narrative", "raw/a").unwrap();
        let h3 = TrainingEmitter::content_hash("same narrative", "raw/b").unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }
}
