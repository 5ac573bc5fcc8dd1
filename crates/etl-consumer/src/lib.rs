pub mod broker;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod validator;

pub use broker::AmqpConsumer;
pub use error::ConsumerError;
pub use pipeline::{AckReason, ConsumerContext, Disposition, NackReason};
pub use retry::{AmqpRetryPublisher, RetryPublisher};
pub use validator::{PassthroughValidator, Validator};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::process_message;
    use async_trait::async_trait;
    use bytes::Bytes;
    use etl_common::{DedupStoreKind, EngineConfig, ErrorKind, ProcessingEnvelope, RetryPolicy};
    use etl_dedup::{DedupError, DeduplicationStore, StartContext};
    use etl_storage::{ObjectMetadata, ObjectStoreClient, ObjectStoreError};
    use etl_training::TrainingEmitter;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::sync::Arc;

    struct FakeDedup {
        started: StdMutex<HashSet<String>>,
        completed: StdMutex<HashSet<String>>,
    }

    #[async_trait]
    impl DeduplicationStore for FakeDedup {
        async fn initialize(&self) -> Result<(), DedupError> {
            Ok(())
        }
        async fn is_already_processed(&self, key: &str) -> Result<bool, DedupError> {
            Ok(self.started.lock().unwrap().contains(key) || self.completed.lock().unwrap().contains(key))
        }
        async fn mark_started(&self, key: &str, _ctx: StartContext) -> Result<(), DedupError> {
            self.started.lock().unwrap().insert(key.to_string());
            Ok(())
        }
        async fn mark_completed(
            &self,
            key: &str,
            _duration_seconds: f64,
            _records_processed: u64,
            _narrative: &str,
            _quality_score: f64,
        ) -> Result<(), DedupError> {
            self.completed.lock().unwrap().insert(key.to_string());
            Ok(())
        }
        async fn mark_failed(&self, _key: &str, _message: &str, _kind: ErrorKind) -> Result<(), DedupError> {
            Ok(())
        }
        async fn cleanup_expired(&self) -> Result<u64, DedupError> {
            Ok(0)
        }
        async fn close(&self) -> Result<(), DedupError> {
            Ok(())
        }
    }

    struct FakeStorage {
        objects: StdMutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl ObjectStoreClient for FakeStorage {
        async fn get(&self, _bucket: &str, key: &str, _max_size_bytes: u64) -> Result<Bytes, ObjectStoreError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        }
        async fn put(&self, _bucket: &str, key: &str, body: Bytes, _content_type: &str) -> Result<(), ObjectStoreError> {
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }
        async fn head(&self, _bucket: &str, _key: &str) -> Result<Option<ObjectMetadata>, ObjectStoreError> {
            Ok(None)
        }
    }

    struct NoopRetryPublisher;

    #[async_trait]
    impl RetryPublisher for NoopRetryPublisher {
        async fn publish_delayed(&self, _envelope: &ProcessingEnvelope, _delay_seconds: u64) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::from_env().expect("env defaults");
        cfg.dedup_store_kind = DedupStoreKind::Embedded;
        cfg.object_store_bucket = "health-data".into();
        cfg.data_quality_threshold = 0.5;
        cfg
    }

    fn build_ctx(storage: Arc<FakeStorage>, dedup: Arc<FakeDedup>) -> Arc<ConsumerContext> {
        let config = Arc::new(config());
        let training = Arc::new(TrainingEmitter::new(dedup.clone(), storage.clone(), &config));
        Arc::new(ConsumerContext {
            config,
            dedup,
            object_store: storage,
            training,
            validator: Arc::new(PassthroughValidator),
            retry_policy: RetryPolicy::default(),
            retry_publisher: Arc::new(NoopRetryPublisher),
        })
    }

    fn envelope_json(object_key: &str) -> serde_json::Value {
        json!({
            "message_id": "m1",
            "correlation_id": "c1",
            "user_id": "u1",
            "record_type": "StepsRecord",
            "key": object_key,
            "bucket": "health-data",
            "idempotency_key": "idem-1",
        })
    }

    #[tokio::test]
    async fn unreadable_payload_dead_letters_without_touching_dedup() {
        let storage = Arc::new(FakeStorage { objects: StdMutex::new(HashMap::new()) });
        let dedup = Arc::new(FakeDedup { started: StdMutex::new(HashSet::new()), completed: StdMutex::new(HashSet::new()) });
        let ctx = build_ctx(storage, dedup);

        let disposition = process_message(b"not json", &ctx).await;
        assert_eq!(disposition, Disposition::NackNoRequeue(NackReason::DeadLettered));
    }

    #[tokio::test]
    async fn duplicate_message_acks_without_calling_object_store() {
        let storage = Arc::new(FakeStorage { objects: StdMutex::new(HashMap::new()) });
        let dedup = Arc::new(FakeDedup {
            started: StdMutex::new(HashSet::from(["idem-1".to_string()])),
            completed: StdMutex::new(HashSet::new()),
        });
        let ctx = build_ctx(storage, dedup);

        let body = serde_json::to_vec(&envelope_json("raw/StepsRecord/2026/01/01/u1.avro")).unwrap();
        let disposition = process_message(&body, &ctx).await;
        assert_eq!(disposition, Disposition::Ack(AckReason::Duplicate));
    }

    #[tokio::test]
    async fn missing_object_is_treated_as_dead_letter() {
        let storage = Arc::new(FakeStorage { objects: StdMutex::new(HashMap::new()) });
        let dedup = Arc::new(FakeDedup { started: StdMutex::new(HashSet::new()), completed: StdMutex::new(HashSet::new()) });
        let ctx = build_ctx(storage, dedup);

        let body = serde_json::to_vec(&envelope_json("raw/StepsRecord/2026/01/01/missing.avro")).unwrap();
        let disposition = process_message(&body, &ctx).await;
        assert_eq!(disposition, Disposition::NackNoRequeue(NackReason::DeadLettered));
    }
}
