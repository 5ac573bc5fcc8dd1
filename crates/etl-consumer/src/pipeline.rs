use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use etl_common::{Action, EngineConfig, ErrorKind, ProcessingEnvelope, RetryPolicy};
use etl_dedup::{DeduplicationStore, StartContext};
use etl_storage::ObjectStoreClient;
use etl_training::{ProcessingMetadata, SourceMetadata, TrainingEmitter};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::ConsumerError;
use crate::retry::RetryPublisher;
use crate::validator::Validator;

/// What the broker-facing loop should do with the delivery once
/// `process_message` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack(AckReason),
    NackNoRequeue(NackReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    Duplicate,
    Completed,
    RetryScheduled,
    Quarantined,
    RetrySchedulingFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    DeadLettered,
    Alerted,
}

/// Everything a single worker needs to run the per-message state machine.
/// Shared across workers; every field is cheaply cloneable or already
/// wrapped in an `Arc`.
pub struct ConsumerContext {
    pub config: Arc<EngineConfig>,
    pub dedup: Arc<dyn DeduplicationStore>,
    pub object_store: Arc<dyn ObjectStoreClient>,
    pub training: Arc<TrainingEmitter>,
    pub validator: Arc<dyn Validator>,
    pub retry_policy: RetryPolicy,
    pub retry_publisher: Arc<dyn RetryPublisher>,
}

pub async fn process_message(raw_body: &[u8], ctx: &ConsumerContext) -> Disposition {
    let envelope: ProcessingEnvelope = match serde_json::from_slice(raw_body) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = ConsumerError::EnvelopeParse(e.to_string());
            error!(error = %err, kind = ?err.kind(), "envelope is not valid JSON, dead-lettering");
            return Disposition::NackNoRequeue(NackReason::DeadLettered);
        }
    };

    if let Err(e) = envelope.validate_required_fields() {
        warn!(error = %e, idempotency_key = %envelope.idempotency_key, "envelope missing required fields, quarantining");
        return quarantine(&envelope, ctx, "validation").await;
    }

    match ctx.dedup.is_already_processed(&envelope.idempotency_key).await {
        Ok(true) => {
            metrics::counter!("etl_messages_duplicate_total").increment(1);
            info!(idempotency_key = %envelope.idempotency_key, "duplicate message, acking without reprocessing");
            return Disposition::Ack(AckReason::Duplicate);
        }
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e, "dedup check failed, treating as retriable");
            return act_on_failure(&envelope, ctx, ErrorKind::Network).await;
        }
    }

    if let Err(e) = ctx.dedup.mark_started(&envelope.idempotency_key, start_context(&envelope)).await {
        warn!(error = %e, "mark_started failed, treating as retriable");
        return act_on_failure(&envelope, ctx, ErrorKind::Network).await;
    }

    let deadline = Duration::from_secs(ctx.config.processing_timeout_seconds);
    let outcome = match tokio::time::timeout(deadline, run(&envelope, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ConsumerError::Timeout),
    };

    match outcome {
        Ok(Completed { quality_score, .. }) if quality_score < ctx.config.data_quality_threshold => {
            warn!(
                idempotency_key = %envelope.idempotency_key,
                quality_score,
                threshold = ctx.config.data_quality_threshold,
                "quality score below threshold, quarantining"
            );
            quarantine(&envelope, ctx, "data_quality").await
        }
        Ok(completed) => complete(&envelope, ctx, completed).await,
        Err(e) => {
            let kind = e.kind();
            error!(error = %e, ?kind, "processing failed");
            act_on_failure(&envelope, ctx, kind).await
        }
    }
}

fn start_context(envelope: &ProcessingEnvelope) -> StartContext {
    StartContext {
        message_id: envelope.message_id.clone(),
        correlation_id: envelope.correlation_id.clone(),
        user_id: envelope.user_id.clone(),
        record_type: envelope.record_type.clone(),
        object_key: envelope.object_key.clone(),
    }
}

struct Completed {
    narrative: String,
    quality_score: f64,
    records_processed: u64,
    clinical_insights: Value,
}

async fn run(envelope: &ProcessingEnvelope, ctx: &ConsumerContext) -> Result<Completed, ConsumerError> {
    let max_bytes = ctx.config.max_file_size_bytes();
    let blob = ctx.object_store.get(&envelope.bucket, &envelope.object_key, max_bytes).await?;

    let stream = etl_avro::RecordStream::open(blob.to_vec(), &envelope.record_type)?;
    let mut records = Vec::new();
    for record in stream {
        records.push(record?);
    }

    let validation = ctx.validator.validate(&records, &envelope.record_type).await;
    let processor = etl_processors::resolve(&envelope.record_type)?;
    let result = processor.process(&records, envelope, &validation).await;

    if !result.success {
        return Err(ConsumerError::Processing(
            result.error_message.unwrap_or_else(|| "processor reported failure".to_string()),
        ));
    }

    let narrative = result.narrative.unwrap_or_default();
    Ok(Completed {
        narrative,
        quality_score: result.quality_score,
        records_processed: result.records_processed,
        clinical_insights: result.clinical_insights,
    })
}

async fn complete(envelope: &ProcessingEnvelope, ctx: &ConsumerContext, completed: Completed) -> Disposition {
    let source = SourceMetadata {
        record_type: envelope.record_type.clone(),
        object_key: envelope.object_key.clone(),
        bucket: envelope.bucket.clone(),
        user_id: envelope.user_id.clone(),
        correlation_id: envelope.correlation_id.clone(),
    };
    let processing = ProcessingMetadata {
        quality_score: completed.quality_score,
        record_count: completed.records_processed,
        processing_timestamp: Utc::now(),
        clinical_insights: completed.clinical_insights,
    };

    if let Err(e) = ctx.training.emit(&completed.narrative, &source, &processing).await {
        error!(error = %e, "training emission failed");
        return act_on_failure(envelope, ctx, e.kind()).await;
    }

    let duration = 0.0;
    if let Err(e) = ctx
        .dedup
        .mark_completed(&envelope.idempotency_key, duration, completed.records_processed, &completed.narrative, completed.quality_score)
        .await
    {
        error!(error = %e, "mark_completed failed after successful processing");
    }

    info!(idempotency_key = %envelope.idempotency_key, "message processed and acked");
    Disposition::Ack(AckReason::Completed)
}

async fn act_on_failure(envelope: &ProcessingEnvelope, ctx: &ConsumerContext, kind: ErrorKind) -> Disposition {
    match ctx.retry_policy.action(kind, envelope.retry_count) {
        Action::Retry => {
            let delay = ctx.retry_policy.retry_delay_seconds(envelope.retry_count);
            match ctx.retry_publisher.publish_delayed(envelope, delay).await {
                Ok(()) => {
                    info!(idempotency_key = %envelope.idempotency_key, delay, "retry scheduled");
                    Disposition::Ack(AckReason::RetryScheduled)
                }
                Err(e) => {
                    error!(error = %e, "retry scheduling failed, acking to bound blast radius");
                    let _ = ctx
                        .dedup
                        .mark_failed(&envelope.idempotency_key, "infrastructure_error", ErrorKind::Network)
                        .await;
                    Disposition::Ack(AckReason::RetrySchedulingFailed)
                }
            }
        }
        Action::Quarantine => quarantine(envelope, ctx, kind.as_str()).await,
        Action::DeadLetter => {
            let _ = ctx.dedup.mark_failed(&envelope.idempotency_key, "dead_letter", kind).await;
            Disposition::NackNoRequeue(NackReason::DeadLettered)
        }
        Action::Alert => {
            let _ = ctx.dedup.mark_failed(&envelope.idempotency_key, "alert", kind).await;
            metrics::counter!("etl_alerts_total").increment(1);
            Disposition::NackNoRequeue(NackReason::Alerted)
        }
    }
}

async fn quarantine(envelope: &ProcessingEnvelope, ctx: &ConsumerContext, reason: &str) -> Disposition {
    match do_quarantine(envelope, ctx, reason).await {
        Ok(()) => {
            let _ = ctx.dedup.mark_failed(&envelope.idempotency_key, reason, ErrorKind::DataQuality).await;
            Disposition::Ack(AckReason::Quarantined)
        }
        Err(e) => {
            error!(error = %e, "quarantine move failed, dead-lettering instead");
            let _ = ctx.dedup.mark_failed(&envelope.idempotency_key, reason, ErrorKind::DataQuality).await;
            Disposition::NackNoRequeue(NackReason::DeadLettered)
        }
    }
}

async fn do_quarantine(envelope: &ProcessingEnvelope, ctx: &ConsumerContext, reason: &str) -> Result<(), ConsumerError> {
    let max_bytes = ctx.config.max_file_size_bytes();
    let bytes = ctx.object_store.get(&envelope.bucket, &envelope.object_key, max_bytes).await?;

    let basename = envelope.object_key.rsplit('/').next().unwrap_or(&envelope.object_key);
    let quarantine_key = format!("{}/{}/{}_{}", ctx.config.quarantine_prefix, reason, Utc::now().timestamp_millis(), basename);

    ctx.object_store.put(&envelope.bucket, &quarantine_key, bytes, "application/octet-stream").await?;

    let metadata = json!({
        "reason": reason,
        "original_key": envelope.object_key,
        "message_id": envelope.message_id,
        "idempotency_key": envelope.idempotency_key,
        "quarantined_at": Utc::now(),
    });
    let metadata_key = format!("{quarantine_key}.metadata.json");
    let metadata_bytes = serde_json::to_vec(&metadata).map_err(|e| ConsumerError::Processing(e.to_string()))?;
    ctx.object_store.put(&envelope.bucket, &metadata_key, Bytes::from(metadata_bytes), "application/json").await?;

    Ok(())
}
