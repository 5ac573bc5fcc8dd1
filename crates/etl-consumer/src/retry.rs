use std::collections::HashSet;

use async_trait::async_trait;
use etl_common::ProcessingEnvelope;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel};
use tokio::sync::Mutex;

use crate::error::ConsumerError;

/// Publishes a failed envelope onto a TTL-bound delay queue so the broker
/// dead-letters it back to the main queue once the delay elapses.
#[async_trait]
pub trait RetryPublisher: Send + Sync {
    async fn publish_delayed(&self, envelope: &ProcessingEnvelope, delay_seconds: u64) -> Result<(), ConsumerError>;
}

/// One delay queue per distinct delay value, declared lazily and cached
/// for the lifetime of the channel.
pub struct AmqpRetryPublisher {
    channel: Channel,
    main_exchange: String,
    main_queue: String,
    declared: Mutex<HashSet<String>>,
}

impl AmqpRetryPublisher {
    pub fn new(channel: Channel, main_exchange: String, main_queue: String) -> Self {
        Self {
            channel,
            main_exchange,
            main_queue,
            declared: Mutex::new(HashSet::new()),
        }
    }

    fn delay_queue_name(&self, delay_seconds: u64) -> String {
        format!("{}_delay_{}s", self.main_queue, delay_seconds)
    }

    async fn ensure_delay_queue(&self, delay_seconds: u64, routing_key: &str) -> Result<String, ConsumerError> {
        let name = self.delay_queue_name(delay_seconds);

        let mut declared = self.declared.lock().await;
        if declared.contains(&name) {
            return Ok(name);
        }

        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(delay_seconds.saturating_mul(1000) as i64));
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from(self.main_exchange.clone())),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(LongString::from(routing_key.to_string())),
        );

        self.channel
            .queue_declare(&name, QueueDeclareOptions { durable: true, ..Default::default() }, args)
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        declared.insert(name.clone());
        Ok(name)
    }
}

#[async_trait]
impl RetryPublisher for AmqpRetryPublisher {
    async fn publish_delayed(&self, envelope: &ProcessingEnvelope, delay_seconds: u64) -> Result<(), ConsumerError> {
        let routing_key = envelope.routing_key_or_default();
        let delay_queue = self.ensure_delay_queue(delay_seconds, &routing_key).await?;

        let mut retried = envelope.clone();
        retried.retry_count += 1;
        retried.routing_key = Some(routing_key);

        let payload = serde_json::to_vec(&retried).map_err(|e| ConsumerError::Broker(e.to_string()))?;

        self.channel
            .basic_publish("", &delay_queue, BasicPublishOptions::default(), &payload, BasicProperties::default())
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_queue_name_embeds_the_delay() {
        let name = format!("{}_delay_{}s", "health_data_processing", 300);
        assert_eq!(name, "health_data_processing_delay_300s");
    }
}
