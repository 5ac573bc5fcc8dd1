use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::ConsumerError;
use crate::pipeline::{process_message, ConsumerContext, Disposition};

/// Owns the broker connection and the declared topology. One connection is
/// shared across every worker; each worker opens its own channel off it, so
/// a slow or crashed worker never blocks another's in-flight deliveries.
pub struct AmqpConsumer {
    connection: Connection,
    queue_name: String,
    exchange_name: String,
    routing_key_pattern: String,
    dead_letter_queue: String,
    prefetch_count: u16,
    worker_count: u16,
    ctx: Arc<ConsumerContext>,
}

impl AmqpConsumer {
    pub async fn connect(
        broker_url: &str,
        exchange_name: String,
        queue_name: String,
        routing_key_pattern: String,
        dead_letter_queue: String,
        prefetch_count: u16,
        worker_count: u16,
        ctx: Arc<ConsumerContext>,
    ) -> Result<Self, ConsumerError> {
        let connection = Connection::connect(broker_url, ConnectionProperties::default())
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        Ok(Self {
            connection,
            queue_name,
            exchange_name,
            routing_key_pattern,
            dead_letter_queue,
            prefetch_count,
            worker_count: worker_count.max(1),
            ctx,
        })
    }

    /// Declares the topic exchange, durable main queue bound to it, and
    /// the durable dead-letter queue. Idempotent across restarts.
    pub async fn declare_topology(&self) -> Result<(), ConsumerError> {
        let channel = self.connection.create_channel().await.map_err(|e| ConsumerError::Broker(e.to_string()))?;

        channel
            .exchange_declare(
                &self.exchange_name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        channel
            .queue_bind(
                &self.queue_name,
                &self.exchange_name,
                &self.routing_key_pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        channel
            .queue_declare(
                &self.dead_letter_queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        info!(queue = %self.queue_name, exchange = %self.exchange_name, "broker topology declared");
        Ok(())
    }

    /// Spawns `worker_count` independently-scheduled workers, each owning
    /// its own channel bound by `prefetch_count`, and waits for all of them
    /// to stop. Every worker selects on its own clone of `shutdown`, so a
    /// single broadcast fires the same stop signal into all of them at once.
    pub async fn start_consuming(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ConsumerError> {
        let mut handles = Vec::with_capacity(self.worker_count as usize);

        for worker_id in 0..self.worker_count {
            let channel = self.connection.create_channel().await.map_err(|e| ConsumerError::Broker(e.to_string()))?;
            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| ConsumerError::Broker(e.to_string()))?;

            let queue_name = self.queue_name.clone();
            let ctx = self.ctx.clone();
            let shutdown_rx = shutdown.resubscribe();

            handles.push(tokio::spawn(run_worker(worker_id, channel, queue_name, ctx, shutdown_rx)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "consumer worker task panicked");
            }
        }

        Ok(())
    }
}

/// Runs the delivery loop for one worker until `shutdown` fires. Each
/// delivery is processed to completion before the next is considered on
/// this worker's channel; other workers keep making progress independently.
async fn run_worker(
    worker_id: u16,
    channel: lapin::Channel,
    queue_name: String,
    ctx: Arc<ConsumerContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let consumer_tag = format!("etl-narrative-engine-{worker_id}");
    let mut consumer = match channel
        .basic_consume(&queue_name, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
        .await
    {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(error = %e, worker_id, "failed to start consuming, worker exiting");
            return;
        }
    };

    loop {
        tokio::select! {
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let disposition = process_message(&delivery.data, &ctx).await;
                        finish(delivery, disposition).await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, worker_id, "broker delivery error");
                    }
                    None => {
                        warn!(worker_id, "consumer stream closed");
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(worker_id, "shutdown signal received, stopping worker");
                break;
            }
        }
    }
}

async fn finish(delivery: lapin::message::Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack(_) => delivery.ack(BasicAckOptions::default()).await,
        Disposition::NackNoRequeue(_) => delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await,
    };
    if let Err(e) = result {
        error!(error = %e, "failed to ack/nack delivery");
    }
}
