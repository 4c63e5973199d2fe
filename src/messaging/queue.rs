use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result};

/// Delay before a failed delivery goes back to the queue, so a broken
/// dependency is not hammered by immediate redelivery.
pub(super) const REDELIVERY_BACKOFF: Duration = Duration::from_secs(5);

/// Publish half of the queue, as the discovery loop sees it.
#[async_trait]
pub trait QueueChannel: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<()>;
}

/// Consumer side callback. Invoked once per delivery; the outcome
/// decides whether the delivery is acknowledged or requeued.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

pub struct EventQueue {
    /// Held so the AMQP socket outlives the channel.
    _connection: Connection,
    channel: Channel,
    exchange: String,
    queue: String,
    routing_key: String,
}

impl EventQueue {
    /// Connect, declare the durable exchange and queue, and bind them.
    /// Declarations are idempotent on the broker side.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Queue(format!("Failed to create AMQP connection: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Queue(format!("Failed to create RabbitMQ channel: {}", e)))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to declare exchange: {}", e)))?;

        let _queue = channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                &config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to bind queue: {}", e)))?;

        debug!(
            "declared queue {} bound to exchange {} with key {}",
            config.queue, config.exchange, config.routing_key
        );

        Ok(Self {
            _connection: connection,
            channel,
            exchange: config.exchange.clone(),
            queue: config.queue.clone(),
            routing_key: config.routing_key.clone(),
        })
    }

    /// Start consuming. Every delivery is handled on its own task in
    /// `tasks`; the handler outcome decides the fate of the delivery.
    pub async fn consume(&self, tasks: &TaskTracker, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &format!("consumer-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to create consumer: {}", e)))?;

        let queue_name = self.queue.clone();
        let tracker = tasks.clone();
        tasks.spawn(async move {
            info!("Started consumer on queue: {}", queue_name);

            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let handler = handler.clone();
                        tracker.spawn(async move {
                            handle_delivery(delivery, handler).await;
                        });
                    }
                    Err(e) => {
                        error!("Error receiving message: {}", e);
                        // Short delay to avoid tight loop on errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }

            info!("Consumer stopped for queue: {}", queue_name);
        });

        Ok(())
    }
}

#[async_trait]
impl QueueChannel for EventQueue {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let _ = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                payload,
                // delivery mode 2 = persistent, survives broker restart
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to publish message: {}", e)))?;

        debug!("published {} bytes with routing key: {}", payload.len(), self.routing_key);

        Ok(())
    }
}

/// Map a handler outcome onto the delivery. Done and no-retry outcomes
/// are acknowledged, unrecoverable local faults stop the process, and
/// everything else goes back to the queue after a short backoff.
async fn handle_delivery(delivery: Delivery, handler: Arc<dyn MessageHandler>) {
    match handler.handle(&delivery.data).await {
        Ok(()) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!("Failed to acknowledge message: {}", e);
            }
        }
        Err(Error::StillInProgress(event_id)) => {
            info!(
                "Event {} still in progress at completion check, dropping",
                event_id
            );
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!("Failed to acknowledge message: {}", e);
            }
        }
        Err(e) if e.is_fatal() => {
            error!("Unrecoverable local fault while handling delivery: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Error processing delivery, requeueing: {}", e);
            tokio::time::sleep(REDELIVERY_BACKOFF).await;
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                error!("Failed to requeue message: {}", e);
            }
        }
    }
}
