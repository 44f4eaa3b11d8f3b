use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use tracing::{debug, info};

use crate::{
    config::Config,
    models::{message::InboundMessage, notification::EMAIL_TYPE_ATTRIBUTE},
};

/// A queue that hands out one receiver per worker.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    type Receiver: MessageReceiver + 'static;

    async fn open_receiver(&self, consumer_tag: &str) -> Result<Self::Receiver, Error>;
}

#[async_trait]
pub trait MessageReceiver: Send {
    /// Waits at most `idle_wait` for the next message.
    async fn receive(&mut self, idle_wait: Duration) -> Result<Option<InboundMessage>, Error>;

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), Error>;

    /// Returns the message to the queue for redelivery.
    async fn release(&self, message: &InboundMessage) -> Result<(), Error>;

    /// Stops consuming and hands back anything delivered but not yet received.
    async fn close(&mut self) -> Result<(), Error>;
}

/// Upper bound on waiting for the broker to confirm a cancel.
const CANCEL_DRAIN_WAIT: Duration = Duration::from_secs(5);

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    queue_name: String,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        info!("RabbitMQ connection established");

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        // Prefetch is applied per consumer, so each worker holds one message.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        channel
            .queue_declare(
                &config.email_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare email queue: {}", e))?;

        info!(queue = %config.email_queue_name, "Email queue declared");

        Ok(Self {
            connection,
            channel,
            queue_name: config.email_queue_name.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub async fn create_consumer(&self, consumer_tag: &str) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

        debug!(consumer_tag, queue = %self.queue_name, "Consumer created for queue");

        Ok(consumer)
    }

    /// Publishes a notification request with its `emailType` header.
    pub async fn publish(&self, email_type: &str, payload: &[u8]) -> Result<(), Error> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(EMAIL_TYPE_ATTRIBUTE),
            AMQPValue::LongString(email_type.into()),
        );

        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into())
                    .with_headers(headers),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RabbitMqClient {
    type Receiver = RabbitMqReceiver;

    async fn open_receiver(&self, consumer_tag: &str) -> Result<Self::Receiver, Error> {
        let consumer = self.create_consumer(consumer_tag).await?;

        Ok(RabbitMqReceiver {
            channel: self.channel.clone(),
            consumer,
        })
    }
}

pub struct RabbitMqReceiver {
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl MessageReceiver for RabbitMqReceiver {
    async fn receive(&mut self, idle_wait: Duration) -> Result<Option<InboundMessage>, Error> {
        match tokio::time::timeout(idle_wait, self.consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(anyhow!("RabbitMQ consumer stream closed")),
            Ok(Some(Err(e))) => Err(anyhow!("Failed to receive message: {}", e)),
            Ok(Some(Ok(delivery))) => Ok(Some(inbound_from_delivery(delivery))),
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), Error> {
        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    async fn release(&self, message: &InboundMessage) -> Result<(), Error> {
        self.channel
            .basic_reject(message.delivery_tag, BasicRejectOptions { requeue: true })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        let consumer_tag = self.consumer.tag();

        self.channel
            .basic_cancel(consumer_tag.as_str(), BasicCancelOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to cancel consumer: {}", e))?;

        // Buffered deliveries are yielded before the end of the stream.
        let mut returned = 0usize;
        while let Ok(Some(next)) =
            tokio::time::timeout(CANCEL_DRAIN_WAIT, self.consumer.next()).await
        {
            let Ok(delivery) = next else {
                continue;
            };

            self.channel
                .basic_reject(delivery.delivery_tag, BasicRejectOptions { requeue: true })
                .await
                .map_err(|e| anyhow!("Failed to return prefetched message: {}", e))?;
            returned += 1;
        }

        debug!(consumer_tag = %consumer_tag, returned, "Consumer cancelled");

        Ok(())
    }
}

fn inbound_from_delivery(delivery: Delivery) -> InboundMessage {
    let attributes = delivery
        .properties
        .headers()
        .as_ref()
        .map(header_attributes)
        .unwrap_or_default();

    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        redelivered: delivery.redelivered,
        attributes,
        body: delivery.data,
    }
}

/// Keeps the string-valued headers; other AMQP types carry no attributes we read.
fn header_attributes(headers: &FieldTable) -> HashMap<String, String> {
    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}
