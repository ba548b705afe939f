// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! One connection and one channel serve both consuming and publishing. The
//! channel runs in publisher-confirm mode and publishes are mandatory, so a
//! publish only succeeds once the broker has routed the copy to a queue and
//! taken responsibility for it.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{
    AMQPValue, ByteArray, DecimalValue, FieldArray, FieldTable, LongString, ShortString,
};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::delivery::{Acknowledger, Delivery, Metadata, MetadataValue};
use crate::errors::TransportError;
use crate::transport::{Destination, Publisher, Subscription};

const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    queue: String,
    dead_letter_queue: String,
    consumer_tag: String,
    reject_requeue: bool,
}

impl AmqpTransport {
    /// Connects, enables publisher confirms, declares both queues as durable
    /// and applies the prefetch limit.
    pub async fn connect(config: &RelayConfig) -> Result<Self, TransportError> {
        let connection = Connection::connect(&config.broker_url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(format!("failed to open channel: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connect(format!("failed to enable confirms: {e}")))?;

        for queue in [&config.queue, &config.dead_letter_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Declare {
                    queue: queue.clone(),
                    reason: e.to_string(),
                })?;
        }

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Connect(format!("failed to set QoS: {e}")))?;

        info!(
            queue = %config.queue,
            dead_letter_queue = %config.dead_letter_queue,
            prefetch = config.prefetch,
            "Transport | connected to broker"
        );

        Ok(Self {
            connection,
            channel,
            queue: config.queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            consumer_tag: config.consumer_tag.clone(),
            reject_requeue: config.reject_requeue,
        })
    }

    pub fn publisher(&self) -> AmqpPublisher {
        AmqpPublisher {
            channel: self.channel.clone(),
            queue: self.queue.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
        }
    }

    pub async fn subscribe(&self) -> Result<AmqpSubscription, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume {
                queue: self.queue.clone(),
                reason: e.to_string(),
            })?;

        info!(queue = %self.queue, tag = %self.consumer_tag, "Transport | consuming");
        Ok(AmqpSubscription {
            channel: self.channel.clone(),
            consumer,
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            reject_requeue: self.reject_requeue,
            cancelled: false,
        })
    }

    /// Closes the channel and then the connection.
    pub async fn close(self) -> Result<(), TransportError> {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            debug!("Transport | channel close failed: {e}");
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| TransportError::Connect(format!("failed to close connection: {e}")))?;
        info!("Transport | connection closed");
        Ok(())
    }
}

#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    queue: String,
    dead_letter_queue: String,
}

impl AmqpPublisher {
    fn queue_for(&self, destination: Destination) -> &str {
        match destination {
            Destination::Primary => &self.queue,
            Destination::DeadLetter => &self.dead_letter_queue,
        }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(
        &self,
        destination: Destination,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<(), TransportError> {
        let queue = self.queue_for(destination);
        let publish_error = |e: lapin::Error| TransportError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_headers(headers_from_metadata(metadata))
            .with_timestamp(u64::try_from(Utc::now().timestamp()).unwrap_or_default());

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        check_confirmation(queue, confirmation)?;
        debug!(queue, len = payload.len(), "Transport | publish confirmed");
        Ok(())
    }
}

pub struct AmqpSubscription {
    channel: Channel,
    consumer: lapin::Consumer,
    queue: String,
    consumer_tag: String,
    reject_requeue: bool,
    cancelled: bool,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, TransportError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| {
                let metadata = metadata_from_headers(delivery.properties.headers().as_ref());
                let acker = AmqpAcker {
                    acker: delivery.acker,
                    requeue: self.reject_requeue,
                };
                Delivery::new(delivery.data, metadata, acker)
            })
            .map_err(|e| TransportError::Consume {
                queue: self.queue.clone(),
                reason: e.to_string(),
            }),
        )
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::Consume {
                queue: self.queue.clone(),
                reason: format!("cancel failed: {e}"),
            })
    }
}

struct AmqpAcker {
    acker: Acker,
    requeue: bool,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Acknowledge {
                action: "ack",
                reason: e.to_string(),
            })
    }

    async fn reject(&self) -> Result<(), TransportError> {
        self.acker
            .reject(BasicRejectOptions {
                requeue: self.requeue,
            })
            .await
            .map_err(|e| TransportError::Acknowledge {
                action: "reject",
                reason: e.to_string(),
            })
    }
}

/// Converts AMQP headers to metadata without loss, so that republishing the
/// result reproduces the original table.
pub fn metadata_from_headers(headers: Option<&FieldTable>) -> Metadata {
    headers.map(metadata_from_table).unwrap_or_default()
}

fn metadata_from_table(table: &FieldTable) -> Metadata {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), metadata_from_value(value)))
        .collect()
}

fn metadata_from_value(value: &AMQPValue) -> MetadataValue {
    match value {
        AMQPValue::Boolean(v) => MetadataValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => MetadataValue::I8(*v),
        AMQPValue::ShortShortUInt(v) => MetadataValue::U8(*v),
        AMQPValue::ShortInt(v) => MetadataValue::I16(*v),
        AMQPValue::ShortUInt(v) => MetadataValue::U16(*v),
        AMQPValue::LongInt(v) => MetadataValue::I32(*v),
        AMQPValue::LongUInt(v) => MetadataValue::U32(*v),
        AMQPValue::LongLongInt(v) => MetadataValue::Int(*v),
        AMQPValue::Float(v) => MetadataValue::F32(*v),
        AMQPValue::Double(v) => MetadataValue::Float(*v),
        AMQPValue::DecimalValue(v) => MetadataValue::Decimal {
            scale: v.scale,
            value: v.value,
        },
        AMQPValue::ShortString(v) => MetadataValue::Text(v.as_str().to_string()),
        AMQPValue::LongString(v) => match std::str::from_utf8(v.as_bytes()) {
            Ok(text) => MetadataValue::Text(text.to_string()),
            Err(_) => MetadataValue::Bytes(v.as_bytes().to_vec()),
        },
        AMQPValue::FieldArray(v) => {
            MetadataValue::List(v.as_slice().iter().map(metadata_from_value).collect())
        }
        AMQPValue::Timestamp(v) => MetadataValue::Timestamp(*v),
        AMQPValue::FieldTable(v) => MetadataValue::Table(metadata_from_table(v)),
        AMQPValue::ByteArray(v) => MetadataValue::ByteArray(v.as_slice().to_vec()),
        AMQPValue::Void => MetadataValue::Void,
    }
}

/// Converts metadata to AMQP headers. Text is always sent as a long string,
/// the only string type brokers accept in header tables.
pub fn headers_from_metadata(metadata: &Metadata) -> FieldTable {
    let mut headers = FieldTable::default();
    for (key, value) in metadata {
        headers.insert(ShortString::from(key.as_str()), value_from_metadata(value));
    }
    headers
}

fn value_from_metadata(value: &MetadataValue) -> AMQPValue {
    match value {
        MetadataValue::Bool(v) => AMQPValue::Boolean(*v),
        MetadataValue::I8(v) => AMQPValue::ShortShortInt(*v),
        MetadataValue::U8(v) => AMQPValue::ShortShortUInt(*v),
        MetadataValue::I16(v) => AMQPValue::ShortInt(*v),
        MetadataValue::U16(v) => AMQPValue::ShortUInt(*v),
        MetadataValue::I32(v) => AMQPValue::LongInt(*v),
        MetadataValue::U32(v) => AMQPValue::LongUInt(*v),
        MetadataValue::Int(v) => AMQPValue::LongLongInt(*v),
        MetadataValue::F32(v) => AMQPValue::Float(*v),
        MetadataValue::Float(v) => AMQPValue::Double(*v),
        MetadataValue::Decimal { scale, value } => AMQPValue::DecimalValue(DecimalValue {
            scale: *scale,
            value: *value,
        }),
        MetadataValue::Text(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        MetadataValue::Bytes(v) => AMQPValue::LongString(LongString::from(v.clone())),
        MetadataValue::ByteArray(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        MetadataValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        MetadataValue::List(v) => {
            let values: Vec<AMQPValue> = v.iter().map(value_from_metadata).collect();
            AMQPValue::FieldArray(FieldArray::from(values))
        }
        MetadataValue::Table(v) => AMQPValue::FieldTable(headers_from_metadata(v)),
        MetadataValue::Void => AMQPValue::Void,
    }
}

/// Maps a publisher confirm to the publish result. With `mandatory` set, an
/// unroutable message comes back acked but carrying the returned message.
fn check_confirmation(queue: &str, confirmation: Confirmation) -> Result<(), TransportError> {
    match confirmation {
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
            Err(TransportError::Unroutable {
                queue: queue.to_string(),
                reason: format!("{} {}", returned.reply_code, returned.reply_text.as_str()),
            })
        }
        Confirmation::Nack(None) => Err(TransportError::PublishNacked(queue.to_string())),
    }
}
