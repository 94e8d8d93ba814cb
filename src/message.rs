// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Inbound deliveries are wrapped into a [`Message`]. It carries the routing
//! metadata, the raw payload and the payload deserialized through the
//! serializer registry, and exposes `ack`, `nack` and `reject`. The first of
//! those calls settles the delivery; later calls are ignored.
//!
//! Settling only records the outcome in the queue's acknowledgment batch; the
//! broker round-trip happens on the next flush.

use crate::{
    ack::{AckBatch, AckStatus},
    errors::AmqpError,
    publisher::HeaderValue,
    resource::Resilient,
    serializers::{Body, SerializerRegistry},
    transport::{AmqpChannel, InboundDelivery},
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, warn};

/// Header set on the last reply of a request.
pub const SEQUENCE_END_HEADER: &str = "sequence_end";

struct Settlement {
    batch: Arc<AckBatch>,
    delivery_tag: u64,
}

/// Publishes replies on the channel the request was consumed from.
pub(crate) struct Responder {
    pub(crate) channel: Arc<Resilient<dyn AmqpChannel>>,
    pub(crate) serializers: Arc<SerializerRegistry>,
}

/// Options for [`Message::reply`].
#[derive(Debug, Clone, Default)]
pub struct ReplyOptions {
    /// More replies follow; the request stays open.
    pub more: bool,
    /// Message type of the reply, `<request type>.reply` by default.
    pub reply_type: Option<String>,
    pub content_type: Option<String>,
    pub headers: HashMap<String, HeaderValue>,
}

impl ReplyOptions {
    pub fn more() -> ReplyOptions {
        ReplyOptions {
            more: true,
            ..ReplyOptions::default()
        }
    }
}

/// A delivery as seen by handlers.
#[derive(Clone)]
pub struct Message {
    pub delivery_tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_type: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: FieldTable,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub body: Body,
    settlement: Option<Arc<Settlement>>,
    responder: Option<Arc<Responder>>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("message_type", &self.message_type)
            .field("correlation_id", &self.correlation_id)
            .field("body", &self.body)
            .finish()
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|value| value.to_string())
}

impl Message {
    /// Wraps a delivery. `batch` is `None` for consumers that do not
    /// acknowledge (reply queues, returned messages).
    pub(crate) fn from_delivery(
        queue: &str,
        delivery: InboundDelivery,
        serializers: &SerializerRegistry,
        batch: Option<Arc<AckBatch>>,
        responder: Option<Arc<Responder>>,
    ) -> Message {
        let props = &delivery.properties;
        let content_type = short(props.content_type());
        let content_encoding = short(props.content_encoding());

        let body = match &content_type {
            Some(content_type) if serializers.contains(content_type) => {
                match serializers.deserialize(
                    content_type,
                    &delivery.data,
                    content_encoding.as_deref(),
                ) {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            content_type, "failure to deserialize payload"
                        );
                        Body::Bytes(delivery.data.clone())
                    }
                }
            }
            _ => Body::Bytes(delivery.data.clone()),
        };

        let settlement = batch.map(|batch| {
            batch.track(delivery.delivery_tag);
            Arc::new(Settlement {
                batch,
                delivery_tag: delivery.delivery_tag,
            })
        });

        Message {
            delivery_tag: delivery.delivery_tag,
            queue: queue.to_owned(),
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            message_type: short(props.kind()).unwrap_or_default(),
            content_type,
            content_encoding,
            correlation_id: short(props.correlation_id()),
            message_id: short(props.message_id()),
            reply_to: short(props.reply_to()),
            headers: props.headers().clone().unwrap_or_default(),
            properties: delivery.properties,
            data: delivery.data,
            body,
            settlement,
            responder,
        }
    }

    /// Dispatch topic: the queue name with `.` replaced by `-`, then the type.
    pub fn topic(&self) -> String {
        format!("{}.{}", self.queue.replace('.', "-"), self.message_type)
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(key)
    }

    /// True when the message closes a reply sequence.
    pub fn sequence_end(&self) -> bool {
        matches!(
            self.header(SEQUENCE_END_HEADER),
            Some(AMQPValue::Boolean(true))
        )
    }

    pub fn ack(&self) -> bool {
        self.settle(AckStatus::Ack)
    }

    /// Negative acknowledgment; the broker requeues the message.
    pub fn nack(&self) -> bool {
        self.settle(AckStatus::Nack)
    }

    /// Rejects without requeue.
    pub fn reject(&self) -> bool {
        self.settle(AckStatus::Reject)
    }

    fn settle(&self, status: AckStatus) -> bool {
        match &self.settlement {
            Some(settlement) => settlement.batch.settle(settlement.delivery_tag, status),
            None => false,
        }
    }

    /// Publishes a reply to `reply_to`, correlated by this message's id.
    /// The final reply (`more == false`) also acknowledges this message.
    pub async fn reply(&self, body: Body, options: ReplyOptions) -> Result<(), AmqpError> {
        let (Some(reply_to), Some(responder)) = (&self.reply_to, &self.responder) else {
            return Err(AmqpError::PublishingError(format!(
                "message `{}` has no reply_to",
                self.message_type
            )));
        };

        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| body.default_content_type().to_owned());
        let payload = responder.serializers.serialize(&content_type, &body)?;

        let mut headers = crate::publisher::field_table(&options.headers);
        headers.insert(
            ShortString::from(SEQUENCE_END_HEADER),
            AMQPValue::Boolean(!options.more),
        );

        let reply_type = options
            .reply_type
            .clone()
            .unwrap_or_else(|| format!("{}.reply", self.message_type));

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_type(ShortString::from(reply_type))
            .with_headers(headers);
        if let Some(message_id) = &self.message_id {
            properties = properties.with_correlation_id(ShortString::from(message_id.clone()));
        }

        let channel = responder.channel.acquire().await?;
        channel
            .publish(
                "",
                reply_to,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        debug!(reply_to, more = options.more, "reply published");

        if !options.more {
            self.ack();
        }
        Ok(())
    }
}
