// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! This module implements the transport capabilities on top of lapin. A
//! [`LapinTransport`] opens one lapin connection per [`Session`], and every
//! [`AmqpChannel`] wraps one lapin channel.
//!
//! Connection failures reported by lapin's error callback surface as a
//! [`SessionEvent::Closed`], which the connection state machine turns into a
//! reconnect.

use crate::{
    config::ConnectionOptions,
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{
        AmqpChannel, DeliveryStream, InboundDelivery, PublishOutcome, Session, SessionEvent,
        Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::{BasicReturnMessage, Delivery},
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

const CLOSE_REPLY_CODE: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Session>, AmqpError> {
        debug!(name = options.name, "creating amqp connection...");
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(options.name.clone()));

        let conn = match Connection::connect(&options.amqp_uri(), properties).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), name = options.name, "failure to connect");
                Err(AmqpError::ConnectionError(options.name.clone()))
            }
        }?;

        let (events, _) = broadcast::channel(16);
        let sender = events.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            // nobody listening yet is fine
            let _ = sender.send(SessionEvent::Closed(err.to_string()));
        });

        Ok(Arc::new(LapinSession {
            name: options.name.clone(),
            conn,
            events,
        }))
    }
}

pub struct LapinSession {
    name: String,
    conn: Connection,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl Session for LapinSession {
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!(name = self.name, confirm, "creating amqp channel...");
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(self.name.clone())
        })?;

        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to enable publisher confirms");
                    AmqpError::ChannelError(self.name.clone())
                })?;
        }

        debug!("channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }
        self.conn
            .close(CLOSE_REPLY_CODE, "closed by client")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = self.name, "error closing the connection");
                AmqpError::ConnectionError(self.name.clone())
            })
    }
}

pub struct LapinChannel {
    channel: Channel,
}

fn inbound(delivery: Delivery) -> InboundDelivery {
    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        data: delivery.data,
    }
}

fn returned(message: Box<BasicReturnMessage>) -> Box<InboundDelivery> {
    Box::new(inbound(message.delivery))
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, lapin::ExchangeKind::from(kind), options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "exchange does not exist");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the exchange");
                AmqpError::DeleteExchangeError(name.to_owned())
            })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError> {
        match self.channel.queue_declare(name, options, arguments).await {
            Ok(queue) => Ok(queue.message_count()),
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
        }
    }

    async fn check_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        self.declare_queue(name, options, FieldTable::default()).await
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the queue");
                AmqpError::DeleteQueueError(name.to_owned())
            })
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to purge the queue");
                AmqpError::PurgeQueueError(name.to_owned())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                arguments,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, exchange, "error to bind the queue");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, exchange, "error to unbind the queue");
                AmqpError::UnbindingError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                arguments,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), source, destination, "error to bind the exchange");
                AmqpError::BindingExchangeToExchangeError(source.to_owned(), destination.to_owned())
            })
    }

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                arguments,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), source, destination, "error to unbind the exchange");
                AmqpError::UnbindingError(source.to_owned(), destination.to_owned())
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), prefetch, "error to define qos");
                AmqpError::QoSDeclarationError(self.channel.id().to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, &payload, properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange, "error publishing message");
                AmqpError::PublishingError(exchange.to_owned())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), exchange, "error awaiting publish confirm");
            AmqpError::PublishingError(exchange.to_owned())
        })?;

        Ok(match confirmation {
            Confirmation::Ack(Some(message)) | Confirmation::Nack(Some(message)) => {
                PublishOutcome::Returned(returned(message))
            }
            Confirmation::Nack(None) => PublishOutcome::Nack,
            Confirmation::Ack(None) | Confirmation::NotRequested => PublishOutcome::Ack,
        })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to ack");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to nack");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to reject");
                AmqpError::RejectMessageError
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |delivery| {
                delivery.map(inbound).map_err(|err| {
                    error!(error = err.to_string(), queue, "error receiving delivery");
                    AmqpError::BindingConsumerError(queue.clone())
                })
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(CLOSE_REPLY_CODE, "closed by client")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the channel");
                AmqpError::ChannelError(self.channel.id().to_string())
            })
    }
}
