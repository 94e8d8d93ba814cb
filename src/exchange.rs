// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the declarative [`ExchangeDefinition`] and the live
//! [`Exchange`] built from it. An exchange owns one resilient confirm-mode
//! channel; whenever that channel is (re)created the exchange is declared on
//! it again, so a broker-side disconnect never leaves a publisher pointing at
//! an undeclared exchange.

use crate::{
    connection::Connection,
    errors::AmqpError,
    otel,
    publisher::{field_table, PublishOptions},
    resource::Resilient,
    serializers::SerializerRegistry,
    transport::{AmqpChannel, PublishOutcome},
};
use futures_util::FutureExt;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// Argument naming the exchange that receives unroutable messages
pub const AMQP_ARGUMENT_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeDefinition {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Only check that the exchange exists.
    pub passive: bool,
    /// Exchange receiving messages this one cannot route.
    pub alternate: Option<String>,
    /// Confirmation timeout in milliseconds for publishes through this exchange.
    pub publish_timeout: Option<u64>,
    /// Reply timeout in milliseconds for requests through this exchange.
    pub reply_timeout: Option<u64>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a Direct exchange with default parameters.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..ExchangeDefinition::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    pub fn headers(mut self) -> Self {
        self.kind = ExchangeKind::Headers;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn alternate(mut self, exchange: &str) -> Self {
        self.alternate = Some(exchange.to_owned());
        self
    }

    pub fn publish_timeout(mut self, millis: u64) -> Self {
        self.publish_timeout = Some(millis);
        self
    }

    pub fn reply_timeout(mut self, millis: u64) -> Self {
        self.reply_timeout = Some(millis);
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(alternate) = &self.alternate {
            args.insert(
                ShortString::from(AMQP_ARGUMENT_ALTERNATE_EXCHANGE),
                AMQPValue::LongString(LongString::from(alternate.clone())),
            );
        }
        args
    }
}

/// Declares (or, when passive, checks) an exchange on a channel.
pub async fn define(channel: &dyn AmqpChannel, def: &ExchangeDefinition) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);

    let result = if def.passive {
        channel.check_exchange(&def.name).await
    } else {
        channel
            .declare_exchange(
                &def.name,
                &def.kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
    };

    match result {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(def.name.clone()))
        }
        _ => {
            debug!("exchange: {} was created", def.name);
            Ok(())
        }
    }
}

/// A declared exchange. Publishing is its only outward operation.
pub struct Exchange {
    def: ExchangeDefinition,
    connection: Arc<Connection>,
    channel: Resilient<dyn AmqpChannel>,
    serializers: Arc<SerializerRegistry>,
}

impl Exchange {
    pub(crate) fn new(
        def: ExchangeDefinition,
        connection: Arc<Connection>,
        serializers: Arc<SerializerRegistry>,
    ) -> Arc<Exchange> {
        let factory_def = def.clone();
        let factory_connection = connection.clone();
        let channel = Resilient::new(
            &format!("exchange:{}", def.name),
            "exchange",
            Arc::new(move || {
                let def = factory_def.clone();
                let connection = factory_connection.clone();
                async move {
                    let channel = connection.open_channel(true).await?;
                    define(channel.as_ref(), &def).await?;
                    Ok::<_, AmqpError>(channel)
                }
                .boxed()
            }),
        )
        .with_close_hook(Arc::new(|channel: Arc<dyn AmqpChannel>| {
            async move {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "error closing exchange channel");
                }
            }
            .boxed()
        }));

        Arc::new(Exchange {
            def,
            connection,
            channel,
            serializers,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &ExchangeDefinition {
        &self.def
    }

    /// Ensures the exchange is declared on a live channel.
    pub async fn define(&self) -> Result<(), AmqpError> {
        self.channel.acquire().await.map(|_| ())
    }

    pub(crate) fn channel(&self) -> &Resilient<dyn AmqpChannel> {
        &self.channel
    }

    /// Publish timeout for a message: per-message, then exchange, then connection.
    pub(crate) fn publish_timeout(&self, options: &PublishOptions) -> Option<u64> {
        options
            .timeout
            .or(self.def.publish_timeout)
            .or(self.connection.options().publish_timeout)
    }

    /// Serializes and publishes one message.
    pub async fn publish(&self, options: &PublishOptions) -> Result<(), AmqpError> {
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| options.body.default_content_type().to_owned());
        let payload = self.serializers.serialize(&content_type, &options.body)?;

        let mut headers = field_table(&options.headers);
        otel::inject_current(&mut headers);
        let properties = options.properties(&content_type, headers);
        let routing_key = options.effective_routing_key();

        let channel = self.channel.acquire().await?;
        let publish = channel.publish(
            &self.def.name,
            &routing_key,
            BasicPublishOptions {
                mandatory: options.mandatory,
                immediate: false,
            },
            payload,
            properties,
        );

        let outcome = match self.publish_timeout(options) {
            Some(millis) => tokio::time::timeout(Duration::from_millis(millis), publish)
                .await
                .map_err(|_| {
                    error!(exchange = self.def.name, "publish timed out");
                    AmqpError::PublishTimeout(self.def.name.clone(), millis)
                })?,
            None => publish.await,
        };

        match outcome {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                self.channel.invalidate();
                Err(err)
            }
            Ok(PublishOutcome::Ack) => Ok(()),
            Ok(PublishOutcome::Nack) => Err(AmqpError::PublishNacked(self.def.name.clone())),
            Ok(PublishOutcome::Returned(delivery)) => {
                debug!(
                    exchange = self.def.name,
                    routing_key, "message was returned by the broker"
                );
                self.connection.notify_returned(*delivery);
                Ok(())
            }
        }
    }

    /// Deletes the exchange on the broker and releases its channel.
    pub(crate) async fn destroy(&self) -> Result<(), AmqpError> {
        let channel = self.channel.acquire().await?;
        let result = channel.delete_exchange(&self.def.name).await.map_err(|err| {
            error!(error = err.to_string(), name = self.def.name, "error to delete the exchange");
            AmqpError::DeleteExchangeError(self.def.name.clone())
        });
        self.channel.close().await;
        result
    }

    pub(crate) async fn release(&self) {
        self.channel.close().await;
    }
}
