// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Capabilities
//!
//! The client never talks to the wire protocol directly. It consumes the three
//! capability traits below: a [`Transport`] opens [`Session`]s, a session opens
//! multiplexed [`AmqpChannel`]s, and a channel carries every broker round-trip.
//!
//! Two implementations ship with the crate: the lapin-backed transport in
//! [`crate::channel`] and the process-local broker in [`crate::memory`].

use crate::{
    config::ConnectionOptions, errors::AmqpError, exchange::ExchangeKind, resource::Resource,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A message handed to a consumer, or bounced back to a publisher.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Result of a confirmed publish.
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// The broker accepted the message (or confirms were not requested).
    Ack,
    /// The broker refused the message.
    Nack,
    /// The message was mandatory and could not be routed.
    Returned(Box<InboundDelivery>),
}

/// Session level notifications.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session was closed by the broker or the network.
    Closed(String),
    Blocked(String),
    Unblocked,
    /// An unroutable mandatory message came back.
    Returned(Box<InboundDelivery>),
}

/// Stream of deliveries for one consumer. It ends when the consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Opens sessions to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Session>, AmqpError>;
}

/// One open connection to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Opens a channel, optionally in publisher-confirm mode.
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    fn events(&self) -> broadcast::Receiver<SessionEvent>;

    async fn close(&self) -> Result<(), AmqpError>;
}

impl Resource for dyn Session {
    fn is_alive(&self) -> bool {
        self.is_open()
    }
}

/// A multiplexed channel on a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Non-mutating existence check.
    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Declares a queue and returns its ready message count.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError>;

    /// Non-mutating existence check, returning the ready message count.
    async fn check_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

impl Resource for dyn AmqpChannel {
    fn is_alive(&self) -> bool {
        self.is_open()
    }
}
