// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by every layer of the client.
//! The `AmqpError` enum covers connectivity, topology declaration, routing,
//! message handling, serialization and request/reply failures.
//!
//! Errors are `Clone` because a single pending operation (a connection attempt,
//! a channel creation, a topology stage) may be awaited by many callers at once
//! and every one of them receives the same outcome.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The retry budget of a connection was exhausted
    #[error("connection `{0}` is unreachable")]
    Unreachable(String),

    /// The connection was closed while the operation was pending
    #[error("connection `{0}` was closed")]
    ConnectionClosed(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete an exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding an exchange to another exchange
    #[error("failure to binding exchange `{0}` to exchange `{1}`")]
    BindingExchangeToExchangeError(String, String),

    /// Error removing a binding
    #[error("failure to unbind `{0}` from `{1}`")]
    UnbindingError(String, String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// The broker did not confirm a publish within the publish timeout
    #[error("publish to `{0}` timed out after {1} ms")]
    PublishTimeout(String, u64),

    /// The broker negatively confirmed a publish
    #[error("publish to `{0}` was rejected by the broker")]
    PublishNacked(String),

    /// No connection with the given name was configured
    #[error("no connection `{0}` has been configured")]
    NoConnection(String),

    /// No exchange with the given name exists on the connection
    #[error("no exchange `{0}` on connection `{1}` is defined")]
    NoExchange(String, String),

    /// No queue with the given name exists on the connection
    #[error("no queue `{0}` on connection `{1}` is defined")]
    NoQueue(String, String),

    /// No reply arrived before the reply timeout elapsed
    #[error("no reply received within the configured timeout of {0} ms")]
    RequestTimeout(u64),

    /// Requests need a reply queue, and the connection was configured without one
    #[error("connection `{0}` has no reply queue")]
    NoReplyQueue(String),

    /// Error serializing or deserializing a payload
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// No serializer is registered for the content type
    #[error("no serializer registered for content type `{0}`")]
    UnknownContentType(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error raised by a message handler
    #[error("failure to handle message `{0}`")]
    HandlerError(String),

    /// Error loading a configuration document
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
