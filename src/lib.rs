// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod ack;
pub mod binding;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod info;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod request;
pub mod resource;
pub mod serializers;
pub mod topic;
pub mod topology;
pub mod transport;

pub use binding::BindingDefinition;
pub use broker::{Broker, BulkOutcome};
pub use channel::LapinTransport;
pub use config::{ConnectionOptions, ReplyQueue, TopologyConfig};
pub use dispatcher::{handler_fn, ConsumerHandler, HandlerOptions, Subscription};
pub use errors::AmqpError;
pub use events::{BrokerEvent, EventSubscription};
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use memory::MemoryBroker;
pub use message::{Message, ReplyOptions};
pub use publisher::{HeaderValue, PublishOptions};
pub use queue::{QueueDefinition, QueueState, UniqueName};
pub use request::RequestOptions;
pub use serializers::{Body, Serializer};
