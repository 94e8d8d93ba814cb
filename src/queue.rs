// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the declarative [`QueueDefinition`] and the live
//! [`Queue`] built from it. A queue owns one resilient channel (with its
//! prefetch limit applied) on which it is declared, consumed and acknowledged.
//!
//! Classic and quorum queues accept different arguments. Classic queues take
//! every caller-supplied argument; quorum queues only get a length limit and a
//! dead-letter strategy, since RabbitMQ refuses e.g. `x-max-priority` on them.

use crate::{
    ack::{AckBatch, AckStatus},
    connection::Connection,
    dispatcher::Dispatcher,
    errors::AmqpError,
    info,
    message::{Message, Responder},
    request::RequestCoordinator,
    resource::Resilient,
    serializers::SerializerRegistry,
    transport::{AmqpChannel, DeliveryStream, InboundDelivery},
};
use futures_util::{FutureExt, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortShortUInt, ShortString},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify the quorum dead letter strategy
pub const AMQP_HEADERS_DEAD_LETTER_STRATEGY: &str = "x-dead-letter-strategy";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify the idle queue expiry
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify the priority range
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";
/// Constant for the header field used to specify the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    #[default]
    Classic,
    Quorum,
}

impl QueueType {
    fn as_str(&self) -> &'static str {
        match self {
            QueueType::Classic => "classic",
            QueueType::Quorum => "quorum",
        }
    }
}

/// Suffix appended to the queue name to make it unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueName {
    /// Hash of the consumer id; unique per process.
    Hash,
    /// The consumer id itself.
    Id,
    /// Hash of host and process name; stable across restarts.
    Consistent,
}

/// Runtime state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Ready,
    Subscribed,
    PendingDelete,
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Only check that the queue exists.
    pub passive: bool,
    /// Consume without acknowledgments.
    pub no_ack: bool,
    /// Flush acknowledgments right away instead of on the batch tick.
    pub no_batch: bool,
    /// Start consuming once declared.
    pub subscribe: bool,
    /// Prefetch limit of the queue channel.
    pub limit: Option<u16>,
    pub queue_limit: Option<u32>,
    pub max_priority: Option<u8>,
    pub message_ttl: Option<u32>,
    pub expires: Option<u32>,
    /// Dead letter exchange.
    pub dead_letter: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    /// Quorum only, e.g. `at-least-once`.
    pub dead_letter_strategy: Option<String>,
    pub queue_type: QueueType,
    pub unique: Option<UniqueName>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is a classic, non-durable, non-exclusive queue.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer is gone.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn no_batch(mut self) -> Self {
        self.no_batch = true;
        self
    }

    pub fn subscribe(mut self) -> Self {
        self.subscribe = true;
        self
    }

    pub fn limit(mut self, prefetch: u16) -> Self {
        self.limit = Some(prefetch);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn queue_limit(mut self, max: u32) -> Self {
        self.queue_limit = Some(max);
        self
    }

    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn message_ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn expires(mut self, millis: u32) -> Self {
        self.expires = Some(millis);
        self
    }

    pub fn dead_letter(mut self, exchange: &str) -> Self {
        self.dead_letter = Some(exchange.to_owned());
        self
    }

    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    pub fn dead_letter_strategy(mut self, strategy: &str) -> Self {
        self.dead_letter_strategy = Some(strategy.to_owned());
        self
    }

    pub fn quorum(mut self) -> Self {
        self.queue_type = QueueType::Quorum;
        self
    }

    pub fn unique(mut self, unique: UniqueName) -> Self {
        self.unique = Some(unique);
        self
    }

    /// Name the queue is declared under, with its `unique` suffix.
    pub fn resolved_name(&self) -> String {
        match self.unique {
            None => self.name.clone(),
            Some(UniqueName::Hash) => format!("{}.{}", self.name, info::consumer_hash()),
            Some(UniqueName::Id) => format!("{}.{}", self.name, info::consumer_id()),
            Some(UniqueName::Consistent) => {
                format!("{}.{}", self.name, info::consistent_hash())
            }
        }
    }
}

fn insert_long(args: &mut FieldTable, key: &str, value: Option<u32>) {
    if let Some(value) = value {
        args.insert(
            ShortString::from(key),
            AMQPValue::LongLongInt(LongLongInt::from(value)),
        );
    }
}

fn insert_string(args: &mut FieldTable, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        args.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
}

/// Declaration arguments for a queue definition.
pub fn arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = FieldTable::default();
    insert_long(&mut args, AMQP_HEADERS_MAX_LENGTH, def.queue_limit);

    match def.queue_type {
        QueueType::Quorum => {
            insert_string(
                &mut args,
                AMQP_HEADERS_DEAD_LETTER_STRATEGY,
                &def.dead_letter_strategy,
            );
        }
        QueueType::Classic => {
            if let Some(priority) = def.max_priority {
                args.insert(
                    ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
                    AMQPValue::ShortShortUInt(ShortShortUInt::from(priority)),
                );
            }
            insert_long(&mut args, AMQP_HEADERS_MESSAGE_TTL, def.message_ttl);
            insert_long(&mut args, AMQP_HEADERS_EXPIRES, def.expires);
            insert_string(&mut args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE, &def.dead_letter);
            insert_string(
                &mut args,
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                &def.dead_letter_routing_key,
            );
        }
    }

    args.insert(
        ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
        AMQPValue::LongString(LongString::from(def.queue_type.as_str())),
    );
    args
}

/// Declares (or, when passive, checks) a queue. Returns its ready message count.
pub async fn define(channel: &dyn AmqpChannel, def: &QueueDefinition) -> Result<u32, AmqpError> {
    debug!("creating queue: {}", def.name);

    let result = if def.passive {
        channel.check_queue(&def.name).await
    } else {
        channel
            .declare_queue(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                arguments(def),
            )
            .await
    };

    match result {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the queue"
            );
            Err(AmqpError::DeclareQueueError(def.name.clone()))
        }
        Ok(count) => {
            debug!("queue: {} was created", def.name);
            Ok(count)
        }
    }
}

struct Consumer {
    tag: String,
    exclusive: bool,
}

/// A declared queue and its consumer.
pub struct Queue {
    def: QueueDefinition,
    connection: Arc<Connection>,
    channel: Arc<Resilient<dyn AmqpChannel>>,
    state: Mutex<QueueState>,
    consumer: Mutex<Option<Consumer>>,
    /// Subscribed when the connection was lost.
    resubscribe: Mutex<Option<bool>>,
    batch: Arc<AckBatch>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Arc<Dispatcher>,
    replies: Option<Arc<RequestCoordinator>>,
    serializers: Arc<SerializerRegistry>,
    responder: Arc<Responder>,
}

impl Queue {
    /// `replies` is set for the connection's reply queue, whose deliveries go
    /// to pending requests instead of handlers.
    pub(crate) fn new(
        def: QueueDefinition,
        connection: Arc<Connection>,
        dispatcher: Arc<Dispatcher>,
        replies: Option<Arc<RequestCoordinator>>,
        serializers: Arc<SerializerRegistry>,
    ) -> Arc<Queue> {
        let batch = Arc::new(AckBatch::new(def.no_batch));

        let factory_def = def.clone();
        let factory_connection = connection.clone();
        let factory_batch = batch.clone();
        let channel = Arc::new(
            Resilient::new(
                &format!("queue:{}", def.name),
                "queue",
                Arc::new(move || {
                    let def = factory_def.clone();
                    let connection = factory_connection.clone();
                    let batch = factory_batch.clone();
                    async move {
                        let channel = connection.open_channel(false).await?;
                        // tags of the previous channel can no longer be settled
                        batch.reset();
                        if let Some(limit) = def.limit {
                            channel.qos(limit).await.map_err(|err| {
                                error!(error = err.to_string(), "error to configure qos");
                                AmqpError::QoSDeclarationError(def.name.clone())
                            })?;
                        }
                        define(channel.as_ref(), &def).await?;
                        Ok::<_, AmqpError>(channel)
                    }
                    .boxed()
                }),
            )
            .with_close_hook(Arc::new(|channel: Arc<dyn AmqpChannel>| {
                async move {
                    if let Err(err) = channel.close().await {
                        debug!(error = err.to_string(), "error closing queue channel");
                    }
                }
                .boxed()
            })),
        );

        let responder = Arc::new(Responder {
            channel: channel.clone(),
            serializers: serializers.clone(),
        });

        Arc::new(Queue {
            def,
            connection,
            channel,
            state: Mutex::new(QueueState::Ready),
            consumer: Mutex::new(None),
            resubscribe: Mutex::new(None),
            batch,
            flusher: Mutex::new(None),
            dispatcher,
            replies,
            serializers,
            responder,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.def
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    pub fn connection_name(&self) -> &str {
        self.connection.name()
    }

    /// Deliveries received but not yet settled.
    pub fn unsettled(&self) -> usize {
        self.batch.pending()
    }

    /// Ensures the queue is declared on a live channel.
    pub async fn define(&self) -> Result<(), AmqpError> {
        self.channel.acquire().await.map(|_| ())
    }

    /// Starts consuming. A no-op when already subscribed.
    pub async fn subscribe(self: &Arc<Self>, exclusive: bool) -> Result<(), AmqpError> {
        if self.consumer.lock().is_some() {
            return Ok(());
        }

        let channel = self.channel.acquire().await?;
        let tag = info::create_tag(&self.def.name);
        let stream = channel
            .consume(
                &self.def.name,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.def.no_ack,
                    exclusive,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = self.def.name,
                    "error to declare the consumer"
                );
                AmqpError::BindingConsumerError(self.def.name.clone())
            })?;

        {
            let mut consumer = self.consumer.lock();
            if consumer.is_some() {
                // a concurrent subscribe won, its consumer stays
                tokio::spawn(async move {
                    let _ = channel.cancel(&tag).await;
                });
                return Ok(());
            }
            *consumer = Some(Consumer {
                tag: tag.clone(),
                exclusive,
            });
        }
        *self.state.lock() = QueueState::Subscribed;
        *self.resubscribe.lock() = None;
        debug!(queue = self.def.name, tag, "subscribed");

        tokio::spawn(consume(Arc::downgrade(self), stream));
        if self.batch.is_immediate() {
            self.start_flusher();
        }
        Ok(())
    }

    fn start_flusher(self: &Arc<Self>) {
        let mut flusher = self.flusher.lock();
        if flusher.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let batch = self.batch.clone();
        let queue = Arc::downgrade(self);
        *flusher = Some(tokio::spawn(async move {
            loop {
                batch.notified().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                if let Err(err) = queue.flush().await {
                    warn!(error = err.to_string(), queue = queue.def.name, "immediate flush failed");
                }
            }
        }));
    }

    /// Stops consuming. Unsettled deliveries are still flushed on the next tick.
    pub async fn unsubscribe(&self) -> Result<(), AmqpError> {
        let Some(consumer) = self.consumer.lock().take() else {
            return Ok(());
        };
        *self.state.lock() = QueueState::Ready;

        if let Some(channel) = self.channel.current() {
            channel.cancel(&consumer.tag).await.map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = self.def.name,
                    "error to cancel the consumer"
                );
                AmqpError::CancelConsumerError(self.def.name.clone())
            })?;
        }
        debug!(queue = self.def.name, "unsubscribed");
        Ok(())
    }

    /// Removes every ready message and returns how many were removed.
    ///
    /// A subscribed, non auto-delete queue stops consuming for the purge and
    /// resumes afterwards. An auto-delete queue keeps its consumer, since
    /// cancelling the last one would delete the queue.
    pub async fn purge(self: &Arc<Self>) -> Result<u32, AmqpError> {
        let previous = self
            .consumer
            .lock()
            .as_ref()
            .map(|consumer| consumer.exclusive);
        let pause = previous.is_some() && !self.def.auto_delete;
        if pause {
            self.unsubscribe().await?;
        }

        let channel = self.channel.acquire().await?;
        let purged = channel.purge_queue(&self.def.name).await.map_err(|err| {
            error!(
                error = err.to_string(),
                queue = self.def.name,
                "error to purge the queue"
            );
            AmqpError::PurgeQueueError(self.def.name.clone())
        })?;
        debug!(queue = self.def.name, purged, "queue purged");

        if let (true, Some(exclusive)) = (pause, previous) {
            self.subscribe(exclusive).await?;
        }
        Ok(purged)
    }

    async fn deliver(&self, delivery: InboundDelivery) {
        let batch = (!self.def.no_ack).then(|| self.batch.clone());
        let msg = Message::from_delivery(
            &self.def.name,
            delivery,
            &self.serializers,
            batch,
            Some(self.responder.clone()),
        );

        if let Some(replies) = &self.replies {
            if let Err(msg) = replies.deliver(msg) {
                debug!(
                    correlation_id = msg.correlation_id,
                    "reply without a pending request"
                );
            }
            return;
        }

        if let Err(err) = self.dispatcher.dispatch(&msg).await {
            error!(
                error = err.to_string(),
                queue = self.def.name,
                delivery_tag = msg.delivery_tag,
                "handler failed, message left unsettled"
            );
        }
    }

    /// Sends every recorded acknowledgment to the broker.
    pub async fn flush(&self) -> Result<(), AmqpError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let Some(channel) = self.channel.current() else {
            self.batch.reset();
            return Ok(());
        };

        for op in self.batch.drain() {
            let result = match op.status {
                AckStatus::Pending => continue,
                AckStatus::Ack => channel
                    .ack(op.delivery_tag, op.multiple)
                    .await
                    .map_err(|_| AmqpError::AckMessageError),
                AckStatus::Nack => channel
                    .nack(op.delivery_tag, op.multiple, true)
                    .await
                    .map_err(|_| AmqpError::NackMessageError),
                AckStatus::Reject if op.multiple => channel
                    .nack(op.delivery_tag, true, false)
                    .await
                    .map_err(|_| AmqpError::RejectMessageError),
                AckStatus::Reject => channel
                    .reject(op.delivery_tag, false)
                    .await
                    .map_err(|_| AmqpError::RejectMessageError),
            };

            if let Err(err) = result {
                error!(
                    error = err.to_string(),
                    queue = self.def.name,
                    delivery_tag = op.delivery_tag,
                    "error to settle message"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    /// Called when the connection drops. Remembers whether the queue was
    /// consuming so the topology replay can resume it.
    pub(crate) fn connection_lost(&self) {
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            *self.resubscribe.lock() = Some(consumer.exclusive);
        }
        if self.state() == QueueState::Subscribed {
            *self.state.lock() = QueueState::Ready;
        }
        self.batch.reset();
        self.channel.invalidate();
    }

    /// Redeclares the queue and resumes consuming when it was configured to
    /// or was consuming before the connection dropped.
    pub(crate) async fn restore(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.define().await?;
        let previous = self.resubscribe.lock().take();
        match (self.def.subscribe, previous) {
            (_, Some(exclusive)) => self.subscribe(exclusive).await,
            (true, None) => self.subscribe(self.def.exclusive).await,
            (false, None) => Ok(()),
        }
    }

    /// Deletes the queue on the broker and releases its channel.
    pub(crate) async fn destroy(&self) -> Result<u32, AmqpError> {
        if let Err(err) = self.unsubscribe().await {
            warn!(error = err.to_string(), queue = self.def.name, "unsubscribe before delete failed");
        }
        *self.state.lock() = QueueState::PendingDelete;

        let channel = self.channel.acquire().await?;
        let result = channel.delete_queue(&self.def.name).await.map_err(|err| {
            error!(error = err.to_string(), name = self.def.name, "error to delete the queue");
            AmqpError::DeleteQueueError(self.def.name.clone())
        });
        self.release().await;
        result
    }

    /// Flushes pending acknowledgments and closes the channel. A consumer is
    /// remembered so a later replay resumes it.
    pub(crate) async fn release(&self) {
        if let Err(err) = self.flush().await {
            debug!(error = err.to_string(), "final flush failed");
        }
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.abort();
        }
        if let Some(consumer) = self.consumer.lock().take() {
            *self.resubscribe.lock() = Some(consumer.exclusive);
        }
        {
            let mut state = self.state.lock();
            if *state == QueueState::Subscribed {
                *state = QueueState::Ready;
            }
        }
        self.channel.close().await;
    }
}

async fn consume(queue: Weak<Queue>, mut stream: DeliveryStream) {
    while let Some(delivery) = stream.next().await {
        let Some(queue) = queue.upgrade() else {
            break;
        };

        match delivery {
            Ok(delivery) => queue.deliver(delivery).await,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue.def.name,
                    "error receiving delivery"
                );
                break;
            }
        }
    }
    debug!("consumer stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockAmqpChannel;

    fn get<'a>(args: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
        args.inner().get(key)
    }

    #[tokio::test]
    async fn passive_queues_are_only_checked() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_check_queue().times(1).returning(|name| {
            assert_eq!(name, "q");
            Ok(4)
        });
        channel.expect_declare_queue().times(0);

        let count = define(&channel, &QueueDefinition::new("q").passive())
            .await
            .unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn active_queues_are_declared_only() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_check_queue().times(0);
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|name, options, args| {
                assert_eq!(name, "q");
                assert!(options.durable);
                assert_eq!(
                    args.inner().get(AMQP_HEADERS_QUEUE_TYPE),
                    Some(&AMQPValue::LongString(LongString::from("classic")))
                );
                Ok(0)
            });

        define(&channel, &QueueDefinition::new("q").durable())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_queues_reject_the_definition() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_check_queue()
            .returning(|_| Err(AmqpError::ChannelError("404".to_owned())));

        let err = define(&channel, &QueueDefinition::new("q").passive())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareQueueError("q".to_owned()));
    }

    #[test]
    fn classic_queues_pass_every_argument_through() {
        let def = QueueDefinition::new("q")
            .queue_limit(1000)
            .max_priority(100)
            .message_ttl(60_000)
            .dead_letter("dlx")
            .dead_letter_routing_key("dead");
        let args = arguments(&def);

        assert_eq!(
            get(&args, AMQP_HEADERS_QUEUE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("classic")))
        );
        assert_eq!(
            get(&args, AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongLongInt(1000))
        );
        assert_eq!(
            get(&args, AMQP_HEADERS_MAX_PRIORITY),
            Some(&AMQPValue::ShortShortUInt(100))
        );
        assert_eq!(
            get(&args, AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert_eq!(
            get(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("dlx")))
        );
        assert!(get(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).is_some());
    }

    #[test]
    fn quorum_queues_never_get_a_priority() {
        let def = QueueDefinition::new("q")
            .quorum()
            .queue_limit(1000)
            .max_priority(100)
            .message_ttl(5)
            .dead_letter_strategy("at-least-once");
        let args = arguments(&def);

        assert_eq!(args.inner().len(), 3);
        assert_eq!(
            get(&args, AMQP_HEADERS_QUEUE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("quorum")))
        );
        assert_eq!(
            get(&args, AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongLongInt(1000))
        );
        assert!(get(&args, AMQP_HEADERS_MAX_PRIORITY).is_none());
        assert!(get(&args, AMQP_HEADERS_DEAD_LETTER_STRATEGY).is_some());
    }

    #[test]
    fn unique_names_carry_a_suffix() {
        assert_eq!(QueueDefinition::new("q").resolved_name(), "q");
        let id = QueueDefinition::new("q").unique(UniqueName::Id).resolved_name();
        assert_eq!(id, format!("q.{}", info::consumer_id()));
        let hash = QueueDefinition::new("q")
            .unique(UniqueName::Hash)
            .resolved_name();
        assert_eq!(hash, format!("q.{}", info::consumer_hash()));
    }
}
