// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module routes consumed messages to registered handlers. Every handler
//! is registered under a topic pattern built from a queue name and a message
//! type; every message is published on the topic `<queue>.<type>`, with dots in
//! the queue name replaced by dashes so the queue stays one segment.
//!
//! Messages nobody handles go through the unhandled strategy (nack by
//! default). Messages the broker bounces back go through the returned strategy
//! (ignored by default). A failing handler nacks its message when auto-nack is
//! on; otherwise the error is handed back to the consumer loop.

use crate::{errors::AmqpError, message::Message, otel, topic};
use async_trait::async_trait;
use opentelemetry::Context;
use parking_lot::RwLock;
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error};

/// Processes messages matching a registration.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &Message) -> Result<(), AmqpError>;
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> ConsumerHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &Message) -> Result<(), AmqpError> {
        (self.0)(msg.clone()).await
    }
}

/// Wraps an async closure into a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// What a handler registration listens to.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Message type; `None` listens to every type.
    pub message_type: Option<String>,
    /// Queue name; `None` listens on every queue.
    pub queue: Option<String>,
    /// Overrides the dispatcher default.
    pub auto_nack: Option<bool>,
}

impl HandlerOptions {
    /// Messages of `message_type` on any queue.
    pub fn new(message_type: &str) -> HandlerOptions {
        HandlerOptions {
            message_type: Some(message_type.to_owned()),
            ..HandlerOptions::default()
        }
    }

    /// Every message on every queue.
    pub fn all() -> HandlerOptions {
        HandlerOptions::default()
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn auto_nack(mut self, enabled: bool) -> Self {
        self.auto_nack = Some(enabled);
        self
    }

    /// Topic pattern the registration subscribes to.
    pub fn pattern(&self) -> String {
        let queue = self.queue.clone().unwrap_or_else(|| {
            if self.message_type.is_some() { "*" } else { "#" }.to_owned()
        });
        if queue == "#" {
            return queue;
        }

        let mut parts = vec![queue.replace('.', "-")];
        match &self.message_type {
            Some(message_type) if message_type.is_empty() => {}
            Some(message_type) => parts.push(message_type.clone()),
            None => parts.push("#".to_owned()),
        }
        parts.join(".")
    }
}

/// Applied to messages no handler matched.
#[derive(Clone)]
pub enum UnhandledStrategy {
    Nack,
    Reject,
    Custom(Arc<dyn Fn(&Message) + Send + Sync>),
}

impl fmt::Debug for UnhandledStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhandledStrategy::Nack => write!(f, "Nack"),
            UnhandledStrategy::Reject => write!(f, "Reject"),
            UnhandledStrategy::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Applied to messages the broker returned as unroutable.
#[derive(Clone)]
pub enum ReturnedStrategy {
    Ignore,
    Custom(Arc<dyn Fn(&Message) + Send + Sync>),
}

#[derive(Clone)]
struct Registration {
    id: u64,
    pattern: String,
    handler: Arc<dyn ConsumerHandler>,
    auto_nack: bool,
}

/// Handler registry shared by every queue of a broker.
pub struct Dispatcher {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    unhandled: RwLock<UnhandledStrategy>,
    returned: RwLock<ReturnedStrategy>,
    auto_nack: AtomicBool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            registrations: RwLock::new(vec![]),
            next_id: AtomicU64::new(1),
            unhandled: RwLock::new(UnhandledStrategy::Nack),
            returned: RwLock::new(ReturnedStrategy::Ignore),
            auto_nack: AtomicBool::new(true),
        }
    }
}

impl Dispatcher {
    pub fn new() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::default())
    }

    /// Registers a handler and returns the handle that removes it.
    pub fn handle(
        self: &Arc<Self>,
        options: HandlerOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pattern = options.pattern();
        let auto_nack = options
            .auto_nack
            .unwrap_or_else(|| self.auto_nack.load(Ordering::SeqCst));

        debug!(pattern, auto_nack, "handler registered");
        self.registrations.write().push(Registration {
            id,
            pattern: pattern.clone(),
            handler,
            auto_nack,
        });

        Subscription {
            id,
            pattern,
            dispatcher: Arc::downgrade(self),
        }
    }

    pub fn has_handlers(&self) -> bool {
        !self.registrations.read().is_empty()
    }

    pub fn set_unhandled(&self, strategy: UnhandledStrategy) {
        *self.unhandled.write() = strategy;
    }

    pub fn unhandled(&self) -> UnhandledStrategy {
        self.unhandled.read().clone()
    }

    pub fn set_returned(&self, strategy: ReturnedStrategy) {
        *self.returned.write() = strategy;
    }

    /// Default auto-nack policy for registrations that do not set one.
    pub fn set_auto_nack(&self, enabled: bool) {
        self.auto_nack.store(enabled, Ordering::SeqCst);
    }

    fn remove(&self, id: u64) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        registrations.len() != before
    }

    /// Runs every handler whose pattern matches the message topic.
    pub async fn dispatch(&self, msg: &Message) -> Result<(), AmqpError> {
        let topic = msg.topic();
        let matched: Vec<Registration> = self
            .registrations
            .read()
            .iter()
            .filter(|registration| topic::matches(&registration.pattern, &topic))
            .cloned()
            .collect();

        if matched.is_empty() {
            debug!(topic, "no handler for message");
            match self.unhandled() {
                UnhandledStrategy::Nack => {
                    msg.nack();
                }
                UnhandledStrategy::Reject => {
                    msg.reject();
                }
                UnhandledStrategy::Custom(callback) => callback(msg),
            }
            return Ok(());
        }

        let (ctx, mut span) = otel::consumer_span(&msg.headers, &topic);
        let mut first_error = None;
        for registration in matched {
            if let Err(err) = registration.handler.exec(&ctx, msg).await {
                otel::record_failure(&mut span, &err.to_string());
                if !registration.auto_nack {
                    first_error.get_or_insert(err);
                    continue;
                }
                error!(
                    error = err.to_string(),
                    pattern = registration.pattern,
                    "handler failed, nacking message"
                );
                msg.nack();
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hands a returned message to the returned strategy.
    pub fn returned(&self, msg: &Message) {
        let strategy = self.returned.read().clone();
        if let ReturnedStrategy::Custom(callback) = strategy {
            callback(msg);
        }
    }
}

/// Removable handler registration.
pub struct Subscription {
    id: u64,
    pattern: String,
    dispatcher: Weak<Dispatcher>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Unregisters the handler. Returns false when it was already gone.
    pub fn remove(self) -> bool {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.remove(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ack::{AckBatch, AckStatus},
        serializers::SerializerRegistry,
        transport::InboundDelivery,
    };
    use lapin::{types::ShortString, BasicProperties};
    use std::sync::atomic::AtomicUsize;

    fn message(queue: &str, message_type: &str, batch: &Arc<AckBatch>) -> Message {
        let delivery = InboundDelivery {
            delivery_tag: 1,
            properties: BasicProperties::default()
                .with_type(ShortString::from(message_type))
                .with_content_type(ShortString::from("text/plain")),
            data: b"body".to_vec(),
            ..InboundDelivery::default()
        };
        Message::from_delivery(
            queue,
            delivery,
            &SerializerRegistry::default(),
            Some(batch.clone()),
            None,
        )
    }

    fn counting(calls: Arc<AtomicUsize>, fail: bool) -> Arc<dyn ConsumerHandler> {
        handler_fn(move |msg: Message| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(AmqpError::HandlerError("nope".to_owned()));
                }
                msg.ack();
                Ok(())
            }
        })
    }

    #[test]
    fn patterns_follow_queue_and_type() {
        assert_eq!(HandlerOptions::new("topic").pattern(), "*.topic");
        assert_eq!(HandlerOptions::all().pattern(), "#");
        assert_eq!(HandlerOptions::all().queue("#").pattern(), "#");
        assert_eq!(HandlerOptions::all().queue("q.one").pattern(), "q-one.#");
        assert_eq!(
            HandlerOptions::new("order.created").queue("orders.q").pattern(),
            "orders-q.order.created"
        );
        assert_eq!(HandlerOptions::new("").queue("q").pattern(), "q");
    }

    #[tokio::test]
    async fn unmatched_types_are_nacked_once_without_calling_handlers() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = dispatcher.handle(HandlerOptions::new("topic"), counting(calls.clone(), false));

        let batch = Arc::new(AckBatch::new(false));
        dispatcher
            .dispatch(&message("q", "other", &batch))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let ops = batch.drain();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, AckStatus::Nack);
    }

    #[tokio::test]
    async fn reject_and_custom_unhandled_strategies() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_unhandled(UnhandledStrategy::Reject);
        let batch = Arc::new(AckBatch::new(false));
        dispatcher.dispatch(&message("q", "x", &batch)).await.unwrap();
        assert_eq!(batch.drain()[0].status, AckStatus::Reject);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        dispatcher.set_unhandled(UnhandledStrategy::Custom(Arc::new(move |_msg: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let batch = Arc::new(AckBatch::new(false));
        dispatcher.dispatch(&message("q", "x", &batch)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(batch.pending(), 1);
    }

    #[tokio::test]
    async fn failing_handlers_nack_under_auto_nack() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = dispatcher.handle(HandlerOptions::new("topic"), counting(calls.clone(), true));

        let batch = Arc::new(AckBatch::new(false));
        dispatcher
            .dispatch(&message("q", "topic", &batch))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batch.drain()[0].status, AckStatus::Nack);
    }

    #[tokio::test]
    async fn failing_handlers_propagate_without_auto_nack() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_auto_nack(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = dispatcher.handle(HandlerOptions::new("topic"), counting(calls.clone(), true));

        let batch = Arc::new(AckBatch::new(false));
        let err = dispatcher
            .dispatch(&message("q", "topic", &batch))
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::HandlerError("nope".to_owned()));
        assert_eq!(batch.pending(), 1);
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_skip_the_others() {
        let dispatcher = Dispatcher::new();
        let failing = Arc::new(AtomicUsize::new(0));
        let passing = Arc::new(AtomicUsize::new(0));
        let _first = dispatcher.handle(
            HandlerOptions::new("topic").auto_nack(false),
            counting(failing.clone(), true),
        );
        let _second = dispatcher.handle(HandlerOptions::new("topic"), counting(passing.clone(), false));

        let batch = Arc::new(AckBatch::new(false));
        let err = dispatcher
            .dispatch(&message("q", "topic", &batch))
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::HandlerError("nope".to_owned()));
        assert_eq!(failing.load(Ordering::SeqCst), 1);
        assert_eq!(passing.load(Ordering::SeqCst), 1);
        assert_eq!(batch.drain()[0].status, AckStatus::Ack);
    }

    #[tokio::test]
    async fn removed_subscriptions_stop_receiving() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = dispatcher.handle(
            HandlerOptions::new("topic").queue("q"),
            counting(calls.clone(), false),
        );
        assert!(dispatcher.has_handlers());
        assert!(sub.remove());
        assert!(!dispatcher.has_handlers());

        let batch = Arc::new(AckBatch::new(false));
        dispatcher
            .dispatch(&message("q", "topic", &batch))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
