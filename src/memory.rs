// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Transport
//!
//! A process-local broker implementing the transport capabilities, so the
//! whole client can run without a RabbitMQ server. It routes through direct,
//! fanout, topic and headers exchanges, follows exchange-to-exchange bindings
//! and alternate exchanges, and keeps per-channel delivery tags with prefetch
//! accounting. Nacked messages are requeued and flagged redelivered; rejected
//! ones are dropped or dead-lettered.
//!
//! The broker side can be driven from tests: refuse connections, drop every
//! live session, block publishers and inspect queue depths.

use crate::{
    config::ConnectionOptions,
    errors::AmqpError,
    exchange::{ExchangeKind, AMQP_ARGUMENT_ALTERNATE_EXCHANGE},
    queue::{
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MAX_LENGTH,
    },
    topic,
    transport::{
        AmqpChannel, DeliveryStream, InboundDelivery, PublishOutcome, Session, SessionEvent,
        Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Destination {
    Queue(String),
    Exchange(String),
}

struct BindingEntry {
    destination: Destination,
    routing_key: String,
    arguments: FieldTable,
}

struct ExchangeEntry {
    kind: ExchangeKind,
    auto_delete: bool,
    alternate: Option<String>,
    bindings: Vec<BindingEntry>,
    was_bound: bool,
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    no_ack: bool,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

struct QueueEntry {
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    auto_delete: bool,
    had_consumer: bool,
    /// Session owning an exclusive queue.
    owner: Option<u64>,
    max_length: Option<usize>,
    dead_letter: Option<String>,
    dead_letter_routing_key: Option<String>,
}

struct Unacked {
    queue: String,
    message: Stored,
}

struct ChannelEntry {
    session: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Requeue,
    Discard,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    channels: HashMap<u64, ChannelEntry>,
    sessions: HashMap<u64, broadcast::Sender<SessionEvent>>,
    next_id: u64,
}

fn text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
        _ => None,
    }
}

fn number(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::LongLongInt(value) => u64::try_from(*value).ok(),
        AMQPValue::LongInt(value) => u64::try_from(*value).ok(),
        AMQPValue::LongUInt(value) => Some(u64::from(*value)),
        AMQPValue::ShortInt(value) => u64::try_from(*value).ok(),
        AMQPValue::ShortUInt(value) => Some(u64::from(*value)),
        AMQPValue::ShortShortUInt(value) => Some(u64::from(*value)),
        _ => None,
    }
}

fn argument<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table.inner().iter().find(|(name, _)| name.as_str() == key).map(|(_, value)| value)
}

/// `x-match` semantics of a headers exchange binding.
fn headers_match(binding: &FieldTable, headers: &FieldTable) -> bool {
    let any = argument(binding, "x-match")
        .and_then(text)
        .is_some_and(|mode| mode == "any");

    let mut required = binding
        .inner()
        .iter()
        .filter(|(key, _)| !key.as_str().starts_with("x-"))
        .map(|(key, value)| argument(headers, key.as_str()) == Some(value));

    if any {
        required.any(|matched| matched)
    } else {
        required.all(|matched| matched)
    }
}

fn binding_matches(kind: &ExchangeKind, binding: &BindingEntry, key: &str, headers: &FieldTable) -> bool {
    match kind {
        ExchangeKind::Direct => binding.routing_key == key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic::matches(&binding.routing_key, key),
        ExchangeKind::Headers => headers_match(&binding.arguments, headers),
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, exchange: &str, key: &str, headers: &FieldTable) -> Vec<String> {
        let mut queues = vec![];
        let mut visited = HashSet::new();
        self.route_into(exchange, key, headers, &mut visited, &mut queues);
        queues
    }

    /// Returns true when the exchange routed the message anywhere.
    fn route_into(
        &self,
        exchange: &str,
        key: &str,
        headers: &FieldTable,
        visited: &mut HashSet<String>,
        queues: &mut Vec<String>,
    ) -> bool {
        if !visited.insert(exchange.to_owned()) {
            return false;
        }

        if exchange == DEFAULT_EXCHANGE {
            if !self.queues.contains_key(key) {
                return false;
            }
            if !queues.iter().any(|queue| queue == key) {
                queues.push(key.to_owned());
            }
            return true;
        }

        let Some(entry) = self.exchanges.get(exchange) else {
            return false;
        };

        let mut routed = false;
        for binding in entry
            .bindings
            .iter()
            .filter(|binding| binding_matches(&entry.kind, binding, key, headers))
        {
            match &binding.destination {
                Destination::Queue(queue) => {
                    if self.queues.contains_key(queue) {
                        routed = true;
                        if !queues.contains(queue) {
                            queues.push(queue.clone());
                        }
                    }
                }
                Destination::Exchange(target) => {
                    routed |= self.route_into(target, key, headers, visited, queues);
                }
            }
        }

        if !routed {
            if let Some(alternate) = &entry.alternate {
                routed = self.route_into(alternate, key, headers, visited, queues);
            }
        }
        routed
    }

    fn enqueue(&mut self, queue: &str, message: Stored) {
        let Some(entry) = self.queues.get_mut(queue) else {
            return;
        };
        entry.ready.push_back(message);
        if let Some(max) = entry.max_length {
            while entry.ready.len() > max {
                entry.ready.pop_front();
            }
        }
    }

    /// Hands ready messages to consumers with spare prefetch capacity.
    fn pump(&mut self, name: &str) {
        let State {
            queues, channels, ..
        } = self;

        loop {
            let Some(queue) = queues.get_mut(name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|index| {
                    let consumer = &queue.consumers[*index];
                    channels.get(&consumer.channel).is_some_and(|channel| {
                        consumer.no_ack
                            || channel.prefetch == 0
                            || channel.unacked.len() < usize::from(channel.prefetch)
                    })
                });
            let Some(index) = chosen else {
                return;
            };
            queue.next_consumer = (index + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let no_ack = queue.consumers[index].no_ack;
            let Some(channel) = channels.get_mut(&queue.consumers[index].channel) else {
                queue.ready.push_front(message);
                return;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = InboundDelivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };

            if queue.consumers[index].sender.send(Ok(delivery)).is_err() {
                // the consumer stream was dropped
                queue.ready.push_front(message);
                queue.consumers.remove(index);
                queue.next_consumer = 0;
                continue;
            }
            if !no_ack {
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: name.to_owned(),
                        message,
                    },
                );
            }
        }
    }

    fn pump_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.pump(&name);
        }
    }

    fn settle(&mut self, channel: u64, tag: u64, multiple: bool, outcome: Settle) -> bool {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return false;
        };
        let tags: Vec<u64> = if multiple {
            entry.unacked.range(..=tag).map(|(tag, _)| *tag).collect()
        } else {
            entry.unacked.get(&tag).map(|_| tag).into_iter().collect()
        };
        if tags.is_empty() {
            return false;
        }

        let settled: Vec<Unacked> = tags
            .iter()
            .filter_map(|tag| entry.unacked.remove(tag))
            .collect();

        match outcome {
            Settle::Ack => {}
            Settle::Requeue => self.requeue(settled),
            Settle::Discard => {
                for Unacked { queue, message } in settled {
                    self.dead_letter(&queue, message);
                }
            }
        }
        self.pump_all();
        true
    }

    /// Puts messages back at the head of their queues, in delivery order.
    fn requeue(&mut self, messages: Vec<Unacked>) {
        for Unacked { queue, mut message } in messages.into_iter().rev() {
            if let Some(entry) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                entry.ready.push_front(message);
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, message: Stored) {
        let Some(entry) = self.queues.get(queue) else {
            return;
        };
        let Some(exchange) = entry.dead_letter.clone() else {
            return;
        };
        let key = entry
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());
        let headers = message.properties.headers().clone().unwrap_or_default();

        for target in self.route(&exchange, &key, &headers) {
            let mut message = message.clone();
            message.redelivered = false;
            self.enqueue(&target, message);
        }
    }

    fn remove_consumer(&mut self, channel: u64, tag: &str) -> bool {
        let mut emptied = None;
        let mut found = false;
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|consumer| !(consumer.channel == channel && consumer.tag == tag));
            if queue.consumers.len() != before {
                found = true;
                if queue.auto_delete && queue.had_consumer && queue.consumers.is_empty() {
                    emptied = Some(name.clone());
                }
                break;
            }
        }

        if let Some(name) = emptied {
            debug!(queue = name, "auto-delete queue lost its last consumer");
            self.delete_queue(&name);
        }
        found
    }

    fn delete_queue(&mut self, name: &str) -> Option<u32> {
        let queue = self.queues.remove(name)?;
        let destination = Destination::Queue(name.to_owned());
        for exchange in self.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|binding| binding.destination != destination);
        }
        self.prune_exchanges();
        Some(queue.ready.len() as u32)
    }

    fn delete_exchange(&mut self, name: &str) {
        self.exchanges.remove(name);
        let destination = Destination::Exchange(name.to_owned());
        for exchange in self.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|binding| binding.destination != destination);
        }
    }

    /// Drops auto-delete exchanges whose last binding is gone.
    fn prune_exchanges(&mut self) {
        self.exchanges.retain(|name, exchange| {
            let keep = !(exchange.auto_delete && exchange.was_bound && exchange.bindings.is_empty());
            if !keep {
                debug!(exchange = name, "auto-delete exchange lost its last binding");
            }
            keep
        });
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };

        let tags: Vec<String> = self
            .queues
            .values()
            .flat_map(|queue| queue.consumers.iter())
            .filter(|consumer| consumer.channel == id)
            .map(|consumer| consumer.tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(id, &tag);
        }

        self.requeue(channel.unacked.into_values().collect());
        self.pump_all();
    }

    fn close_session(&mut self, id: u64) -> Option<broadcast::Sender<SessionEvent>> {
        let events = self.sessions.remove(&id)?;
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.session == id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
        Some(events)
    }
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    published: AtomicU64,
    refuse: AtomicU32,
    offline: AtomicBool,
}

/// Process-local broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Refuses the next `attempts` connection attempts.
    pub fn fail_next_connects(&self, attempts: u32) {
        self.counters.refuse.store(attempts, Ordering::SeqCst);
    }

    /// Refuses every connection attempt while set.
    pub fn set_offline(&self, offline: bool) {
        self.counters.offline.store(offline, Ordering::SeqCst);
    }

    /// Closes every live session from the broker side, as a network failure would.
    pub fn drop_connections(&self) {
        let dropped: Vec<broadcast::Sender<SessionEvent>> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state.sessions.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.close_session(id))
                .collect()
        };
        debug!(sessions = dropped.len(), "dropping connections");
        for events in dropped {
            let _ = events.send(SessionEvent::Closed("connection reset by broker".to_owned()));
        }
    }

    pub fn block(&self, reason: &str) {
        self.broadcast(SessionEvent::Blocked(reason.to_owned()));
    }

    pub fn unblock(&self) {
        self.broadcast(SessionEvent::Unblocked);
    }

    fn broadcast(&self, event: SessionEvent) {
        let senders: Vec<_> = self.state.lock().sessions.values().cloned().collect();
        for events in senders {
            let _ = events.send(event.clone());
        }
    }

    /// Successful connection attempts so far.
    pub fn connects(&self) -> u64 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Messages accepted by any exchange so far.
    pub fn published(&self) -> u64 {
        self.counters.published.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Ready messages of a queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|queue| queue.ready.len())
    }

    /// Delivered but unsettled messages of a queue.
    pub fn unacked(&self, name: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|unacked| unacked.queue == name)
            .count()
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// `(target, routing key)` of every binding whose source is `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map(|entry| {
                entry
                    .bindings
                    .iter()
                    .map(|binding| {
                        let target = match &binding.destination {
                            Destination::Queue(name) | Destination::Exchange(name) => name.clone(),
                        };
                        (target, binding.routing_key.clone())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Session>, AmqpError> {
        let refused = self.counters.offline.load(Ordering::SeqCst)
            || self
                .counters
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if refused {
            debug!(name = options.name, "memory broker refused the connection");
            return Err(AmqpError::ConnectionError(options.name.clone()));
        }

        let (events, _) = broadcast::channel(16);
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id();
            state.sessions.insert(id, events.clone());
            id
        };
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        debug!(name = options.name, session = id, "memory session opened");

        Ok(Arc::new(MemorySession {
            id,
            broker: self.clone(),
            events,
        }))
    }
}

pub struct MemorySession {
    id: u64,
    broker: MemoryBroker,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_channel(&self, _confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.broker.state.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(AmqpError::ChannelError(format!("session {}", self.id)));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                session: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            session: self.id,
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().sessions.contains_key(&self.id)
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().close_session(self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    session: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn state(&self) -> Result<parking_lot::MutexGuard<'_, State>, AmqpError> {
        let state = self.broker.state.lock();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(AmqpError::ChannelError(format!("channel {}", self.id)))
        }
    }

    fn bind(
        &self,
        source: &str,
        destination: Destination,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        let target_exists = match &destination {
            Destination::Queue(name) => state.queues.contains_key(name),
            Destination::Exchange(name) => state.exchanges.contains_key(name),
        };
        let failure = |destination: &Destination| match destination {
            Destination::Queue(name) => {
                AmqpError::BindingExchangeToQueueError(source.to_owned(), name.clone())
            }
            Destination::Exchange(name) => {
                AmqpError::BindingExchangeToExchangeError(source.to_owned(), name.clone())
            }
        };
        if !target_exists {
            return Err(failure(&destination));
        }
        let Some(exchange) = state.exchanges.get_mut(source) else {
            return Err(failure(&destination));
        };

        let exists = exchange.bindings.iter().any(|binding| {
            binding.destination == destination
                && binding.routing_key == routing_key
                && binding.arguments == arguments
        });
        if !exists {
            exchange.bindings.push(BindingEntry {
                destination,
                routing_key: routing_key.to_owned(),
                arguments,
            });
            exchange.was_bound = true;
        }
        Ok(())
    }

    fn unbind(&self, source: &str, destination: Destination, routing_key: &str) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        if let Some(exchange) = state.exchanges.get_mut(source) {
            exchange.bindings.retain(|binding| {
                !(binding.destination == destination && binding.routing_key == routing_key)
            });
        }
        state.prune_exchanges();
        Ok(())
    }

    fn settle(&self, tag: u64, multiple: bool, outcome: Settle) -> bool {
        self.broker
            .state
            .lock()
            .settle(self.id, tag, multiple, outcome)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.state.lock().channels.contains_key(&self.id)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        if options.passive {
            return self.check_exchange(name).await;
        }

        let mut state = self.state()?;
        let existing = state.exchanges.get(name).map(|entry| entry.kind.clone());
        match existing {
            Some(existing) if existing != *kind => {
                debug!(exchange = name, "exchange redeclared with another kind");
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_owned(),
                    ExchangeEntry {
                        kind: kind.clone(),
                        auto_delete: options.auto_delete,
                        alternate: argument(&arguments, AMQP_ARGUMENT_ALTERNATE_EXCHANGE).and_then(text),
                        bindings: vec![],
                        was_bound: false,
                    },
                );
                Ok(())
            }
        }
    }

    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let state = self.state()?;
        if name == DEFAULT_EXCHANGE || state.exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(AmqpError::DeclareExchangeError(name.to_owned()))
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.state()?.delete_exchange(name);
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<u32, AmqpError> {
        if options.passive {
            return self.check_queue(name).await;
        }

        let mut state = self.state()?;
        if let Some(existing) = state.queues.get(name) {
            return match existing.owner {
                Some(owner) if owner != self.session => {
                    debug!(queue = name, "queue is exclusive to another connection");
                    Err(AmqpError::DeclareQueueError(name.to_owned()))
                }
                _ => Ok(existing.ready.len() as u32),
            };
        }

        state.queues.insert(
            name.to_owned(),
            QueueEntry {
                ready: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
                auto_delete: options.auto_delete,
                had_consumer: false,
                owner: options.exclusive.then_some(self.session),
                max_length: argument(&arguments, AMQP_HEADERS_MAX_LENGTH)
                    .and_then(number)
                    .and_then(|max| usize::try_from(max).ok()),
                dead_letter: argument(&arguments, AMQP_HEADERS_DEAD_LETTER_EXCHANGE).and_then(text),
                dead_letter_routing_key: argument(&arguments, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                    .and_then(text),
            },
        );
        Ok(0)
    }

    async fn check_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.state()?
            .queues
            .get(name)
            .map(|queue| queue.ready.len() as u32)
            .ok_or_else(|| AmqpError::DeclareQueueError(name.to_owned()))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        Ok(self.state()?.delete_queue(name).unwrap_or(0))
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let mut state = self.state()?;
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| AmqpError::PurgeQueueError(name.to_owned()))?;
        let purged = queue.ready.len() as u32;
        queue.ready.clear();
        Ok(purged)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.bind(exchange, Destination::Queue(queue.to_owned()), routing_key, arguments)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.unbind(exchange, Destination::Queue(queue.to_owned()), routing_key)
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.bind(
            source,
            Destination::Exchange(destination.to_owned()),
            routing_key,
            arguments,
        )
    }

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.unbind(source, Destination::Exchange(destination.to_owned()), routing_key)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch;
        }
        state.pump_all();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError> {
        let mut state = self.state()?;
        if exchange != DEFAULT_EXCHANGE && !state.exchanges.contains_key(exchange) {
            debug!(exchange, "publish to a missing exchange");
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        }
        self.broker.counters.published.fetch_add(1, Ordering::SeqCst);

        let headers = properties.headers().clone().unwrap_or_default();
        let targets = state.route(exchange, routing_key, &headers);
        if targets.is_empty() {
            if options.mandatory {
                return Ok(PublishOutcome::Returned(Box::new(InboundDelivery {
                    delivery_tag: 0,
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    properties,
                    data: payload,
                })));
            }
            return Ok(PublishOutcome::Ack);
        }

        let message = Stored {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: payload,
            redelivered: false,
        };
        for target in targets {
            state.enqueue(&target, message.clone());
            state.pump(&target);
        }
        Ok(PublishOutcome::Ack)
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        if self.settle(delivery_tag, multiple, Settle::Ack) {
            Ok(())
        } else {
            Err(AmqpError::AckMessageError)
        }
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Discard };
        if self.settle(delivery_tag, multiple, outcome) {
            Ok(())
        } else {
            Err(AmqpError::NackMessageError)
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Discard };
        if self.settle(delivery_tag, false, outcome) {
            Ok(())
        } else {
            Err(AmqpError::RejectMessageError)
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.state()?;
            let tag = if consumer_tag.is_empty() {
                format!("amq.ctag-{}", state.next_id())
            } else {
                consumer_tag.to_owned()
            };

            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;
            let blocked = entry.consumers.iter().any(|consumer| consumer.exclusive)
                || (options.exclusive && !entry.consumers.is_empty())
                || entry.consumers.iter().any(|consumer| consumer.tag == tag);
            if blocked {
                debug!(queue, "consumer refused");
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            }

            entry.consumers.push(ConsumerEntry {
                tag,
                channel: self.id,
                no_ack: options.no_ack,
                exclusive: options.exclusive,
                sender,
            });
            entry.had_consumer = true;
            state.pump(queue);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.state()?.remove_consumer(self.id, consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{LongString, ShortString};

    async fn channel(broker: &MemoryBroker) -> Arc<dyn AmqpChannel> {
        let session = broker.connect(&ConnectionOptions::default()).await.unwrap();
        session.create_channel(true).await.unwrap()
    }

    async fn exchange(channel: &Arc<dyn AmqpChannel>, name: &str, kind: ExchangeKind) {
        channel
            .declare_exchange(name, &kind, ExchangeDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
    }

    async fn queue(channel: &Arc<dyn AmqpChannel>, name: &str) {
        channel
            .declare_queue(name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
    }

    async fn publish(channel: &Arc<dyn AmqpChannel>, exchange: &str, key: &str) -> PublishOutcome {
        channel
            .publish(
                exchange,
                key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                key.as_bytes().to_vec(),
                BasicProperties::default(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn topic_exchanges_route_by_pattern() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        exchange(&channel, "topics", ExchangeKind::Topic).await;
        queue(&channel, "q").await;
        channel
            .bind_queue("q", "topics", "this.is.#", FieldTable::default())
            .await
            .unwrap();

        publish(&channel, "topics", "this.is.a.test").await;
        publish(&channel, "topics", "this.is.sparta").await;
        let outcome = publish(&channel, "topics", "that.is.not").await;

        assert!(matches!(outcome, PublishOutcome::Returned(_)));
        assert_eq!(broker.queue_depth("q"), Some(2));
        assert_eq!(channel.purge_queue("q").await.unwrap(), 2);
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn alternate_exchanges_catch_unroutable_messages() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        exchange(&channel, "fallback", ExchangeKind::Fanout).await;
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from(AMQP_ARGUMENT_ALTERNATE_EXCHANGE),
            AMQPValue::LongString(LongString::from("fallback")),
        );
        channel
            .declare_exchange("main", &ExchangeKind::Direct, ExchangeDeclareOptions::default(), args)
            .await
            .unwrap();
        queue(&channel, "unrouted").await;
        channel
            .bind_queue("unrouted", "fallback", "", FieldTable::default())
            .await
            .unwrap();

        let outcome = publish(&channel, "main", "nobody").await;
        assert!(matches!(outcome, PublishOutcome::Ack));
        assert_eq!(broker.queue_depth("unrouted"), Some(1));
    }

    #[tokio::test]
    async fn headers_exchanges_honour_x_match() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        exchange(&channel, "h", ExchangeKind::Headers).await;
        queue(&channel, "all").await;
        queue(&channel, "any").await;

        let mut all = FieldTable::default();
        all.insert(ShortString::from("a"), AMQPValue::LongString(LongString::from("1")));
        all.insert(ShortString::from("b"), AMQPValue::LongString(LongString::from("2")));
        let mut any = all.clone();
        any.insert(ShortString::from("x-match"), AMQPValue::LongString(LongString::from("any")));
        channel.bind_queue("all", "h", "", all).await.unwrap();
        channel.bind_queue("any", "h", "", any).await.unwrap();

        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("a"), AMQPValue::LongString(LongString::from("1")));
        channel
            .publish(
                "h",
                "",
                BasicPublishOptions::default(),
                vec![],
                BasicProperties::default().with_headers(headers),
            )
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("all"), Some(0));
        assert_eq!(broker.queue_depth("any"), Some(1));
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries_and_nack_requeues() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        queue(&channel, "work").await;
        channel.qos(1).await.unwrap();
        for key in ["one", "two"] {
            channel
                .publish("", "work", BasicPublishOptions::default(), key.into(), BasicProperties::default())
                .await
                .unwrap();
        }

        let mut deliveries = channel
            .consume("work", "c1", BasicConsumeOptions::default())
            .await
            .unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"one");
        assert_eq!(broker.queue_depth("work"), Some(1));
        assert_eq!(broker.unacked("work"), 1);

        channel.nack(first.delivery_tag, false, true).await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.data, b"one");
        assert!(again.redelivered);

        channel.ack(again.delivery_tag, false).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"two");
        assert!(channel.ack(again.delivery_tag, false).await.is_err());
    }

    #[tokio::test]
    async fn auto_delete_queues_go_with_their_last_consumer() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue(
                "temp",
                QueueDeclareOptions {
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .unwrap();
        let _deliveries = channel
            .consume("temp", "c1", BasicConsumeOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.consumer_count("temp"), 1);

        channel.cancel("c1").await.unwrap();
        assert!(!broker.has_queue("temp"));
    }

    #[tokio::test]
    async fn dropped_connections_requeue_unacked_messages() {
        let broker = MemoryBroker::new();
        let session = broker.connect(&ConnectionOptions::default()).await.unwrap();
        let mut events = session.events();
        let channel = session.create_channel(false).await.unwrap();
        queue(&channel, "work").await;
        channel
            .publish("", "work", BasicPublishOptions::default(), vec![1], BasicProperties::default())
            .await
            .unwrap();
        let mut deliveries = channel
            .consume("work", "c1", BasicConsumeOptions::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap();

        broker.drop_connections();

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Closed(_)));
        assert!(!session.is_open());
        assert!(!channel.is_open());
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_depth("work"), Some(1));
    }

    #[tokio::test]
    async fn refused_connections_are_counted_down() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let options = ConnectionOptions::default();
        assert!(broker.connect(&options).await.is_err());
        assert!(broker.connect(&options).await.is_err());
        assert!(broker.connect(&options).await.is_ok());
        assert_eq!(broker.connects(), 1);
    }
}
