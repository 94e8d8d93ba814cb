// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! The application-facing entry point. A [`Broker`] owns every named
//! connection together with its topology, the handler registry shared by all
//! queues, the serializer registry and the event bus.
//!
//! ```ignore
//! let broker = Broker::new(Arc::new(LapinTransport::default()));
//! broker.configure(TopologyConfig::from_toml_str(&document)?).await?;
//!
//! let _sub = broker.handle(
//!     HandlerOptions::new("order.created"),
//!     handler_fn(|msg: Message| async move {
//!         msg.ack();
//!         Ok(())
//!     }),
//! );
//! broker
//!     .publish("orders", PublishOptions::new("order.created", Body::json(&order)?))
//!     .await?;
//! ```

use crate::{
    binding::BindingDefinition,
    config::{ConnectionOptions, TopologyConfig, DEFAULT_CONNECTION},
    connection::{Connection, ConnectionEvent, ConnectionState},
    dispatcher::{
        ConsumerHandler, Dispatcher, HandlerOptions, ReturnedStrategy, Subscription,
        UnhandledStrategy,
    },
    errors::AmqpError,
    events::{BrokerEvent, EventBus},
    exchange::{Exchange, ExchangeDefinition},
    message::Message,
    publisher::PublishOptions,
    queue::{Queue, QueueDefinition},
    request::{self, RequestOptions, TimeoutSources},
    serializers::{Serializer, SerializerRegistry},
    topology::{provision, Topology},
    transport::Transport,
};
use futures_util::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, warn};

/// Acknowledgment flush period started with the first connection.
pub const DEFAULT_ACK_INTERVAL: Duration = Duration::from_millis(500);

type Configuring = Shared<BoxFuture<'static, Result<(), AmqpError>>>;

/// Outcome of one message of a bulk publish.
#[derive(Debug, Clone)]
pub struct BulkOutcome {
    pub exchange: String,
    pub options: PublishOptions,
    pub result: Result<(), AmqpError>,
}

struct BrokerInner {
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<String, Arc<Topology>>>,
    relays: Mutex<HashMap<String, JoinHandle<()>>>,
    configurations: Mutex<HashMap<String, TopologyConfig>>,
    configuring: Mutex<HashMap<String, Configuring>>,
    dispatcher: Arc<Dispatcher>,
    serializers: Arc<SerializerRegistry>,
    events: Arc<EventBus>,
    ack_ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        for (_, relay) in self.relays.lock().drain() {
            relay.abort();
        }
        if let Some(ticker) = self.ack_ticker.lock().take() {
            ticker.abort();
        }
    }
}

/// Cheaply cloneable handle to a set of named connections.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

fn connection_name(name: &Option<String>) -> String {
    name.clone().unwrap_or_else(|| DEFAULT_CONNECTION.to_owned())
}

impl Broker {
    pub fn new(transport: Arc<dyn Transport>) -> Broker {
        Broker {
            inner: Arc::new(BrokerInner {
                transport,
                connections: Mutex::new(HashMap::new()),
                relays: Mutex::new(HashMap::new()),
                configurations: Mutex::new(HashMap::new()),
                configuring: Mutex::new(HashMap::new()),
                dispatcher: Dispatcher::new(),
                serializers: Arc::new(SerializerRegistry::default()),
                events: EventBus::new(),
                ack_ticker: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Creates the named connection on first use and connects it.
    pub async fn add_connection(
        &self,
        options: ConnectionOptions,
    ) -> Result<Arc<Topology>, AmqpError> {
        let topology = {
            let mut connections = self.inner.connections.lock();
            match connections.get(&options.name) {
                Some(topology) => topology.clone(),
                None => {
                    debug!(name = options.name, "adding connection");
                    let connection = Connection::new(options.clone(), self.inner.transport.clone());
                    let topology = Topology::new(
                        connection,
                        self.inner.dispatcher.clone(),
                        self.inner.serializers.clone(),
                    );
                    self.relay(&topology);
                    connections.insert(options.name.clone(), topology.clone());
                    topology
                }
            }
        };

        topology.connection().connect().await?;
        topology.reopen().await?;
        Ok(topology)
    }

    /// Forwards connection events to the event bus.
    fn relay(&self, topology: &Arc<Topology>) {
        let connection = topology.connection().clone();
        let name = connection.name().to_owned();
        let mut events = connection.events();
        let broker = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = broker.upgrade() else {
                    break;
                };
                let connection = name.clone();

                let event = match event {
                    ConnectionEvent::Connected => {
                        Broker::ensure_ack_ticker(&inner);
                        BrokerEvent::Connected { connection }
                    }
                    ConnectionEvent::Closed => BrokerEvent::Closed { connection },
                    ConnectionEvent::Failed(error) => BrokerEvent::Failed { connection, error },
                    ConnectionEvent::Unreachable => BrokerEvent::Unreachable { connection },
                    ConnectionEvent::Return(delivery) => {
                        let msg = Message::from_delivery(
                            "",
                            (*delivery).clone(),
                            &inner.serializers,
                            None,
                            None,
                        );
                        inner.dispatcher.returned(&msg);
                        BrokerEvent::Returned {
                            connection,
                            delivery,
                        }
                    }
                    ConnectionEvent::Blocked(reason) => BrokerEvent::Blocked { connection, reason },
                    ConnectionEvent::Unblocked => BrokerEvent::Unblocked { connection },
                };
                inner.events.emit(&event);
            }
        });

        if let Some(previous) = self.inner.relays.lock().insert(connection.name().to_owned(), handle) {
            previous.abort();
        }
    }

    fn topology(&self, name: &str) -> Result<Arc<Topology>, AmqpError> {
        self.inner
            .connections
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::NoConnection(name.to_owned()))
    }

    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.topology(name)
            .ok()
            .map(|topology| topology.connection().clone())
    }

    /// The topology once the connection is up and any configuration finished.
    async fn ready(&self, name: &str) -> Result<Arc<Topology>, AmqpError> {
        let topology = self.topology(name)?;
        let configuring = self.inner.configuring.lock().get(name).cloned();
        if let Some(configuring) = configuring {
            configuring.await?;
        }

        let connection = topology.connection();
        match connection.state() {
            ConnectionState::Closed => Err(AmqpError::ConnectionClosed(name.to_owned())),
            ConnectionState::Unreachable => Err(AmqpError::Unreachable(name.to_owned())),
            _ => {
                connection.connect().await?;
                Ok(topology)
            }
        }
    }

    /// Connects and provisions a whole topology. The configuration is kept
    /// for [`Broker::retry`].
    pub async fn configure(&self, config: TopologyConfig) -> Result<(), AmqpError> {
        let name = config.name().to_owned();
        self.inner
            .configurations
            .lock()
            .insert(name.clone(), config.clone());

        let broker = self.clone();
        let connection = name.clone();
        let configuring = async move {
            let topology = broker.add_connection(config.connection.clone()).await?;
            provision(topology.as_ref(), &config).await?;
            debug!(connection, "connection configured");
            broker
                .inner
                .events
                .emit(&BrokerEvent::Configured { connection });
            Ok(())
        }
        .boxed()
        .shared();

        self.inner
            .configuring
            .lock()
            .insert(name, configuring.clone());
        configuring.await
    }

    /// Runs the last configuration of a connection again.
    pub async fn retry(&self, name: &str) -> Result<(), AmqpError> {
        let config = self
            .inner
            .configurations
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::NoConnection(name.to_owned()))?;
        self.configure(config).await
    }

    pub async fn publish(&self, exchange: &str, options: PublishOptions) -> Result<(), AmqpError> {
        let name = connection_name(&options.connection_name);
        let topology = self.ready(&name).await?;
        let exchange = topology.on_exchange(exchange).await?;
        exchange.publish(&options).await
    }

    /// Publishes every message and reports each outcome. Fails as a whole
    /// only when the connection does not exist.
    pub async fn bulk_publish(
        &self,
        messages: Vec<(String, PublishOptions)>,
        connection: Option<&str>,
    ) -> Result<Vec<BulkOutcome>, AmqpError> {
        let name = connection.unwrap_or(DEFAULT_CONNECTION).to_owned();
        self.topology(&name)?;

        let topology = match self.ready(&name).await {
            Ok(topology) => topology,
            Err(err) => {
                return Ok(messages
                    .into_iter()
                    .map(|(exchange, options)| BulkOutcome {
                        exchange,
                        options,
                        result: Err(err.clone()),
                    })
                    .collect())
            }
        };

        let mut exchanges: HashMap<String, Result<Arc<Exchange>, AmqpError>> = HashMap::new();
        for (exchange, _) in &messages {
            if !exchanges.contains_key(exchange) {
                let resolved = topology.on_exchange(exchange).await;
                exchanges.insert(exchange.clone(), resolved);
            }
        }

        let publishes = messages.into_iter().map(|(name, options)| {
            let exchange = exchanges.get(&name).cloned();
            async move {
                let result = match exchange {
                    Some(Ok(exchange)) => exchange.publish(&options).await,
                    Some(Err(err)) => Err(err),
                    None => Err(AmqpError::InternalError),
                };
                BulkOutcome {
                    exchange: name,
                    options,
                    result,
                }
            }
        });
        Ok(join_all(publishes).await)
    }

    /// [`Broker::bulk_publish`] with messages grouped by exchange.
    pub async fn bulk_publish_grouped(
        &self,
        messages: BTreeMap<String, Vec<PublishOptions>>,
        connection: Option<&str>,
    ) -> Result<Vec<BulkOutcome>, AmqpError> {
        let flat = messages
            .into_iter()
            .flat_map(|(exchange, list)| {
                list.into_iter()
                    .map(move |options| (exchange.clone(), options))
            })
            .collect();
        self.bulk_publish(flat, connection).await
    }

    /// Publishes a request and waits for its reply (or replies).
    pub async fn request(&self, exchange: &str, options: RequestOptions) -> Result<Message, AmqpError> {
        let name = connection_name(&options.publish.connection_name);
        let topology = self.ready(&name).await?;
        let exchange = topology.on_exchange(exchange).await?;
        let reply_queue = topology.reply_queue().await?;

        let id = request::request_id();
        let mut publish = options.publish.clone();
        publish.message_id = Some(id.clone());
        publish.reply_to = Some(reply_queue.name().to_owned());

        let connection_options = topology.connection().options();
        let timeout = TimeoutSources {
            request_reply: options.reply_timeout,
            request_publish: publish.timeout,
            exchange_reply: exchange.definition().reply_timeout,
            exchange_publish: exchange.definition().publish_timeout,
            connection_reply: connection_options.reply_timeout,
            connection_publish: connection_options.publish_timeout,
        }
        .reply_timeout();

        let listener = topology.replies().listen(&id);
        exchange.publish(&publish).await?;
        debug!(id, exchange = exchange.name(), timeout, "request published");

        listener
            .collect(
                options.expect,
                Duration::from_millis(timeout),
                options.notify.clone(),
            )
            .await
    }

    /// Registers a handler for every queue of every connection.
    pub fn handle(&self, options: HandlerOptions, handler: Arc<dyn ConsumerHandler>) -> Subscription {
        self.inner.dispatcher.handle(options, handler)
    }

    /// Purges a queue and returns the number of messages removed.
    pub async fn purge_queue(&self, queue: &str, connection: Option<&str>) -> Result<u32, AmqpError> {
        let name = connection.unwrap_or(DEFAULT_CONNECTION);
        let topology = self.ready(name).await?;
        let queue = topology
            .get_queue(queue)
            .ok_or_else(|| AmqpError::NoQueue(queue.to_owned(), name.to_owned()))?;
        queue.purge().await
    }

    /// Closes a connection. `reset` also forgets its topology.
    pub async fn close(&self, name: &str, reset: bool) -> Result<(), AmqpError> {
        let Ok(topology) = self.topology(name) else {
            return Ok(());
        };

        topology.release().await;
        self.inner.configuring.lock().remove(name);
        let result = topology.connection().close().await;
        topology.closed();
        if reset {
            topology.reset();
        }
        result
    }

    pub async fn close_all(&self, reset: bool) -> Result<(), AmqpError> {
        let names: Vec<String> = self.inner.connections.lock().keys().cloned().collect();
        let results = join_all(names.iter().map(|name| self.close(name, reset))).await;
        results.into_iter().collect()
    }

    /// Closes and resets every connection and stops the acknowledgment tick.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let result = self.close_all(true).await;
        self.clear_ack_interval();
        result
    }

    /// Forgets every connection and configuration without closing them.
    pub fn reset(&self) {
        self.inner.connections.lock().clear();
        for (_, relay) in self.inner.relays.lock().drain() {
            relay.abort();
        }
        self.inner.configurations.lock().clear();
        self.inner.configuring.lock().clear();
    }

    pub fn nack_unhandled(&self) {
        self.inner.dispatcher.set_unhandled(UnhandledStrategy::Nack);
    }

    pub fn reject_unhandled(&self) {
        self.inner.dispatcher.set_unhandled(UnhandledStrategy::Reject);
    }

    pub fn on_unhandled(&self, callback: impl Fn(&Message) + Send + Sync + 'static) {
        self.inner
            .dispatcher
            .set_unhandled(UnhandledStrategy::Custom(Arc::new(callback)));
    }

    pub fn on_returned(&self, callback: impl Fn(&Message) + Send + Sync + 'static) {
        self.inner
            .dispatcher
            .set_returned(ReturnedStrategy::Custom(Arc::new(callback)));
    }

    /// Handlers registered from now on nack their message when they fail.
    pub fn nack_on_error(&self) {
        self.inner.dispatcher.set_auto_nack(true);
    }

    /// Handlers registered from now on leave failed messages unsettled.
    pub fn ignore_handler_errors(&self) {
        self.inner.dispatcher.set_auto_nack(false);
    }

    pub fn add_serializer(&self, content_type: &str, serializer: Arc<dyn Serializer>) {
        self.inner.serializers.register(content_type, serializer);
    }

    fn ensure_ack_ticker(inner: &Arc<BrokerInner>) {
        let running = inner
            .ack_ticker
            .lock()
            .as_ref()
            .is_some_and(|ticker| !ticker.is_finished());
        if !running {
            Broker::start_ack_ticker(inner, DEFAULT_ACK_INTERVAL);
        }
    }

    fn start_ack_ticker(inner: &Arc<BrokerInner>, period: Duration) {
        let weak: Weak<BrokerInner> = Arc::downgrade(inner);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Broker { inner }.batch_ack().await;
            }
        });

        if let Some(previous) = inner.ack_ticker.lock().replace(ticker) {
            previous.abort();
        }
    }

    /// Restarts the periodic acknowledgment flush with a new period.
    pub fn set_ack_interval(&self, period: Duration) {
        Broker::start_ack_ticker(&self.inner, period);
    }

    pub fn clear_ack_interval(&self) {
        if let Some(ticker) = self.inner.ack_ticker.lock().take() {
            ticker.abort();
        }
    }

    /// Flushes recorded acknowledgments of every queue now.
    pub async fn batch_ack(&self) {
        let topologies: Vec<_> = self.inner.connections.lock().values().cloned().collect();
        join_all(topologies.iter().map(|topology| topology.flush_acks())).await;
    }

    fn warn_without_handlers(&self, queue: &str) {
        if !self.inner.dispatcher.has_handlers() {
            warn!(
                queue,
                "subscription started without any handlers, messages will be lost"
            );
        }
    }

    pub async fn start_subscription(
        &self,
        queue: &str,
        exclusive: bool,
        connection: Option<&str>,
    ) -> Result<Arc<Queue>, AmqpError> {
        self.warn_without_handlers(queue);
        let name = connection.unwrap_or(DEFAULT_CONNECTION);
        let queue = self
            .topology(name)?
            .get_queue(queue)
            .ok_or_else(|| AmqpError::NoQueue(queue.to_owned(), name.to_owned()))?;
        queue.subscribe(exclusive).await?;
        Ok(queue)
    }

    pub async fn stop_subscription(
        &self,
        queue: &str,
        connection: Option<&str>,
    ) -> Result<Arc<Queue>, AmqpError> {
        let name = connection.unwrap_or(DEFAULT_CONNECTION);
        let queue = self
            .topology(name)?
            .get_queue(queue)
            .ok_or_else(|| AmqpError::NoQueue(queue.to_owned(), name.to_owned()))?;
        queue.unsubscribe().await?;
        Ok(queue)
    }

    pub async fn add_exchange(
        &self,
        def: ExchangeDefinition,
        connection: Option<&str>,
    ) -> Result<Arc<Exchange>, AmqpError> {
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.create_exchange(def).await
    }

    pub async fn add_queue(
        &self,
        def: QueueDefinition,
        connection: Option<&str>,
    ) -> Result<Arc<Queue>, AmqpError> {
        if def.subscribe {
            self.warn_without_handlers(&def.name);
        }
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.create_queue(def).await
    }

    pub async fn bind_exchange(
        &self,
        source: &str,
        target: &str,
        keys: &[&str],
        connection: Option<&str>,
    ) -> Result<(), AmqpError> {
        let def = BindingDefinition::new(source, target)
            .keys(keys.iter().copied())
            .to_exchange();
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.create_binding(def).await
    }

    pub async fn bind_queue(
        &self,
        source: &str,
        target: &str,
        keys: &[&str],
        connection: Option<&str>,
    ) -> Result<(), AmqpError> {
        let def = BindingDefinition::new(source, target)
            .keys(keys.iter().copied())
            .to_queue();
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.create_binding(def).await
    }

    pub async fn unbind_exchange(
        &self,
        source: &str,
        target: &str,
        keys: &[&str],
        connection: Option<&str>,
    ) -> Result<(), AmqpError> {
        let def = BindingDefinition::new(source, target)
            .keys(keys.iter().copied())
            .to_exchange();
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.remove_binding(def).await
    }

    pub async fn unbind_queue(
        &self,
        source: &str,
        target: &str,
        keys: &[&str],
        connection: Option<&str>,
    ) -> Result<(), AmqpError> {
        let def = BindingDefinition::new(source, target)
            .keys(keys.iter().copied())
            .to_queue();
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.remove_binding(def).await
    }

    pub async fn delete_exchange(&self, name: &str, connection: Option<&str>) -> Result<(), AmqpError> {
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.delete_exchange(name).await
    }

    pub async fn delete_queue(&self, name: &str, connection: Option<&str>) -> Result<u32, AmqpError> {
        let topology = self.topology(connection.unwrap_or(DEFAULT_CONNECTION))?;
        topology.delete_queue(name).await
    }

    pub fn get_exchange(&self, name: &str, connection: Option<&str>) -> Option<Arc<Exchange>> {
        self.topology(connection.unwrap_or(DEFAULT_CONNECTION))
            .ok()
            .and_then(|topology| topology.get_exchange(name))
    }

    pub fn get_queue(&self, name: &str, connection: Option<&str>) -> Option<Arc<Queue>> {
        self.topology(connection.unwrap_or(DEFAULT_CONNECTION))
            .ok()
            .and_then(|topology| topology.get_queue(name))
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let connections: Vec<String> = self.inner.connections.lock().keys().cloned().collect();
        f.debug_struct("Broker")
            .field("connections", &connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn operations_on_unknown_connections_fail() {
        let broker = Broker::new(Arc::new(MockTransport::new()));

        let err = broker
            .publish("ex", PublishOptions::new("t", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::NoConnection("default".to_owned()));

        let err = broker
            .bulk_publish(vec![("ex".to_owned(), PublishOptions::new("t", "x"))], None)
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::NoConnection("default".to_owned()));

        let err = broker.purge_queue("q", Some("other")).await.unwrap_err();
        assert_eq!(err, AmqpError::NoConnection("other".to_owned()));

        let err = broker.retry("default").await.unwrap_err();
        assert_eq!(err, AmqpError::NoConnection("default".to_owned()));

        broker.close("default", false).await.unwrap();
    }

    #[tokio::test]
    async fn failed_connections_fail_configure() {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .returning(|options| Err(AmqpError::ConnectionError(options.name.clone())));
        let broker = Broker::new(Arc::new(transport));

        let config = TopologyConfig::new(ConnectionOptions::default().retry_limit(0).fail_after(0));
        let err = broker.configure(config).await.unwrap_err();
        assert_eq!(err, AmqpError::Unreachable("default".to_owned()));
    }
}
