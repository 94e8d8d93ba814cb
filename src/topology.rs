// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! A [`Topology`] is the per-connection registry of exchanges, queues and
//! bindings. Every item is provisioned once; its completion is memoized as a
//! shared future keyed `exchange:<name>` or `queue:<name>`, so publishers and
//! subscribers can wait on the item they need.
//!
//! Provisioning happens in stages: every exchange, then every queue, then
//! every binding. Items of one stage are provisioned concurrently and the
//! first failure aborts the remaining stages. Nothing is rolled back.
//!
//! When the connection recovers from a transient failure the whole registry is
//! replayed in the same stage order. Queues that are configured to subscribe,
//! or that were consuming when the connection dropped, resume consuming.

use crate::{
    binding::{self, BindingDefinition},
    config::{ReplyQueue, TopologyConfig},
    connection::{Connection, ConnectionEvent},
    dispatcher::Dispatcher,
    errors::AmqpError,
    exchange::{Exchange, ExchangeDefinition},
    info,
    queue::{Queue, QueueDefinition},
    request::RequestCoordinator,
    resource::Resilient,
    serializers::SerializerRegistry,
    transport::AmqpChannel,
};
use async_trait::async_trait;
use futures_util::{
    future::{join_all, try_join_all, BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, error, warn};

type Promise = Shared<BoxFuture<'static, Result<(), AmqpError>>>;

const CONTROL_CHANNEL: &str = "control";

/// Staged provisioning of a topology.
///
/// The topology implements it for real; tests mock it to observe the order in
/// which stages run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn configure_exchanges(&self, defs: Vec<ExchangeDefinition>) -> Result<(), AmqpError>;

    async fn configure_queues(&self, defs: Vec<QueueDefinition>) -> Result<(), AmqpError>;

    async fn configure_bindings(
        &self,
        defs: Vec<BindingDefinition>,
        connection: String,
    ) -> Result<(), AmqpError>;
}

/// Provisions exchanges, then queues, then bindings.
pub async fn provision(
    provisioner: &dyn Provisioner,
    config: &TopologyConfig,
) -> Result<(), AmqpError> {
    let name = config.name();

    provisioner
        .configure_exchanges(config.exchanges.clone())
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                connection = name,
                "configuration failed due to an error in one or more exchange settings"
            );
            err
        })?;

    provisioner
        .configure_queues(config.queues.clone())
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                connection = name,
                "configuration failed due to an error in one or more queue settings"
            );
            err
        })?;

    provisioner
        .configure_bindings(config.bindings.clone(), name.to_owned())
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                connection = name,
                "configuration failed due to an error in one or more bindings"
            );
            err
        })
}

#[derive(Clone)]
struct BoundEntry {
    def: BindingDefinition,
    to_queue: bool,
}

/// Registry of everything declared on one connection.
pub struct Topology {
    connection: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    serializers: Arc<SerializerRegistry>,
    replies: Arc<RequestCoordinator>,
    control: Arc<Resilient<dyn AmqpChannel>>,
    exchanges: Mutex<HashMap<String, Arc<Exchange>>>,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    /// Declared name of every `unique` queue, keyed by its configured name.
    aliases: Mutex<HashMap<String, String>>,
    bindings: Mutex<BTreeMap<String, BoundEntry>>,
    promises: Mutex<HashMap<String, Promise>>,
    reply_queue: Mutex<Option<Arc<Queue>>>,
    recovering: AtomicBool,
    reopened: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Topology {
    pub fn new(
        connection: Arc<Connection>,
        dispatcher: Arc<Dispatcher>,
        serializers: Arc<SerializerRegistry>,
    ) -> Arc<Topology> {
        let control = connection.channel(CONTROL_CHANNEL, false);
        let topology = Arc::new(Topology {
            connection,
            dispatcher,
            serializers,
            replies: RequestCoordinator::new(),
            control,
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            bindings: Mutex::new(BTreeMap::new()),
            promises: Mutex::new(HashMap::new()),
            reply_queue: Mutex::new(None),
            recovering: AtomicBool::new(false),
            reopened: AtomicBool::new(false),
            watcher: Mutex::new(None),
        });
        topology.watch();
        topology
    }

    fn watch(self: &Arc<Self>) {
        let mut events = self.connection.events();
        let weak: Weak<Topology> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Some(topology) = weak.upgrade() else {
                    break;
                };

                match event {
                    ConnectionEvent::Failed(_) => topology.connection_lost(),
                    ConnectionEvent::Connected
                        if topology.recovering.swap(false, Ordering::SeqCst) =>
                    {
                        if let Err(err) = topology.replay().await {
                            error!(
                                error = err.to_string(),
                                connection = topology.connection.name(),
                                "failure to restore the topology"
                            );
                        }
                    }
                    _ => {}
                }
            }
        });
        *self.watcher.lock() = Some(handle);
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn replies(&self) -> &Arc<RequestCoordinator> {
        &self.replies
    }

    fn connection_lost(&self) {
        self.recovering.store(true, Ordering::SeqCst);
        for queue in self.queues.lock().values() {
            queue.connection_lost();
        }
        for exchange in self.exchanges.lock().values() {
            exchange.channel().invalidate();
        }
    }

    /// Called after an explicit close. Every item is declared again by the
    /// next `configure`, and [`Topology::reopen`] replays the registry.
    pub(crate) fn closed(&self) {
        self.promises.lock().clear();
        self.reopened.store(true, Ordering::SeqCst);
    }

    /// Replays the registry once after an explicit close.
    pub(crate) async fn reopen(&self) -> Result<(), AmqpError> {
        if self.reopened.swap(false, Ordering::SeqCst) {
            self.replay().await?;
        }
        Ok(())
    }

    /// Declared name of a queue, following `unique` renames.
    pub fn resolve_queue(&self, name: &str) -> String {
        self.aliases
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_owned())
    }

    fn resolve_target(&self, mut def: BindingDefinition) -> BindingDefinition {
        if def.queue != Some(false) {
            def.target = self.resolve_queue(&def.target);
        }
        def
    }

    /// Redeclares everything in stage order.
    pub async fn replay(&self) -> Result<(), AmqpError> {
        debug!(connection = self.connection.name(), "replaying topology");

        let exchanges: Vec<_> = self.exchanges.lock().values().cloned().collect();
        try_join_all(exchanges.iter().map(|exchange| exchange.define())).await?;

        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        try_join_all(queues.iter().map(|queue| queue.restore())).await?;

        let bindings: Vec<_> = self.bindings.lock().values().cloned().collect();
        let control = self.control.acquire().await?;
        try_join_all(
            bindings
                .iter()
                .map(|entry| binding::bind(control.as_ref(), &entry.def, entry.to_queue)),
        )
        .await?;
        Ok(())
    }

    /// Declares an exchange once; later calls share the first outcome.
    pub async fn create_exchange(&self, def: ExchangeDefinition) -> Result<Arc<Exchange>, AmqpError> {
        let key = format!("exchange:{}", def.name);
        let (exchange, promise) = {
            let mut exchanges = self.exchanges.lock();
            let exchange = exchanges
                .entry(def.name.clone())
                .or_insert_with(|| {
                    Exchange::new(def.clone(), self.connection.clone(), self.serializers.clone())
                })
                .clone();
            let promise = self
                .promises
                .lock()
                .entry(key.clone())
                .or_insert_with(|| {
                    let exchange = exchange.clone();
                    async move { exchange.define().await }.boxed().shared()
                })
                .clone();
            (exchange, promise)
        };

        if let Err(err) = promise.await {
            self.forget(&key);
            self.exchanges.lock().remove(&def.name);
            return Err(err);
        }
        Ok(exchange)
    }

    /// Declares a queue once, subscribing it when the definition asks to.
    pub async fn create_queue(&self, def: QueueDefinition) -> Result<Arc<Queue>, AmqpError> {
        self.register_queue(def, None).await
    }

    async fn register_queue(
        &self,
        mut def: QueueDefinition,
        replies: Option<Arc<RequestCoordinator>>,
    ) -> Result<Arc<Queue>, AmqpError> {
        let configured = def.name.clone();
        def.name = def.resolved_name();
        def.unique = None;
        if def.name != configured {
            self.aliases.lock().insert(configured, def.name.clone());
        }

        let key = format!("queue:{}", def.name);
        let (queue, promise) = {
            let mut queues = self.queues.lock();
            let queue = queues
                .entry(def.name.clone())
                .or_insert_with(|| {
                    Queue::new(
                        def.clone(),
                        self.connection.clone(),
                        self.dispatcher.clone(),
                        replies,
                        self.serializers.clone(),
                    )
                })
                .clone();
            let promise = self
                .promises
                .lock()
                .entry(key.clone())
                .or_insert_with(|| {
                    let queue = queue.clone();
                    async move {
                        queue.define().await?;
                        if queue.definition().subscribe {
                            queue.subscribe(queue.definition().exclusive).await?;
                        }
                        Ok(())
                    }
                    .boxed()
                    .shared()
                })
                .clone();
            (queue, promise)
        };

        if let Err(err) = promise.await {
            self.forget(&key);
            self.queues.lock().remove(&def.name);
            return Err(err);
        }
        Ok(queue)
    }

    fn is_queue(&self, name: &str) -> bool {
        self.queues.lock().contains_key(name)
    }

    /// Binds once per binding id, after both ends are provisioned.
    pub async fn create_binding(&self, def: BindingDefinition) -> Result<(), AmqpError> {
        let def = self.resolve_target(def);
        let to_queue = def.queue.unwrap_or_else(|| self.is_queue(&def.target));
        let key = format!("binding:{}", def.id());

        let promise = {
            let mut promises = self.promises.lock();
            match promises.get(&key) {
                Some(promise) => promise.clone(),
                None => {
                    let target_key = if to_queue {
                        format!("queue:{}", def.target)
                    } else {
                        format!("exchange:{}", def.target)
                    };
                    let dependencies: Vec<Promise> = [format!("exchange:{}", def.exchange), target_key]
                        .iter()
                        .filter_map(|key| promises.get(key).cloned())
                        .collect();
                    let control = self.control.clone();
                    let binding = def.clone();

                    let promise = async move {
                        try_join_all(dependencies).await?;
                        let channel = control.acquire().await?;
                        binding::bind(channel.as_ref(), &binding, to_queue).await
                    }
                    .boxed()
                    .shared();
                    promises.insert(key.clone(), promise.clone());
                    promise
                }
            }
        };

        match promise.await {
            Ok(()) => {
                self.bindings
                    .lock()
                    .insert(def.id(), BoundEntry { def, to_queue });
                Ok(())
            }
            Err(err) => {
                self.forget(&key);
                Err(err)
            }
        }
    }

    /// Unbinds and drops the binding from the registry.
    pub async fn remove_binding(&self, def: BindingDefinition) -> Result<(), AmqpError> {
        let def = self.resolve_target(def);
        let to_queue = def.queue.unwrap_or_else(|| self.is_queue(&def.target));
        let channel = self.control.acquire().await?;
        binding::unbind(channel.as_ref(), &def, to_queue).await?;

        self.bindings.lock().remove(&def.id());
        self.forget(&format!("binding:{}", def.id()));
        Ok(())
    }

    /// Deletes an exchange and drops it from the registry.
    pub async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.forget(&format!("exchange:{name}"));
        let exchange = self.exchanges.lock().remove(name);
        match exchange {
            Some(exchange) => exchange.destroy().await,
            None => {
                let channel = self.control.acquire().await?;
                channel.delete_exchange(name).await.map_err(|err| {
                    error!(error = err.to_string(), name, "error to delete the exchange");
                    AmqpError::DeleteExchangeError(name.to_owned())
                })
            }
        }
    }

    /// Deletes a queue and drops it from the registry. Returns the number of
    /// messages deleted with it.
    pub async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let name = &self.resolve_queue(name);
        self.aliases.lock().retain(|_, declared| *declared != *name);
        self.forget(&format!("queue:{name}"));
        let queue = self.queues.lock().remove(name);
        match queue {
            Some(queue) => queue.destroy().await,
            None => {
                let channel = self.control.acquire().await?;
                channel.delete_queue(name).await.map_err(|err| {
                    error!(error = err.to_string(), name, "error to delete the queue");
                    AmqpError::DeleteQueueError(name.to_owned())
                })
            }
        }
    }

    fn forget(&self, key: &str) {
        self.promises.lock().remove(key);
    }

    pub async fn configure_exchanges(&self, defs: Vec<ExchangeDefinition>) -> Result<(), AmqpError> {
        try_join_all(defs.into_iter().map(|def| self.create_exchange(def)))
            .await
            .map(|_| ())
    }

    pub async fn configure_queues(&self, defs: Vec<QueueDefinition>) -> Result<(), AmqpError> {
        try_join_all(defs.into_iter().map(|def| self.create_queue(def)))
            .await
            .map(|_| ())
    }

    pub async fn configure_bindings(
        &self,
        defs: Vec<BindingDefinition>,
        connection: &str,
    ) -> Result<(), AmqpError> {
        debug!(connection, bindings = defs.len(), "configuring bindings");
        try_join_all(defs.into_iter().map(|def| self.create_binding(def)))
            .await
            .map(|_| ())
    }

    pub fn get_exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.lock().get(name).cloned()
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        let name = self.resolve_queue(name);
        self.queues.lock().get(&name).cloned()
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.lock().values().cloned().collect()
    }

    /// Waits for an exchange that is being (or was) provisioned.
    pub async fn on_exchange(&self, name: &str) -> Result<Arc<Exchange>, AmqpError> {
        let promise = self.promises.lock().get(&format!("exchange:{name}")).cloned();
        if let Some(promise) = promise {
            promise.await?;
        }
        self.get_exchange(name).ok_or_else(|| {
            AmqpError::NoExchange(name.to_owned(), self.connection.name().to_owned())
        })
    }

    /// Waits for a queue that is being (or was) provisioned.
    pub async fn on_queue(&self, name: &str) -> Result<Arc<Queue>, AmqpError> {
        let name = &self.resolve_queue(name);
        let promise = self.promises.lock().get(&format!("queue:{name}")).cloned();
        if let Some(promise) = promise {
            promise.await?;
        }
        self.get_queue(name)
            .ok_or_else(|| AmqpError::NoQueue(name.to_owned(), self.connection.name().to_owned()))
    }

    /// Name of the reply queue for this connection, if it has one.
    pub fn reply_queue_name(&self) -> Option<String> {
        match &self.connection.options().reply_queue {
            ReplyQueue::Generated => Some(format!("{}.response.queue", info::consumer_id())),
            ReplyQueue::Named(name) => Some(name.clone()),
            ReplyQueue::Disabled => None,
        }
    }

    /// Creates (once) and returns the consuming reply queue.
    pub async fn reply_queue(&self) -> Result<Arc<Queue>, AmqpError> {
        if let Some(queue) = self.reply_queue.lock().clone() {
            return Ok(queue);
        }
        let Some(name) = self.reply_queue_name() else {
            return Err(AmqpError::NoReplyQueue(self.connection.name().to_owned()));
        };

        let def = QueueDefinition::new(&name)
            .auto_delete()
            .exclusive()
            .no_ack()
            .subscribe();
        let queue = self.register_queue(def, Some(self.replies.clone())).await?;
        *self.reply_queue.lock() = Some(queue.clone());
        Ok(queue)
    }

    /// Sends every recorded acknowledgment of every queue.
    pub async fn flush_acks(&self) {
        let queues = self.queues();
        for result in join_all(queues.iter().map(|queue| queue.flush())).await {
            if let Err(err) = result {
                warn!(
                    error = err.to_string(),
                    connection = self.connection.name(),
                    "acknowledgment flush failed"
                );
            }
        }
    }

    /// Releases every exchange and queue channel.
    pub async fn release(&self) {
        let queues = self.queues();
        join_all(queues.iter().map(|queue| queue.release())).await;
        let exchanges: Vec<_> = self.exchanges.lock().values().cloned().collect();
        join_all(exchanges.iter().map(|exchange| exchange.release())).await;
    }

    /// Forgets every cached exchange, queue and binding.
    pub fn reset(&self) {
        self.exchanges.lock().clear();
        self.queues.lock().clear();
        self.aliases.lock().clear();
        self.bindings.lock().clear();
        self.promises.lock().clear();
        self.reply_queue.lock().take();
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl Provisioner for Topology {
    async fn configure_exchanges(&self, defs: Vec<ExchangeDefinition>) -> Result<(), AmqpError> {
        Topology::configure_exchanges(self, defs).await
    }

    async fn configure_queues(&self, defs: Vec<QueueDefinition>) -> Result<(), AmqpError> {
        Topology::configure_queues(self, defs).await
    }

    async fn configure_bindings(
        &self,
        defs: Vec<BindingDefinition>,
        connection: String,
    ) -> Result<(), AmqpError> {
        Topology::configure_bindings(self, defs, &connection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use mockall::Sequence;

    fn config() -> TopologyConfig {
        TopologyConfig::new(ConnectionOptions::default())
            .exchange(ExchangeDefinition::new("ex").topic())
            .queue(QueueDefinition::new("q"))
            .binding(BindingDefinition::new("ex", "q").key("#"))
    }

    #[tokio::test]
    async fn stages_run_in_order() {
        let mut seq = Sequence::new();
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_configure_exchanges()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|defs| {
                assert_eq!(defs.len(), 1);
                Ok(())
            });
        provisioner
            .expect_configure_queues()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        provisioner
            .expect_configure_bindings()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, connection| {
                assert_eq!(connection, "default");
                Ok(())
            });

        provision(&provisioner, &config()).await.unwrap();
    }

    #[tokio::test]
    async fn exchange_failures_skip_queues_and_bindings() {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_configure_exchanges()
            .times(1)
            .returning(|_| Err(AmqpError::DeclareExchangeError("ex".to_owned())));
        provisioner.expect_configure_queues().times(0);
        provisioner.expect_configure_bindings().times(0);

        let err = provision(&provisioner, &config()).await.unwrap_err();
        assert_eq!(err, AmqpError::DeclareExchangeError("ex".to_owned()));
    }

    #[tokio::test]
    async fn queue_failures_skip_bindings() {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_configure_exchanges()
            .returning(|_| Ok(()));
        provisioner
            .expect_configure_queues()
            .times(1)
            .returning(|_| Err(AmqpError::DeclareQueueError("q".to_owned())));
        provisioner.expect_configure_bindings().times(0);

        assert!(provision(&provisioner, &config()).await.is_err());
    }
}
