// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection State Machine
//!
//! A [`Connection`] owns one broker session through a [`Resilient`] wrapper and
//! drives it through the lifecycle below:
//!
//! ```text
//! Created -> Connecting -> Connected -> Closed
//!                 ^            |
//!                 |            v
//!                 +-------- Failed
//! Connecting -> Unreachable
//! ```
//!
//! A failed attempt is retried `retry_limit` times right away, then with a
//! capped exponential backoff until `fail_after` seconds have passed since the
//! first failure. At that point the connection is `Unreachable` and every
//! caller waiting on the session observes [`AmqpError::Unreachable`].
//! `Closed` and `Unreachable` stay put until `connect()` is called again.

use crate::{
    config::ConnectionOptions,
    errors::AmqpError,
    resource::Resilient,
    transport::{AmqpChannel, InboundDelivery, Session, SessionEvent, Transport},
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Failed,
    Closed,
    Unreachable,
}

/// Lifecycle notifications of one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Closed,
    Failed(AmqpError),
    Unreachable,
    /// A mandatory message could not be routed.
    Return(Box<InboundDelivery>),
    Blocked(String),
    Unblocked,
}

/// Delay before the `step`-th backed-off attempt.
fn backoff(step: u32) -> Duration {
    let factor = 2u32.saturating_pow(step.saturating_sub(1).min(16));
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

pub struct Connection {
    name: String,
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    session: Resilient<dyn Session>,
    channels: Mutex<HashMap<String, Arc<Resilient<dyn AmqpChannel>>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    closing: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(options: ConnectionOptions, transport: Arc<dyn Transport>) -> Arc<Connection> {
        let (state, _) = watch::channel(ConnectionState::Created);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let name = options.name.clone();

        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let weak = weak.clone();
            let factory_name = name.clone();
            let session = Resilient::new(
                &name,
                "connection",
                Arc::new(move || {
                    let weak = weak.clone();
                    let name = factory_name.clone();
                    async move {
                        match weak.upgrade() {
                            Some(connection) => connection.establish().await,
                            None => Err(AmqpError::ConnectionClosed(name)),
                        }
                    }
                    .boxed()
                }),
            )
            .with_close_hook(Arc::new(|session: Arc<dyn Session>| {
                async move {
                    if let Err(err) = session.close().await {
                        debug!(error = err.to_string(), "error closing session");
                    }
                }
                .boxed()
            }));

            Connection {
                name,
                options,
                transport,
                session,
                channels: Mutex::new(HashMap::new()),
                state,
                events,
                closing: AtomicBool::new(false),
                monitor: Mutex::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(name = self.name, ?state, "connection state");
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Establishes the session. A no-op when already connected.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.closing.store(false, Ordering::SeqCst);
        self.session.acquire().await.map(|_| ())
    }

    async fn establish(self: Arc<Self>) -> Result<Arc<dyn Session>, AmqpError> {
        self.set_state(ConnectionState::Connecting);
        let budget = self.options.fail_after_duration();
        let mut started: Option<Instant> = None;
        let mut attempts: u32 = 0;

        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(AmqpError::ConnectionClosed(self.name.clone()));
            }

            match self.transport.connect(&self.options).await {
                Ok(session) => {
                    debug!(name = self.name, attempts, "amqp connected");
                    self.set_state(ConnectionState::Connected);
                    self.watch(session.clone());
                    self.emit(ConnectionEvent::Connected);
                    return Ok(session);
                }
                Err(err) => {
                    attempts += 1;
                    let first_failure = *started.get_or_insert_with(Instant::now);
                    let elapsed = first_failure.elapsed();
                    warn!(
                        error = err.to_string(),
                        name = self.name,
                        attempts,
                        "failure to connect"
                    );

                    if elapsed >= budget {
                        error!(name = self.name, attempts, "connection unreachable");
                        self.set_state(ConnectionState::Unreachable);
                        self.emit(ConnectionEvent::Unreachable);
                        return Err(AmqpError::Unreachable(self.name.clone()));
                    }

                    if attempts > self.options.retry_limit {
                        let delay = backoff(attempts - self.options.retry_limit);
                        tokio::time::sleep(delay.min(budget - elapsed)).await;
                    }
                }
            }
        }
    }

    fn watch(self: &Arc<Self>, session: Arc<dyn Session>) {
        let mut events = session.events();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(connection) = weak.upgrade() else {
                    break;
                };

                match event {
                    SessionEvent::Closed(reason) => {
                        connection.session_lost(&reason);
                        break;
                    }
                    SessionEvent::Blocked(reason) => {
                        warn!(name = connection.name, reason, "connection blocked");
                        connection.emit(ConnectionEvent::Blocked(reason));
                    }
                    SessionEvent::Unblocked => connection.emit(ConnectionEvent::Unblocked),
                    SessionEvent::Returned(delivery) => connection.notify_returned(*delivery),
                }
            }
        });

        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    fn session_lost(self: &Arc<Self>, reason: &str) {
        if self.closing.load(Ordering::SeqCst) || self.state() == ConnectionState::Closed {
            return;
        }

        warn!(name = self.name, reason, "connection lost, reconnecting");
        self.set_state(ConnectionState::Failed);
        self.session.invalidate();
        for channel in self.channels.lock().values() {
            channel.invalidate();
        }
        self.emit(ConnectionEvent::Failed(AmqpError::ConnectionClosed(
            self.name.clone(),
        )));

        let connection = self.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.session.acquire().await {
                error!(
                    error = err.to_string(),
                    name = connection.name,
                    "failure to reconnect"
                );
            }
        });
    }

    /// Opens a fresh channel on the live session.
    pub async fn open_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        match self.state() {
            ConnectionState::Closed => return Err(AmqpError::ConnectionClosed(self.name.clone())),
            ConnectionState::Unreachable => return Err(AmqpError::Unreachable(self.name.clone())),
            _ => {}
        }

        let session = self.session.acquire().await?;
        session.create_channel(confirm).await.map_err(|err| {
            error!(error = err.to_string(), name = self.name, "error to create the channel");
            AmqpError::ChannelError(self.name.clone())
        })
    }

    /// Named channel shared by every caller, recreated on demand.
    pub fn channel(self: &Arc<Self>, name: &str, confirm: bool) -> Arc<Resilient<dyn AmqpChannel>> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(name) {
            return channel.clone();
        }

        let weak = Arc::downgrade(self);
        let connection_name = self.name.clone();
        let channel = Arc::new(
            Resilient::new(
                name,
                "channel",
                Arc::new(move || {
                    let weak = weak.clone();
                    let connection_name = connection_name.clone();
                    async move {
                        match weak.upgrade() {
                            Some(connection) => connection.open_channel(confirm).await,
                            None => Err(AmqpError::ConnectionClosed(connection_name)),
                        }
                    }
                    .boxed()
                }),
            )
            .with_close_hook(Arc::new(|channel: Arc<dyn AmqpChannel>| {
                async move {
                    if let Err(err) = channel.close().await {
                        debug!(error = err.to_string(), "error closing channel");
                    }
                }
                .boxed()
            })),
        );
        channels.insert(name.to_owned(), channel.clone());
        channel
    }

    /// Re-emits a message the broker bounced back.
    pub fn notify_returned(&self, delivery: InboundDelivery) {
        debug!(
            name = self.name,
            exchange = delivery.exchange,
            routing_key = delivery.routing_key,
            "message returned"
        );
        self.emit(ConnectionEvent::Return(Box::new(delivery)));
    }

    /// Closes every named channel and the session.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        let channels: Vec<_> = self.channels.lock().drain().map(|(_, channel)| channel).collect();
        for channel in channels {
            channel.close().await;
        }
        self.session.close().await;

        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed);
        debug!(name = self.name, "connection closed");
        Ok(())
    }
}
