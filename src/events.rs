// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Events
//!
//! Lifecycle notifications fanned out to callbacks. Each event has a bare kind
//! (`connected`, `closed`, `failed`, `unreachable`, `return`, `configured`,
//! `blocked`, `unblocked`) and a per-connection topic
//! `<connection>.connection.<kind>`. Callbacks subscribe to every event or to
//! a topic pattern using the dispatcher's wildcard rules.

use crate::{errors::AmqpError, topic, transport::InboundDelivery};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Connected { connection: String },
    Closed { connection: String },
    Failed { connection: String, error: AmqpError },
    Unreachable { connection: String },
    Returned { connection: String, delivery: Box<InboundDelivery> },
    Configured { connection: String },
    Blocked { connection: String, reason: String },
    Unblocked { connection: String },
}

impl BrokerEvent {
    pub fn connection(&self) -> &str {
        match self {
            BrokerEvent::Connected { connection }
            | BrokerEvent::Closed { connection }
            | BrokerEvent::Failed { connection, .. }
            | BrokerEvent::Unreachable { connection }
            | BrokerEvent::Returned { connection, .. }
            | BrokerEvent::Configured { connection }
            | BrokerEvent::Blocked { connection, .. }
            | BrokerEvent::Unblocked { connection } => connection,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BrokerEvent::Connected { .. } => "connected",
            BrokerEvent::Closed { .. } => "closed",
            BrokerEvent::Failed { .. } => "failed",
            BrokerEvent::Unreachable { .. } => "unreachable",
            BrokerEvent::Returned { .. } => "return",
            BrokerEvent::Configured { .. } => "configured",
            BrokerEvent::Blocked { .. } => "blocked",
            BrokerEvent::Unblocked { .. } => "unblocked",
        }
    }

    /// `<connection>.connection.<kind>`
    pub fn topic(&self) -> String {
        format!("{}.connection.{}", self.connection(), self.kind())
    }
}

pub type EventCallback = Arc<dyn Fn(&BrokerEvent) + Send + Sync>;

struct Listener {
    id: u64,
    pattern: Option<String>,
    callback: EventCallback,
}

/// Callback registry owned by one broker.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Arc<EventBus> {
        Arc::new(EventBus::default())
    }

    /// Receives every event.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&BrokerEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.add(None, Arc::new(callback))
    }

    /// Receives events whose topic matches `pattern`, e.g. `*.connection.failed`.
    pub fn subscribe_topic(
        self: &Arc<Self>,
        pattern: &str,
        callback: impl Fn(&BrokerEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.add(Some(pattern.to_owned()), Arc::new(callback))
    }

    fn add(self: &Arc<Self>, pattern: Option<String>, callback: EventCallback) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push(Arc::new(Listener {
            id,
            pattern,
            callback,
        }));
        EventSubscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    pub fn emit(&self, event: &BrokerEvent) {
        let topic = event.topic();
        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .read()
            .iter()
            .filter(|listener| match &listener.pattern {
                Some(pattern) => topic::matches(pattern, &topic),
                None => true,
            })
            .cloned()
            .collect();

        for listener in listeners {
            (listener.callback)(event);
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }
}

pub struct EventSubscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl EventSubscription {
    pub fn remove(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn topics_are_scoped_by_connection() {
        let event = BrokerEvent::Failed {
            connection: "default".to_owned(),
            error: AmqpError::ConnectionClosed("default".to_owned()),
        };
        assert_eq!(event.kind(), "failed");
        assert_eq!(event.topic(), "default.connection.failed");
    }

    #[test]
    fn topic_listeners_only_see_matching_events() {
        let bus = EventBus::new();
        let all = Arc::new(Mutex::new(vec![]));
        let failed = Arc::new(Mutex::new(vec![]));

        let sink = all.clone();
        let _all = bus.subscribe(move |event| sink.lock().push(event.kind()));
        let sink = failed.clone();
        let only_failed = bus.subscribe_topic("*.connection.failed", move |event| {
            sink.lock().push(event.connection().to_owned())
        });

        bus.emit(&BrokerEvent::Connected {
            connection: "a".to_owned(),
        });
        bus.emit(&BrokerEvent::Failed {
            connection: "b".to_owned(),
            error: AmqpError::ConnectionClosed("b".to_owned()),
        });

        assert_eq!(*all.lock(), vec!["connected", "failed"]);
        assert_eq!(*failed.lock(), vec!["b".to_owned()]);

        assert!(only_failed.remove());
        bus.emit(&BrokerEvent::Failed {
            connection: "c".to_owned(),
            error: AmqpError::ConnectionClosed("c".to_owned()),
        });
        assert_eq!(failed.lock().len(), 1);
    }
}
