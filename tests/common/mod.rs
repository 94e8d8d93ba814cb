// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Helpers shared by the integration suites. Every suite runs the full client
//! against the in-memory broker.

#![allow(dead_code)]

use parking_lot::Mutex;
use rabbitmq_resilient::{
    handler_fn, AmqpError, Broker, ConsumerHandler, MemoryBroker, Message,
};
use std::{sync::Arc, time::Duration};

pub fn broker() -> (MemoryBroker, Broker) {
    let memory = MemoryBroker::new();
    let broker = Broker::new(Arc::new(memory.clone()));
    (memory, broker)
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Flushes pending acknowledgements until `check` holds.
pub async fn settled(broker: &Broker, what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        broker.batch_ack().await;
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Records every message it receives. Acknowledges when `ack` is set.
pub fn recorder(ack: bool) -> (Arc<Mutex<Vec<Message>>>, Arc<dyn ConsumerHandler>) {
    let received = Arc::new(Mutex::new(vec![]));
    let sink = received.clone();
    let handler = handler_fn(move |msg: Message| {
        let sink = sink.clone();
        async move {
            if ack {
                msg.ack();
            }
            sink.lock().push(msg);
            Ok::<_, AmqpError>(())
        }
    });
    (received, handler)
}
