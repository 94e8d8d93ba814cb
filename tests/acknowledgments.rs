// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{broker, eventually, recorder};
use parking_lot::Mutex;
use rabbitmq_resilient::{
    BindingDefinition, Broker, BrokerEvent, ConnectionOptions, ExchangeDefinition, HandlerOptions,
    PublishOptions, QueueDefinition, TopologyConfig,
};
use std::{sync::Arc, time::Duration};

fn jobs_topology(queue: QueueDefinition) -> TopologyConfig {
    TopologyConfig::new(ConnectionOptions::default())
        .exchange(ExchangeDefinition::new("jobs.ex").direct())
        .queue(queue.subscribe())
        .binding(BindingDefinition::new("jobs.ex", "jobs.q").key("job"))
}

/// Configures and waits until the connected event went through, so the
/// default acknowledgment tick is running.
async fn configure_connected(broker: &Broker, queue: QueueDefinition) {
    let connected = Arc::new(Mutex::new(false));
    let flag = connected.clone();
    let subscription = broker
        .events()
        .subscribe_topic("*.connection.connected", move |_: &BrokerEvent| {
            *flag.lock() = true
        });
    broker.configure(jobs_topology(queue)).await.unwrap();
    eventually("the connected event", || *connected.lock()).await;
    subscription.remove();
}

#[tokio::test(start_paused = true)]
async fn the_periodic_tick_settles_without_a_manual_flush() {
    let (memory, broker) = broker();
    let (received, handler) = recorder(true);
    let _sub = broker.handle(HandlerOptions::new("job"), handler);
    configure_connected(&broker, QueueDefinition::new("jobs.q")).await;

    broker
        .publish("jobs.ex", PublishOptions::new("job", "tick"))
        .await
        .unwrap();
    eventually("the delivery", || received.lock().len() == 1).await;
    assert_eq!(memory.unacked("jobs.q"), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(memory.unacked("jobs.q"), 0);
    broker.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cleared_intervals_leave_acknowledgments_pending() {
    let (memory, broker) = broker();
    let (received, handler) = recorder(true);
    let _sub = broker.handle(HandlerOptions::new("job"), handler);
    configure_connected(&broker, QueueDefinition::new("jobs.q")).await;
    broker.clear_ack_interval();

    broker
        .publish("jobs.ex", PublishOptions::new("job", "held"))
        .await
        .unwrap();
    eventually("the delivery", || received.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(memory.unacked("jobs.q"), 1);

    broker.set_ack_interval(Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(memory.unacked("jobs.q"), 0);
    broker.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn no_batch_queues_settle_immediately() {
    let (memory, broker) = broker();
    let (received, handler) = recorder(true);
    let _sub = broker.handle(HandlerOptions::new("job"), handler);
    configure_connected(&broker, QueueDefinition::new("jobs.q").no_batch()).await;
    broker.clear_ack_interval();

    broker
        .publish("jobs.ex", PublishOptions::new("job", "now"))
        .await
        .unwrap();
    eventually("the delivery", || received.lock().len() == 1).await;
    eventually("the immediate ack", || memory.unacked("jobs.q") == 0).await;
    broker.shutdown().await.unwrap();
}
