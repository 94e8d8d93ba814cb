// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{broker, eventually, recorder};
use rabbitmq_resilient::{
    BindingDefinition, ConnectionOptions, ExchangeDefinition, HandlerOptions, PublishOptions,
    QueueDefinition, QueueState, TopologyConfig,
};

const KEYS: [&str; 3] = ["this.is.a.test", "this.is.sparta", "this.is.not.wine.wtf"];

fn topology(exchange: &str, queue: QueueDefinition) -> TopologyConfig {
    let name = queue.name.clone();
    TopologyConfig::new(ConnectionOptions::default())
        .exchange(ExchangeDefinition::new(exchange).topic().auto_delete())
        .queue(queue)
        .binding(BindingDefinition::new(exchange, &name).key("this.is.#"))
}

async fn publish_three(broker: &rabbitmq_resilient::Broker, exchange: &str) {
    for key in KEYS {
        broker
            .publish(exchange, PublishOptions::new("topic", key).routing_key(key))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn purging_an_idle_queue_returns_the_count_and_stays_ready() {
    let (memory, broker) = broker();
    broker
        .configure(topology(
            "purge-ex.idle",
            QueueDefinition::new("purge-q.idle").auto_delete(),
        ))
        .await
        .unwrap();
    publish_three(&broker, "purge-ex.idle").await;
    assert_eq!(memory.queue_depth("purge-q.idle"), Some(3));

    let purged = broker.purge_queue("purge-q.idle", None).await.unwrap();

    assert_eq!(purged, 3);
    assert_eq!(memory.queue_depth("purge-q.idle"), Some(0));
    let queue = broker.get_queue("purge-q.idle", None).unwrap();
    assert_eq!(queue.state(), QueueState::Ready);

    broker.delete_queue("purge-q.idle", None).await.unwrap();
    broker.shutdown().await.unwrap();
}

async fn purge_while_subscribed(exchange: &str, queue: QueueDefinition) {
    let (memory, broker) = broker();
    let name = queue.name.clone();
    let (received, handler) = recorder(true);
    let _sub = broker.handle(HandlerOptions::new("topic"), handler);
    broker.configure(topology(exchange, queue)).await.unwrap();

    publish_three(&broker, exchange).await;
    // prefetch 1: the first delivery stays unsettled until the next flush
    eventually("the first delivery", || received.lock().len() == 1).await;

    let purged = broker.purge_queue(&name, None).await.unwrap();

    assert!(purged > 0);
    assert_eq!(purged as usize + received.lock().len(), 3);
    let queue = broker.get_queue(&name, None).unwrap();
    assert_eq!(queue.state(), QueueState::Subscribed);

    broker
        .publish(exchange, PublishOptions::new("topic", "stapler").routing_key("this.is.easy"))
        .await
        .unwrap();
    broker.batch_ack().await;
    eventually("delivery after the purge", || received.lock().len() == 2).await;
    assert_eq!(received.lock()[1].body.as_text(), Some("stapler"));
    assert_eq!(memory.consumer_count(&name), 1);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn purging_an_auto_delete_queue_keeps_its_consumer() {
    purge_while_subscribed(
        "purge-ex.auto",
        QueueDefinition::new("purge-q.auto")
            .auto_delete()
            .subscribe()
            .limit(1),
    )
    .await;
}

#[tokio::test]
async fn purging_a_subscribed_queue_resubscribes_afterwards() {
    purge_while_subscribed(
        "purge-ex.durable",
        QueueDefinition::new("purge-q.durable").subscribe().limit(1),
    )
    .await;
}

#[tokio::test]
async fn purging_unknown_queues_fails() {
    let (_memory, broker) = broker();
    broker
        .configure(TopologyConfig::new(ConnectionOptions::default()))
        .await
        .unwrap();

    let err = broker.purge_queue("nope", None).await.unwrap_err();
    assert_eq!(
        err,
        rabbitmq_resilient::AmqpError::NoQueue("nope".to_owned(), "default".to_owned())
    );
    broker.shutdown().await.unwrap();
}
