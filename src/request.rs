// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request / Reply
//!
//! A request is an ordinary publish whose `message_id` is a fresh UUID v7 and
//! whose `reply_to` names the connection's reply queue. Replies come back on
//! that queue with the request id as their correlation id and are routed to
//! the listener registered under it.
//!
//! A single-reply request completes on the reply carrying
//! `sequence_end: true`. A scatter-gather request (`expect: N`) completes on
//! its N-th reply. Every reply that does not complete the request goes to the
//! `notify` callback. The listener is removed on every outcome.

use crate::{
    config::DEFAULT_PUBLISH_TIMEOUT_MS, errors::AmqpError, message::Message,
    publisher::PublishOptions,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};
use tracing::debug;
use uuid::Uuid;

/// Callback receiving intermediate replies.
pub type Notify = Arc<dyn Fn(&Message) + Send + Sync>;

/// Options accepted by `Broker::request`.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub publish: PublishOptions,
    /// Number of replies to gather. `None` waits for `sequence_end`.
    pub expect: Option<usize>,
    /// Milliseconds to wait for the final reply.
    pub reply_timeout: Option<u64>,
    pub notify: Option<Notify>,
}

impl RequestOptions {
    pub fn new(publish: PublishOptions) -> RequestOptions {
        RequestOptions {
            publish,
            ..RequestOptions::default()
        }
    }

    pub fn expect(mut self, replies: usize) -> Self {
        self.expect = Some(replies);
        self
    }

    pub fn reply_timeout(mut self, millis: u64) -> Self {
        self.reply_timeout = Some(millis);
        self
    }

    pub fn notify(mut self, callback: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.notify = Some(Arc::new(callback));
        self
    }
}

/// Timeouts that may apply to a request, from most to least specific.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutSources {
    pub request_reply: Option<u64>,
    pub request_publish: Option<u64>,
    pub exchange_reply: Option<u64>,
    pub exchange_publish: Option<u64>,
    pub connection_reply: Option<u64>,
    pub connection_publish: Option<u64>,
}

impl TimeoutSources {
    /// Reply timeout in milliseconds: the first configured reply timeout,
    /// else twice the effective publish timeout.
    pub fn reply_timeout(&self) -> u64 {
        self.request_reply
            .or(self.exchange_reply)
            .or(self.connection_reply)
            .unwrap_or_else(|| {
                let publish = self
                    .request_publish
                    .or(self.exchange_publish)
                    .or(self.connection_publish)
                    .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS);
                publish.saturating_mul(2)
            })
    }
}

/// New time-ordered request id.
pub fn request_id() -> String {
    Uuid::now_v7().to_string()
}

/// Routes replies to pending requests by correlation id.
#[derive(Default)]
pub struct RequestCoordinator {
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl RequestCoordinator {
    pub fn new() -> Arc<RequestCoordinator> {
        Arc::new(RequestCoordinator::default())
    }

    /// Registers a listener for replies correlated to `id`.
    pub fn listen(self: &Arc<Self>, id: &str) -> ReplyListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(id.to_owned(), tx);
        ReplyListener {
            id: id.to_owned(),
            replies: rx,
            coordinator: self.clone(),
        }
    }

    /// Hands a reply to its listener. Gives the message back when nobody
    /// waits for it.
    pub fn deliver(&self, msg: Message) -> Result<(), Message> {
        let Some(id) = msg.correlation_id.clone() else {
            return Err(msg);
        };
        let sender = self.pending.lock().get(&id).cloned();
        match sender {
            Some(sender) => sender.send(msg).map_err(|err| err.0),
            None => Err(msg),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn remove(&self, id: &str) {
        self.pending.lock().remove(id);
    }
}

/// Receives the replies of one request. Unregisters itself on drop.
pub struct ReplyListener {
    id: String,
    replies: mpsc::UnboundedReceiver<Message>,
    coordinator: Arc<RequestCoordinator>,
}

impl ReplyListener {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the reply that completes the request.
    pub async fn collect(
        mut self,
        expect: Option<usize>,
        timeout: Duration,
        notify: Option<Notify>,
    ) -> Result<Message, AmqpError> {
        let deadline = Instant::now() + timeout;
        let mut remaining = expect.map(|expect| expect.max(1));

        loop {
            let reply = match tokio::time::timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) | Err(_) => {
                    debug!(id = self.id, "request timed out");
                    return Err(AmqpError::RequestTimeout(timeout.as_millis() as u64));
                }
            };

            let end = match remaining.as_mut() {
                Some(remaining) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                None => reply.sequence_end(),
            };

            if end {
                return Ok(reply);
            }
            if let Some(notify) = &notify {
                notify(&reply);
            }
        }
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        self.coordinator.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::SEQUENCE_END_HEADER, serializers::SerializerRegistry, transport::InboundDelivery,
    };
    use lapin::{
        types::{AMQPValue, FieldTable, ShortString},
        BasicProperties,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(id: &str, body: &str, end: bool) -> Message {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(SEQUENCE_END_HEADER), AMQPValue::Boolean(end));
        let delivery = InboundDelivery {
            properties: BasicProperties::default()
                .with_correlation_id(ShortString::from(id))
                .with_content_type(ShortString::from("text/plain"))
                .with_headers(headers),
            data: body.as_bytes().to_vec(),
            ..InboundDelivery::default()
        };
        Message::from_delivery("replies", delivery, &SerializerRegistry::default(), None, None)
    }

    #[test]
    fn reply_timeout_falls_back_to_twice_the_publish_timeout() {
        assert_eq!(TimeoutSources::default().reply_timeout(), 1000);
        let sources = TimeoutSources {
            exchange_publish: Some(300),
            ..TimeoutSources::default()
        };
        assert_eq!(sources.reply_timeout(), 600);
        let sources = TimeoutSources {
            request_reply: Some(50),
            connection_reply: Some(900),
            ..TimeoutSources::default()
        };
        assert_eq!(sources.reply_timeout(), 50);
    }

    #[tokio::test]
    async fn single_reply_completes_on_sequence_end() {
        let coordinator = RequestCoordinator::new();
        let listener = coordinator.listen("r1");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let notify: Notify = Arc::new(move |_msg: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.deliver(reply("r1", "part", false)).unwrap();
        coordinator.deliver(reply("r1", "done", true)).unwrap();

        let msg = listener
            .collect(None, Duration::from_secs(1), Some(notify))
            .await
            .unwrap();
        assert_eq!(msg.body.as_text(), Some("done"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn scatter_gather_completes_after_the_expected_count() {
        let coordinator = RequestCoordinator::new();
        let listener = coordinator.listen("r2");
        for body in ["a", "b", "c"] {
            coordinator.deliver(reply("r2", body, true)).unwrap();
        }

        let msg = listener
            .collect(Some(3), Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(msg.body.as_text(), Some("c"));
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_reject_and_remove_the_listener() {
        let coordinator = RequestCoordinator::new();
        let listener = coordinator.listen("r3");
        assert_eq!(coordinator.pending(), 1);

        let err = listener
            .collect(None, Duration::from_millis(250), None)
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::RequestTimeout(250));
        assert_eq!(coordinator.pending(), 0);
        assert!(coordinator.deliver(reply("r3", "late", true)).is_err());
    }

    #[test]
    fn request_ids_are_version_seven() {
        let id = Uuid::parse_str(&request_id()).unwrap();
        assert_eq!(id.get_version_num(), 7);
        assert_ne!(request_id(), request_id());
    }
}
