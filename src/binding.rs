// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bindings
//!
//! A binding is a pure relation between a source exchange and a target queue
//! or exchange under zero or more routing keys. It carries no state of its own
//! and is removed by naming the same source, target and keys again.

use crate::{errors::AmqpError, transport::AmqpChannel};
use futures_util::future::try_join_all;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error};

#[derive(Deserialize)]
#[serde(untagged)]
enum Keys {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Keys::deserialize(deserializer)? {
        Keys::One(key) => vec![key],
        Keys::Many(keys) => keys,
    })
}

/// Relation between a source exchange and a queue or exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingDefinition {
    /// Source exchange.
    pub exchange: String,
    /// Destination queue or exchange.
    pub target: String,
    /// Routing keys; accepts a single string or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub keys: Vec<String>,
    /// Whether the target is a queue. When unset the topology looks the
    /// target up among its declared queues.
    pub queue: Option<bool>,
    /// Binding arguments, e.g. `x-match` for headers exchanges.
    pub arguments: BTreeMap<String, String>,
}

impl BindingDefinition {
    pub fn new(exchange: &str, target: &str) -> BindingDefinition {
        BindingDefinition {
            exchange: exchange.to_owned(),
            target: target.to_owned(),
            ..BindingDefinition::default()
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.keys.push(key.to_owned());
        self
    }

    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn to_queue(mut self) -> Self {
        self.queue = Some(true);
        self
    }

    pub fn to_exchange(mut self) -> Self {
        self.queue = Some(false);
        self
    }

    pub fn argument(mut self, key: &str, value: &str) -> Self {
        self.arguments.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Keys actually bound. No key means the empty routing key.
    pub fn routing_keys(&self) -> Vec<String> {
        if self.keys.is_empty() {
            vec![String::new()]
        } else {
            self.keys.clone()
        }
    }

    /// Registry identity: `<source>-><target>:<key,key>`.
    pub fn id(&self) -> String {
        format!(
            "{}->{}:{}",
            self.exchange,
            self.target,
            self.routing_keys().join(",")
        )
    }

    pub(crate) fn arguments_table(&self) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in &self.arguments {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        table
    }

    fn failure(&self, to_queue: bool) -> AmqpError {
        if to_queue {
            AmqpError::BindingExchangeToQueueError(self.exchange.clone(), self.target.clone())
        } else {
            AmqpError::BindingExchangeToExchangeError(self.exchange.clone(), self.target.clone())
        }
    }
}

/// Binds every routing key of the definition.
pub async fn bind(
    channel: &dyn AmqpChannel,
    def: &BindingDefinition,
    to_queue: bool,
) -> Result<(), AmqpError> {
    debug!(
        exchange = def.exchange,
        target = def.target,
        to_queue,
        "binding"
    );

    let keys = def.routing_keys();
    let bindings = keys.iter().map(|key| async move {
        let args = def.arguments_table();
        let result = if to_queue {
            channel.bind_queue(&def.target, &def.exchange, key, args).await
        } else {
            channel.bind_exchange(&def.target, &def.exchange, key, args).await
        };
        result.map_err(|err| {
            error!(
                error = err.to_string(),
                exchange = def.exchange,
                target = def.target,
                key,
                "error to bind"
            );
            def.failure(to_queue)
        })
    });

    try_join_all(bindings).await.map(|_| ())
}

/// Removes every routing key of the definition.
pub async fn unbind(
    channel: &dyn AmqpChannel,
    def: &BindingDefinition,
    to_queue: bool,
) -> Result<(), AmqpError> {
    for key in def.routing_keys() {
        let args = def.arguments_table();
        let result = if to_queue {
            channel
                .unbind_queue(&def.target, &def.exchange, &key, args)
                .await
        } else {
            channel
                .unbind_exchange(&def.target, &def.exchange, &key, args)
                .await
        };
        if let Err(err) = result {
            error!(error = err.to_string(), exchange = def.exchange, target = def.target, "error to unbind");
            return Err(AmqpError::UnbindingError(
                def.exchange.clone(),
                def.target.clone(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockAmqpChannel;

    #[test]
    fn keys_accept_a_single_string() {
        #[derive(Deserialize)]
        struct Doc {
            bindings: Vec<BindingDefinition>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[bindings]]
            exchange = "ex"
            target = "q"
            keys = "a.b"
            "#,
        )
        .unwrap();
        assert_eq!(doc.bindings[0].keys, vec!["a.b".to_owned()]);
    }

    #[test]
    fn missing_keys_bind_the_empty_routing_key() {
        let def = BindingDefinition::new("ex", "q");
        assert_eq!(def.routing_keys(), vec![String::new()]);
        assert_eq!(def.id(), "ex->q:");
        assert_eq!(def.key("a").key("b").id(), "ex->q:a,b");
    }

    #[tokio::test]
    async fn queue_bindings_bind_every_key() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_bind_queue()
            .times(2)
            .returning(|queue, exchange, _, _| {
                assert_eq!(queue, "q");
                assert_eq!(exchange, "ex");
                Ok(())
            });
        channel.expect_bind_exchange().times(0);

        bind(&channel, &BindingDefinition::new("ex", "q").keys(["a", "b"]), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exchange_binding_failures_name_both_ends() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_bind_exchange()
            .returning(|_, _, _, _| Err(AmqpError::ChannelError("closed".to_owned())));

        let err = bind(&channel, &BindingDefinition::new("src", "dst"), false)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AmqpError::BindingExchangeToExchangeError("src".to_owned(), "dst".to_owned())
        );
    }
}
