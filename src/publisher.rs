// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Options
//!
//! This module provides the options accepted by `publish`, `bulk_publish` and
//! `request`, and the conversion of those options into AMQP message
//! properties and header tables.

use crate::serializers::Body;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use std::{
    collections::{BTreeMap, HashMap},
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// AMQP delivery mode marking a message persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Header values accepted by [`PublishOptions::header`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
    Double(f64),
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value.clone() {
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Double(v) => AMQPValue::Double(v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

/// Converts caller headers into an AMQP field table.
pub(crate) fn field_table(headers: &HashMap<String, HeaderValue>) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), AMQPValue::from(value)))
        .collect();
    FieldTable::from(btree)
}

/// Everything that describes one outgoing message.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Defaults to the message type.
    pub routing_key: Option<String>,
    pub message_type: Option<String>,
    pub body: Body,
    /// Defaults to the body's natural content type.
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    /// Defaults to a random UUID.
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, HeaderValue>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    pub persistent: bool,
    /// Ask the broker to return the message when it cannot be routed.
    pub mandatory: bool,
    /// Seconds since the epoch, defaults to now.
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
    /// Confirmation timeout in milliseconds for this publish only.
    pub timeout: Option<u64>,
    pub connection_name: Option<String>,
}

impl PublishOptions {
    pub fn new(message_type: &str, body: impl Into<Body>) -> PublishOptions {
        PublishOptions {
            message_type: Some(message_type.to_owned()),
            body: body.into(),
            ..PublishOptions::default()
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }

    pub fn connection(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// Routing key actually used: explicit key, else the message type.
    pub(crate) fn effective_routing_key(&self) -> String {
        self.routing_key
            .clone()
            .or_else(|| self.message_type.clone())
            .unwrap_or_default()
    }

    /// Builds the AMQP properties for this message.
    pub(crate) fn properties(&self, content_type: &str, headers: FieldTable) -> BasicProperties {
        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timestamp = self.timestamp.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default()
        });

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_type(ShortString::from(
                self.message_type.clone().unwrap_or_default(),
            ))
            .with_message_id(ShortString::from(message_id))
            .with_timestamp(timestamp)
            .with_headers(headers);

        if let Some(id) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.clone()));
        }
        if let Some(expiration) = self.expiration {
            props = props.with_expiration(ShortString::from(expiration.to_string()));
        }
        if let Some(app_id) = &self.app_id {
            props = props.with_app_id(ShortString::from(app_id.clone()));
        }
        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_defaults_to_the_message_type() {
        let options = PublishOptions::new("order.created", "x");
        assert_eq!(options.effective_routing_key(), "order.created");
        let options = options.routing_key("");
        assert_eq!(options.effective_routing_key(), "");
    }

    #[test]
    fn properties_carry_identity_and_headers() {
        let options = PublishOptions::new("left", "x")
            .correlation_id("abc")
            .header("tenant", "acme")
            .expiration(1000)
            .persistent();
        let headers = field_table(&options.headers);
        let props = options.properties("text/plain", headers);

        assert_eq!(props.kind().as_ref().map(|v| v.as_str()), Some("left"));
        assert_eq!(props.correlation_id().as_ref().map(|v| v.as_str()), Some("abc"));
        assert_eq!(props.expiration().as_ref().map(|v| v.as_str()), Some("1000"));
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert!(props.message_id().is_some());
        assert_eq!(
            props.headers().as_ref().unwrap().inner().get("tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
    }
}
