// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! Maps a content type to the [`Serializer`] used to turn a [`Body`] into bytes
//! on publish and bytes back into a [`Body`] on delivery. JSON, octet-stream and
//! plain text are registered by default; applications add their own through
//! [`SerializerRegistry::register`].

use crate::errors::AmqpError;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// A message payload before serialization or after deserialization.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Body {
    /// Serializes any serde value into a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Body, AmqpError> {
        serde_json::to_value(value)
            .map(Body::Json)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))
    }

    /// Decodes a JSON body into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        let value = match self {
            Body::Json(value) => value.clone(),
            Body::Text(text) => Value::String(text.clone()),
            Body::Empty => Value::Null,
            Body::Bytes(bytes) => serde_json::from_slice(bytes)
                .map_err(|err| AmqpError::SerializationError(err.to_string()))?,
        };
        serde_json::from_value(value).map_err(|err| AmqpError::SerializationError(err.to_string()))
    }

    /// Content type used when a publish does not name one.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            Body::Bytes(_) => OCTET_STREAM_CONTENT_TYPE,
            Body::Text(_) => TEXT_CONTENT_TYPE,
            Body::Json(_) | Body::Empty => JSON_CONTENT_TYPE,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            Body::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_owned())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

/// Converts bodies for one content type.
pub trait Serializer: Send + Sync {
    fn serialize(&self, body: &Body) -> Result<Vec<u8>, AmqpError>;

    fn deserialize(&self, bytes: &[u8], encoding: Option<&str>) -> Result<Body, AmqpError>;
}

struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, body: &Body) -> Result<Vec<u8>, AmqpError> {
        match body {
            // strings are assumed to be JSON already
            Body::Text(text) => Ok(text.as_bytes().to_vec()),
            Body::Json(value) => serde_json::to_vec(value)
                .map_err(|err| AmqpError::SerializationError(err.to_string())),
            Body::Empty => Ok(b"null".to_vec()),
            Body::Bytes(_) => Err(AmqpError::SerializationError(
                "raw bytes are not JSON".to_owned(),
            )),
        }
    }

    fn deserialize(&self, bytes: &[u8], encoding: Option<&str>) -> Result<Body, AmqpError> {
        let text = decode_text(bytes, encoding)?;
        serde_json::from_str(&text)
            .map(Body::Json)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))
    }
}

struct OctetStreamSerializer;

impl Serializer for OctetStreamSerializer {
    fn serialize(&self, body: &Body) -> Result<Vec<u8>, AmqpError> {
        match body {
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::Json(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|byte| u8::try_from(byte).ok())
                        .ok_or_else(|| {
                            AmqpError::SerializationError("array item is not a byte".to_owned())
                        })
                })
                .collect(),
            _ => Err(AmqpError::SerializationError(
                "cannot serialize unknown data type".to_owned(),
            )),
        }
    }

    fn deserialize(&self, bytes: &[u8], _encoding: Option<&str>) -> Result<Body, AmqpError> {
        Ok(Body::Bytes(bytes.to_vec()))
    }
}

struct TextSerializer;

impl Serializer for TextSerializer {
    fn serialize(&self, body: &Body) -> Result<Vec<u8>, AmqpError> {
        match body {
            Body::Text(text) => Ok(text.as_bytes().to_vec()),
            Body::Json(Value::String(text)) => Ok(text.as_bytes().to_vec()),
            Body::Json(value) => Ok(value.to_string().into_bytes()),
            Body::Empty => Ok(vec![]),
            Body::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    fn deserialize(&self, bytes: &[u8], encoding: Option<&str>) -> Result<Body, AmqpError> {
        decode_text(bytes, encoding).map(Body::Text)
    }
}

fn decode_text(bytes: &[u8], encoding: Option<&str>) -> Result<String, AmqpError> {
    match encoding.map(str::to_ascii_lowercase).as_deref() {
        None | Some("utf8") | Some("utf-8") => String::from_utf8(bytes.to_vec())
            .map_err(|err| AmqpError::SerializationError(err.to_string())),
        Some("ascii") | Some("latin1") => Ok(bytes.iter().map(|byte| *byte as char).collect()),
        Some(other) => Err(AmqpError::SerializationError(format!(
            "unsupported encoding {other}"
        ))),
    }
}

/// Content type to serializer lookup shared by a broker and its connections.
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<String, Arc<dyn Serializer>>>,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let registry = SerializerRegistry {
            serializers: RwLock::new(HashMap::new()),
        };
        registry.register(JSON_CONTENT_TYPE, Arc::new(JsonSerializer));
        registry.register(OCTET_STREAM_CONTENT_TYPE, Arc::new(OctetStreamSerializer));
        registry.register(TEXT_CONTENT_TYPE, Arc::new(TextSerializer));
        registry
    }
}

impl SerializerRegistry {
    pub fn register(&self, content_type: &str, serializer: Arc<dyn Serializer>) {
        self.serializers
            .write()
            .insert(content_type.to_owned(), serializer);
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.serializers.read().contains_key(content_type)
    }

    fn get(&self, content_type: &str) -> Result<Arc<dyn Serializer>, AmqpError> {
        self.serializers
            .read()
            .get(content_type)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownContentType(content_type.to_owned()))
    }

    pub fn serialize(&self, content_type: &str, body: &Body) -> Result<Vec<u8>, AmqpError> {
        self.get(content_type)?.serialize(body)
    }

    pub fn deserialize(
        &self,
        content_type: &str,
        bytes: &[u8],
        encoding: Option<&str>,
    ) -> Result<Body, AmqpError> {
        self.get(content_type)?.deserialize(bytes, encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_bodies_serialize_and_strings_pass_through() {
        let registry = SerializerRegistry::default();
        let bytes = registry
            .serialize(JSON_CONTENT_TYPE, &Body::Json(json!({"a": 1})))
            .unwrap();
        assert_eq!(bytes, br#"{"a":1}"#.to_vec());

        let bytes = registry
            .serialize(JSON_CONTENT_TYPE, &Body::from(r#"{"raw":true}"#))
            .unwrap();
        assert_eq!(bytes, br#"{"raw":true}"#.to_vec());

        let body = registry
            .deserialize(JSON_CONTENT_TYPE, br#"{"a":1}"#, None)
            .unwrap();
        assert_eq!(body, Body::Json(json!({"a": 1})));
    }

    #[test]
    fn octet_stream_accepts_bytes_and_byte_arrays_only() {
        let registry = SerializerRegistry::default();
        assert_eq!(
            registry
                .serialize(OCTET_STREAM_CONTENT_TYPE, &Body::Bytes(vec![1, 2]))
                .unwrap(),
            vec![1, 2]
        );
        assert_eq!(
            registry
                .serialize(OCTET_STREAM_CONTENT_TYPE, &Body::Json(json!([3, 4])))
                .unwrap(),
            vec![3, 4]
        );
        assert!(registry
            .serialize(OCTET_STREAM_CONTENT_TYPE, &Body::from("text"))
            .is_err());
    }

    #[test]
    fn text_round_trips_with_encoding() {
        let registry = SerializerRegistry::default();
        let body = registry
            .deserialize(TEXT_CONTENT_TYPE, b"leonidas", Some("utf8"))
            .unwrap();
        assert_eq!(body.as_text(), Some("leonidas"));
        assert!(registry
            .deserialize(TEXT_CONTENT_TYPE, b"x", Some("utf16"))
            .is_err());
    }

    #[test]
    fn unknown_content_types_fail_only_the_call() {
        let registry = SerializerRegistry::default();
        assert_eq!(
            registry.serialize("application/x-custom", &Body::Empty),
            Err(AmqpError::UnknownContentType(
                "application/x-custom".to_owned()
            ))
        );

        struct Upper;
        impl Serializer for Upper {
            fn serialize(&self, body: &Body) -> Result<Vec<u8>, AmqpError> {
                Ok(body.as_text().unwrap_or_default().to_uppercase().into_bytes())
            }
            fn deserialize(&self, bytes: &[u8], _: Option<&str>) -> Result<Body, AmqpError> {
                Ok(Body::Bytes(bytes.to_vec()))
            }
        }
        registry.register("application/x-custom", Arc::new(Upper));
        assert_eq!(
            registry
                .serialize("application/x-custom", &Body::from("abc"))
                .unwrap(),
            b"ABC".to_vec()
        );
    }

    #[test]
    fn typed_bodies_decode() {
        #[derive(serde::Deserialize, serde::Serialize, PartialEq, Debug)]
        struct Order {
            id: u32,
        }
        let body = Body::json(&Order { id: 7 }).unwrap();
        assert_eq!(body.decode::<Order>().unwrap(), Order { id: 7 });
    }
}
