// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Process Identity
//!
//! Identifiers derived from the host and the running process. They name
//! consumer tags, the generated reply queue and `unique` queues.

use std::{env, fs, process, sync::OnceLock};

fn hostname() -> String {
    if let Ok(host) = env::var("HOSTNAME") {
        if !host.trim().is_empty() {
            return host.trim().to_owned();
        }
    }
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|host| host.trim().to_owned())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

fn process_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "rust".to_owned())
}

struct Identity {
    consumer_id: String,
    consistent_id: String,
}

fn identity() -> &'static Identity {
    static IDENTITY: OnceLock<Identity> = OnceLock::new();
    IDENTITY.get_or_init(|| {
        let host = hostname();
        let name = process_name();
        Identity {
            consumer_id: format!("{}.{}.{}", host, name, process::id()),
            consistent_id: format!("{host}.{name}"),
        }
    })
}

/// `<host>.<process>.<pid>`
pub fn consumer_id() -> &'static str {
    &identity().consumer_id
}

/// Consumer tag for a queue, prefixed with the consumer id unless it already is.
pub fn create_tag(queue: &str) -> String {
    let id = consumer_id();
    if queue.starts_with(id) {
        queue.to_owned()
    } else {
        format!("{id}.{queue}")
    }
}

/// 32-bit hash: the first four bytes of the BLAKE3 digest, big-endian.
pub fn hash(id: &str) -> u32 {
    let digest = blake3::hash(id.as_bytes());
    let bytes = digest.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Hash of the consumer id; differs per process.
pub fn consumer_hash() -> u32 {
    hash(consumer_id())
}

/// Hash of `<host>.<process>`; stable across restarts on the same host.
pub fn consistent_hash() -> u32 {
    hash(&identity().consistent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_id_ends_with_the_pid() {
        assert!(consumer_id().ends_with(&format!(".{}", process::id())));
    }

    #[test]
    fn tags_are_prefixed_once() {
        let tag = create_tag("orders");
        assert_eq!(tag, format!("{}.orders", consumer_id()));
        assert_eq!(create_tag(&tag), tag);
    }

    #[test]
    fn hashes_are_deterministic() {
        assert_eq!(hash("a.b.1"), hash("a.b.1"));
        assert_ne!(hash("a.b.1"), hash("a.b.2"));
        assert_eq!(consumer_hash(), consumer_hash());
    }
}
