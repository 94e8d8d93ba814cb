// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Resources
//!
//! Every channel-backed handle the client owns (the broker session, each
//! exchange channel, each queue channel) lives inside a [`Resilient`] wrapper.
//! The wrapper owns at most one live instance. It creates the instance lazily
//! through a factory, checks it with the [`Resource::is_alive`] validator on
//! every acquisition and replaces it wholesale once it is found dead or was
//! invalidated.
//!
//! Creation is coalesced: while a factory call is in flight every other
//! `acquire()` awaits the same call and observes the same result. A failed
//! creation is not retried by the wrapper; the next `acquire()` starts a new
//! one.

use crate::errors::AmqpError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::debug;

/// Capability implemented by every handle a [`Resilient`] can own.
pub trait Resource: Send + Sync + 'static {
    /// Reports whether the handle can still be used.
    fn is_alive(&self) -> bool;
}

/// Creates a new instance of the wrapped resource.
pub type Factory<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<T>, AmqpError>> + Send + Sync>;

/// Releases an instance when the wrapper is closed.
pub type CloseHook<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, ()> + Send + Sync>;

type Pending<T> = Shared<BoxFuture<'static, Result<Arc<T>, AmqpError>>>;

enum Slot<T: ?Sized> {
    Empty,
    Pending(u64, Pending<T>),
    Ready(Arc<T>),
}

/// Lazily created, transparently recreated handle.
pub struct Resilient<T: ?Sized + Resource> {
    name: String,
    kind: &'static str,
    factory: Factory<T>,
    close_hook: Option<CloseHook<T>>,
    slot: Mutex<Slot<T>>,
    generation: AtomicU64,
    creations: AtomicU64,
}

impl<T: ?Sized + Resource> Resilient<T> {
    /// Creates an empty wrapper. Nothing is created until the first `acquire()`.
    pub fn new(name: &str, kind: &'static str, factory: Factory<T>) -> Resilient<T> {
        Resilient {
            name: name.to_owned(),
            kind,
            factory,
            close_hook: None,
            slot: Mutex::new(Slot::Empty),
            generation: AtomicU64::new(0),
            creations: AtomicU64::new(0),
        }
    }

    /// Sets the hook invoked with the live instance on `close()`.
    pub fn with_close_hook(mut self, hook: CloseHook<T>) -> Self {
        self.close_hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Number of factory invocations performed so far.
    pub fn creations(&self) -> u64 {
        self.creations.load(Ordering::SeqCst)
    }

    /// Returns the live instance without creating one.
    pub fn current(&self) -> Option<Arc<T>> {
        match &*self.slot.lock() {
            Slot::Ready(handle) if handle.is_alive() => Some(handle.clone()),
            _ => None,
        }
    }

    /// Returns the live instance, creating it when absent or dead.
    pub async fn acquire(&self) -> Result<Arc<T>, AmqpError> {
        let (generation, pending) = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Ready(handle) if handle.is_alive() => return Ok(handle.clone()),
                Slot::Pending(generation, pending) => (*generation, pending.clone()),
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.creations.fetch_add(1, Ordering::SeqCst);
                    debug!(name = self.name, kind = self.kind, "creating resource");

                    let pending = (self.factory)().shared();
                    *slot = Slot::Pending(generation, pending.clone());
                    (generation, pending)
                }
            }
        };

        let result = pending.await;

        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Pending(current, _) if *current == generation) {
            *slot = match &result {
                Ok(handle) => Slot::Ready(handle.clone()),
                Err(_) => Slot::Empty,
            };
        }

        result
    }

    /// Drops the current instance without running the close hook. The next
    /// `acquire()` recreates it.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock();
        if !matches!(&*slot, Slot::Empty) {
            debug!(name = self.name, kind = self.kind, "resource invalidated");
        }
        *slot = Slot::Empty;
    }

    /// Runs the close hook on the live instance, if any, and leaves the
    /// wrapper empty.
    pub async fn close(&self) {
        let current = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Ready(handle) => Some(handle),
                _ => None,
            }
        };

        if let (Some(handle), Some(hook)) = (current, &self.close_hook) {
            debug!(name = self.name, kind = self.kind, "closing resource");
            hook(handle).await;
        }
    }
}
