// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local Bus Abstraction
//!
//! The broker bridges a process-local publish/subscribe bus it does not
//! own. This module is the whole contract the relay engine needs from it:
//! open a writer, open a subscription, look up a parameter, and let the bus
//! run its own event step.
//!
//! # Integration
//!
//! Bind a real middleware by implementing [`LocalBus`]:
//!
//! ```ignore
//! impl LocalBus for RosNodeHandle {
//!     fn advertise(&self, descriptor: &MessageDescriptor) -> Result<Box<dyn BusWriter>, BusError> {
//!         // Create a type-erased publisher morphed to descriptor...
//!     }
//!     // ...
//! }
//! ```
//!
//! [`MemoryBus`] is an in-process implementation used by tests and by the
//! broker binary's loopback mode.

use crate::descriptor::MessageDescriptor;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, warn};

/// Local bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Cannot advertise {topic}: {reason}")]
    Advertise { topic: String, reason: String },

    #[error("Cannot subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Bus closed")]
    Closed,
}

/// Callback receiving raw payload bytes from the local bus.
pub type MessageCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Publish handle for one topic.
pub trait BusWriter: Send {
    /// Deliver raw bytes to every local listener of the topic.
    fn publish(&self, payload: &[u8]) -> Result<(), BusError>;

    /// Topic this writer publishes on.
    fn topic(&self) -> &str;
}

/// Subscription handle for one topic; dropping it stops delivery.
pub trait BusSubscription: Send {
    /// Topic this subscription listens on.
    fn topic(&self) -> &str;
}

/// Process-local publish/subscribe bus.
///
/// A topic's schema is fixed for its lifetime; advertising the same topic
/// with a different descriptor is the adapter's problem, not the caller's.
pub trait LocalBus: Send + Sync {
    /// Open a publish handle tagged with `descriptor`.
    fn advertise(&self, descriptor: &MessageDescriptor) -> Result<Box<dyn BusWriter>, BusError>;

    /// Deliver each message on `descriptor.topic()` to `on_message`.
    ///
    /// The callback runs synchronously inside [`LocalBus::poll_once`].
    fn subscribe(
        &self,
        descriptor: &MessageDescriptor,
        on_message: MessageCallback,
    ) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Best-effort parameter lookup; empty string when unset.
    fn get_param(&self, name: &str) -> String;

    /// Run queued bus events. Returns the number of callbacks invoked.
    fn poll_once(&self) -> usize;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Message recorded by a [`MemoryBus::recording`] bus at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub type_name: String,
    pub schema_hash: String,
    pub payload: Vec<u8>,
}

type SharedCallback = Arc<Mutex<MessageCallback>>;

#[derive(Default)]
struct BusState {
    queue: VecDeque<(String, Vec<u8>)>,
    subscribers: HashMap<String, Vec<(u64, SharedCallback)>>,
    schemas: HashMap<String, MessageDescriptor>,
    params: HashMap<String, String>,
    record: bool,
    published: Vec<PublishedMessage>,
    next_subscription: u64,
}

impl BusState {
    /// Remember the first schema seen per topic and flag later mismatches.
    fn note_schema(&mut self, descriptor: &MessageDescriptor) {
        match self.schemas.get(descriptor.topic()) {
            Some(existing) if !existing.is_compatible(descriptor) => {
                warn!(
                    "MemoryBus: topic {} opened as {} but already carries {}",
                    descriptor.topic(),
                    descriptor.schema_hash(),
                    existing.schema_hash()
                );
            }
            Some(_) => {}
            None => {
                self.schemas
                    .insert(descriptor.topic().to_string(), descriptor.clone());
            }
        }
    }
}

/// In-process bus: publishes are queued and delivered on [`LocalBus::poll_once`].
///
/// Delivered messages are not retained unless the bus was created with
/// [`MemoryBus::recording`].
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that also keeps a copy of every writer publish.
    ///
    /// The record grows without bound; meant for tests and inspection.
    pub fn recording() -> Self {
        let bus = Self::new();
        bus.state.lock().record = true;
        bus
    }

    /// Create a bus with preset parameters.
    pub fn with_params(params: HashMap<String, String>) -> Self {
        let bus = Self::new();
        bus.state.lock().params = params;
        bus
    }

    /// Set a parameter.
    pub fn set_param(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.lock().params.insert(name.into(), value.into());
    }

    /// Queue a message as if a local publisher had sent it.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        self.state
            .lock()
            .queue
            .push_back((topic.to_string(), payload.to_vec()));
    }

    /// Payloads published on `topic` through writers, oldest first.
    ///
    /// Always empty unless the bus is [`MemoryBus::recording`].
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Every message published through writers, on a recording bus.
    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

struct MemoryWriter {
    descriptor: MessageDescriptor,
    state: Weak<Mutex<BusState>>,
}

impl BusWriter for MemoryWriter {
    fn publish(&self, payload: &[u8]) -> Result<(), BusError> {
        let state = self.state.upgrade().ok_or(BusError::Closed)?;
        let mut state = state.lock();
        let topic = self.descriptor.topic().to_string();
        if state.record {
            state.published.push(PublishedMessage {
                topic: topic.clone(),
                type_name: self.descriptor.type_name().to_string(),
                schema_hash: self.descriptor.schema_hash().to_string(),
                payload: payload.to_vec(),
            });
        }
        state.queue.push_back((topic, payload.to_vec()));
        Ok(())
    }

    fn topic(&self) -> &str {
        self.descriptor.topic()
    }
}

struct MemorySubscription {
    id: u64,
    topic: String,
    state: Weak<Mutex<BusState>>,
}

impl BusSubscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock();
            if let Some(slots) = state.subscribers.get_mut(&self.topic) {
                slots.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl LocalBus for MemoryBus {
    fn advertise(&self, descriptor: &MessageDescriptor) -> Result<Box<dyn BusWriter>, BusError> {
        self.state.lock().note_schema(descriptor);
        debug!("MemoryBus: advertise {}", descriptor);
        Ok(Box::new(MemoryWriter {
            descriptor: descriptor.clone(),
            state: Arc::downgrade(&self.state),
        }))
    }

    fn subscribe(
        &self,
        descriptor: &MessageDescriptor,
        on_message: MessageCallback,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let mut state = self.state.lock();
        state.note_schema(descriptor);

        let id = state.next_subscription;
        state.next_subscription += 1;
        state
            .subscribers
            .entry(descriptor.topic().to_string())
            .or_default()
            .push((id, Arc::new(Mutex::new(on_message))));
        debug!("MemoryBus: subscribe {}", descriptor);

        Ok(Box::new(MemorySubscription {
            id,
            topic: descriptor.topic().to_string(),
            state: Arc::downgrade(&self.state),
        }))
    }

    fn get_param(&self, name: &str) -> String {
        self.state
            .lock()
            .params
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn poll_once(&self) -> usize {
        // Callbacks run without the bus lock held so they may publish.
        let pending: Vec<(Vec<SharedCallback>, Vec<u8>)> = {
            let mut state = self.state.lock();
            let queued: Vec<_> = state.queue.drain(..).collect();
            queued
                .into_iter()
                .map(|(topic, payload)| {
                    let callbacks = state
                        .subscribers
                        .get(&topic)
                        .map(|slots| slots.iter().map(|(_, cb)| cb.clone()).collect())
                        .unwrap_or_default();
                    (callbacks, payload)
                })
                .collect()
        };

        let mut invoked = 0;
        for (callbacks, payload) in pending {
            for callback in callbacks {
                (&mut *callback.lock())(&payload);
                invoked += 1;
            }
        }
        invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(topic: &str) -> MessageDescriptor {
        MessageDescriptor::new(topic, "h1", "std/String", "string data")
    }

    fn collector() -> (Arc<Mutex<Vec<Vec<u8>>>>, MessageCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |m: &[u8]| sink.lock().push(m.to_vec())))
    }

    #[test]
    fn test_publish_delivers_on_poll() {
        let bus = MemoryBus::recording();
        let (seen, callback) = collector();
        let _sub = bus.subscribe(&descriptor("chatter"), callback).unwrap();
        let writer = bus.advertise(&descriptor("chatter")).unwrap();

        writer.publish(b"hello").unwrap();
        assert!(seen.lock().is_empty());

        assert_eq!(bus.poll_once(), 1);
        assert_eq!(*seen.lock(), vec![b"hello".to_vec()]);
        assert_eq!(bus.published("chatter"), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = MemoryBus::new();
        let (seen_b, callback) = collector();
        let _sub = bus.subscribe(&descriptor("b"), callback).unwrap();

        bus.inject("a", &[1]);
        bus.poll_once();
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_dropping_subscription_stops_delivery() {
        let bus = MemoryBus::new();
        let (seen, callback) = collector();
        let sub = bus.subscribe(&descriptor("t"), callback).unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count("t"), 0);

        bus.inject("t", &[9]);
        assert_eq!(bus.poll_once(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_params() {
        let bus = MemoryBus::with_params(HashMap::from([("rate".to_string(), "10".to_string())]));
        assert_eq!(bus.get_param("rate"), "10");
        assert_eq!(bus.get_param("missing"), "");

        bus.set_param("rate", "20");
        assert_eq!(bus.get_param("rate"), "20");
    }

    #[test]
    fn test_callback_may_publish() {
        let bus = MemoryBus::recording();
        let writer = bus.advertise(&descriptor("out")).unwrap();
        let _sub = bus
            .subscribe(
                &descriptor("in"),
                Box::new(move |m: &[u8]| {
                    let _ = writer.publish(m);
                }),
            )
            .unwrap();

        bus.inject("in", b"x");
        bus.poll_once();
        assert_eq!(bus.published("out"), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_default_bus_retains_nothing() {
        let bus = MemoryBus::new();
        let (seen, callback) = collector();
        let _sub = bus.subscribe(&descriptor("chatter"), callback).unwrap();
        let writer = bus.advertise(&descriptor("chatter")).unwrap();

        for i in 0..1000u32 {
            writer.publish(&i.to_be_bytes()).unwrap();
            bus.poll_once();
        }
        assert_eq!(seen.lock().len(), 1000);
        assert!(bus.published("chatter").is_empty());
        assert!(bus.published_messages().is_empty());
        assert!(bus.state.lock().queue.is_empty());
    }

    #[test]
    fn test_writer_after_bus_dropped() {
        let bus = MemoryBus::new();
        let writer = bus.advertise(&descriptor("t")).unwrap();
        drop(bus);
        assert!(matches!(writer.publish(b"late"), Err(BusError::Closed)));
    }
}
