// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node client library.
//!
//! A [`Node`] registers publishers and subscribers with a broker and then
//! moves data peer-to-peer:
//!
//! ```text
//!  advertise:  Node Sink  ----data---->  Broker Source -> local bus
//!  subscribe:  local bus -> Broker Sink  ----data---->  Node Source -> callback
//! ```
//!
//! Registration calls block for at most `rpc_timeout_ms`; everything else
//! is non-blocking and driven by [`Node::poll_once`].
//!
//! # Example
//!
//! ```ignore
//! let mut node = Node::connect(NodeConfig::default())?;
//! let temp = MessageDescriptor::new("temp", md5, "sensor/Temp", def);
//! let id = node.advertise(&temp)?;
//! node.subscribe(&temp.for_topic("/echo"), |bytes| println!("{} bytes", bytes.len()))?;
//! loop {
//!     node.publish(id, &payload)?;
//!     node.poll_once();
//! }
//! ```

use crate::bus::MessageCallback;
use crate::config::{ConfigError, NodeConfig};
use crate::descriptor::MessageDescriptor;
use crate::protocol::{
    ControlRequest, ParamReply, ProtocolError, PublishData, PublishReply, SubscribeData,
    SubscribeReply,
};
use crate::transport::{EndpointAddr, Sink, Source, TransportError};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub mod client;

pub use client::ControlClient;

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Cannot connect to broker at {endpoint}: {source}")]
    Connect {
        endpoint: EndpointAddr,
        #[source]
        source: io::Error,
    },

    #[error("No reply from broker at {endpoint} within {after:?}")]
    Timeout { endpoint: EndpointAddr, after: Duration },

    #[error("Broker at {0} closed the control channel")]
    Disconnected(EndpointAddr),

    #[error("Broker rejected request (code {code}): {message}")]
    Rejected { code: u32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[source] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Parameter {name} has unparseable value {value:?}")]
    InvalidParam { name: String, value: String },

    #[error("Unknown handle {0}")]
    UnknownHandle(HandleId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for NodeError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Remote { code, message } => NodeError::Rejected { code, message },
            other => NodeError::Protocol(other),
        }
    }
}

/// Publisher handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublisherId(u64);

/// Subscriber handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

/// Either kind of handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleId {
    Publisher(PublisherId),
    Subscriber(SubscriberId),
}

impl From<PublisherId> for HandleId {
    fn from(id: PublisherId) -> Self {
        HandleId::Publisher(id)
    }
}

impl From<SubscriberId> for HandleId {
    fn from(id: SubscriberId) -> Self {
        HandleId::Subscriber(id)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleId::Publisher(PublisherId(id)) => write!(f, "publisher #{}", id),
            HandleId::Subscriber(SubscriberId(id)) => write!(f, "subscriber #{}", id),
        }
    }
}

/// Lifecycle of a publisher or subscriber handle.
///
/// `Unregistered -> Registering -> Active -> Closed`, never backwards. A
/// failed registration returns the handle to `Unregistered` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Unregistered,
    Registering,
    Active,
    Closed,
}

/// Debug view of one registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: HandleId,
    pub descriptor: MessageDescriptor,
    /// Own Sink address for publishers, broker relay address for subscribers.
    pub addr: EndpointAddr,
}

struct PublisherEntry {
    descriptor: MessageDescriptor,
    sink: Sink,
}

struct SubscriberEntry {
    descriptor: MessageDescriptor,
    addr: EndpointAddr,
    source: Source,
    callback: MessageCallback,
}

/// Broker client owning its publisher and subscriber endpoints.
pub struct Node {
    config: NodeConfig,
    client: ControlClient,
    notify: Source,
    publishers: BTreeMap<PublisherId, PublisherEntry>,
    subscribers: BTreeMap<SubscriberId, SubscriberEntry>,
    states: BTreeMap<HandleId, HandleState>,
    next_id: u64,
}

impl Node {
    /// Connect to the broker named by `config`.
    pub fn connect(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let mut client = ControlClient::new(&config);
        client.connect()?;

        let mut notify = Source::new(&config.transport)?;
        notify.connect(&config.notify_endpoint());

        info!("Node connected to broker at {}", client.endpoint());
        Ok(Self {
            config,
            client,
            notify,
            publishers: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            states: BTreeMap::new(),
            next_id: 0,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Bind a Sink for `descriptor.topic()` and register it with the broker.
    pub fn advertise(&mut self, descriptor: &MessageDescriptor) -> Result<PublisherId, NodeError> {
        let id = PublisherId(self.allocate());
        self.states.insert(id.into(), HandleState::Registering);

        match self.register_publisher(descriptor) {
            Ok(sink) => {
                info!("Publishing {} on {}", descriptor, sink.addr());
                self.publishers.insert(
                    id,
                    PublisherEntry {
                        descriptor: descriptor.clone(),
                        sink,
                    },
                );
                self.states.insert(id.into(), HandleState::Active);
                Ok(id)
            }
            Err(e) => {
                self.states.remove(&HandleId::from(id));
                warn!("advertise {} failed: {}", descriptor.topic(), e);
                Err(e)
            }
        }
    }

    fn register_publisher(&mut self, descriptor: &MessageDescriptor) -> Result<Sink, NodeError> {
        let sink = Sink::bind(&self.config.data_endpoint(), &self.config.transport)?;
        let data = PublishData::new(descriptor, sink.addr());
        let reply: PublishReply = self.client.call(&ControlRequest::Publish { data: data.clone() })?;
        if reply.data != data {
            debug!("Broker echo differs from publish request: {:?}", reply.data);
        }
        Ok(sink)
    }

    /// Broadcast `payload` to every peer connected to the publisher's Sink.
    ///
    /// Returns the number of peers it was queued for. Payloads larger than
    /// `transport.max_frame_size` fail with [`TransportError::FrameTooLarge`].
    pub fn publish(&mut self, id: PublisherId, payload: &[u8]) -> Result<usize, NodeError> {
        let entry = self
            .publishers
            .get(&id)
            .ok_or(NodeError::UnknownHandle(id.into()))?;
        Ok(entry.sink.send(payload)?)
    }

    /// Ask the broker for the topic's relay address and connect to it.
    ///
    /// `callback` runs inside [`Node::poll_once`] once per message.
    pub fn subscribe<F>(&mut self, descriptor: &MessageDescriptor, callback: F) -> Result<SubscriberId, NodeError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let id = SubscriberId(self.allocate());
        self.states.insert(id.into(), HandleState::Registering);

        let (addr, mut source) = match self.open_subscriber(descriptor) {
            Ok(opened) => opened,
            Err(e) => {
                self.states.remove(&HandleId::from(id));
                warn!("subscribe {} failed: {}", descriptor.topic(), e);
                return Err(e);
            }
        };
        source.connect(&addr);
        info!("Subscribed to {} via {}", descriptor, addr);

        self.subscribers.insert(
            id,
            SubscriberEntry {
                descriptor: descriptor.clone(),
                addr,
                source,
                callback: Box::new(callback),
            },
        );
        self.states.insert(id.into(), HandleState::Active);
        Ok(id)
    }

    fn open_subscriber(
        &mut self,
        descriptor: &MessageDescriptor,
    ) -> Result<(EndpointAddr, Source), NodeError> {
        let reply: SubscribeReply = self.client.call(&ControlRequest::Subscribe {
            data: SubscribeData::new(descriptor),
        })?;
        let addr = reply.endpoint()?;
        Ok((addr, Source::new(&self.config.transport)?))
    }

    /// Raw parameter value; empty when unset.
    pub fn param_raw(&mut self, name: &str) -> Result<String, NodeError> {
        let reply: ParamReply = self.client.call(&ControlRequest::GetParam {
            name: name.to_string(),
        })?;
        Ok(reply.value)
    }

    /// Parameter parsed into `T`; `None` when unset or empty.
    pub fn param_opt<T: FromStr>(&mut self, name: &str) -> Result<Option<T>, NodeError> {
        let value = self.param_raw(name)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse().map(Some).map_err(|_| NodeError::InvalidParam {
            name: name.to_string(),
            value,
        })
    }

    /// Parameter parsed into `T`, or `default` when unset.
    pub fn param_or<T: FromStr>(&mut self, name: &str, default: T) -> Result<T, NodeError> {
        Ok(self.param_opt(name)?.unwrap_or(default))
    }

    /// Parameter parsed into `T`, or `T::default()` when unset.
    pub fn param<T: FromStr + Default>(&mut self, name: &str) -> Result<T, NodeError> {
        Ok(self.param_opt(name)?.unwrap_or_default())
    }

    /// Deliver pending subscriber messages and service publisher Sinks.
    ///
    /// Returns the number of callbacks invoked. Never blocks.
    pub fn poll_once(&mut self) -> usize {
        let mut delivered = 0;
        for entry in self.subscribers.values_mut() {
            let SubscriberEntry {
                source, callback, ..
            } = entry;
            delivered += source.poll(|payload| callback(payload));
        }

        for entry in self.publishers.values() {
            entry.sink.poll();
        }

        self.notify.poll(|payload| {
            trace!("notify: {} bytes ignored", payload.len());
        });
        delivered
    }

    /// Close a publisher's Sink. The broker keeps the address and retries it.
    pub fn close_publisher(&mut self, id: PublisherId) -> Result<(), NodeError> {
        let entry = self
            .publishers
            .remove(&id)
            .ok_or(NodeError::UnknownHandle(id.into()))?;
        self.states.insert(id.into(), HandleState::Closed);
        debug!("Closed publisher on {}", entry.descriptor.topic());
        Ok(())
    }

    /// Disconnect a subscriber and drop its callback.
    pub fn close_subscriber(&mut self, id: SubscriberId) -> Result<(), NodeError> {
        let entry = self
            .subscribers
            .remove(&id)
            .ok_or(NodeError::UnknownHandle(id.into()))?;
        self.states.insert(id.into(), HandleState::Closed);
        debug!("Closed subscriber on {}", entry.descriptor.topic());
        Ok(())
    }

    /// Lifecycle state of a handle.
    pub fn state(&self, id: impl Into<HandleId>) -> HandleState {
        self.states
            .get(&id.into())
            .copied()
            .unwrap_or(HandleState::Unregistered)
    }

    /// Whether a subscriber's Source is connected to its relay.
    pub fn is_subscriber_connected(&self, id: SubscriberId) -> bool {
        self.subscribers
            .get(&id)
            .map(|entry| entry.source.is_connected(&entry.addr))
            .unwrap_or(false)
    }

    /// Number of peers connected to a publisher's Sink.
    pub fn publisher_peer_count(&self, id: PublisherId) -> usize {
        self.publishers
            .get(&id)
            .map(|entry| entry.sink.peer_count())
            .unwrap_or(0)
    }

    /// Every live endpoint, publishers first.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let publishers = self.publishers.iter().map(|(id, entry)| EndpointInfo {
            id: (*id).into(),
            descriptor: entry.descriptor.clone(),
            addr: entry.sink.addr().clone(),
        });
        let subscribers = self.subscribers.iter().map(|(id, entry)| EndpointInfo {
            id: (*id).into(),
            descriptor: entry.descriptor.clone(),
            addr: entry.addr.clone(),
        });
        publishers.chain(subscribers).collect()
    }
}
