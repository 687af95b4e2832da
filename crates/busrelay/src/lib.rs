// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! busrelay: Local Bus Relay Broker
//!
//! Bridges a process-local publish/subscribe bus with remote nodes over TCP.
//! The broker only brokers addresses; payloads flow peer-to-peer as opaque
//! bytes.
//!
//! # Features
//!
//! - **Discovery**: `publish`, `subscribe` and `getParam` over a NUL-terminated
//!   JSON control channel
//! - **Fan-in**: every remote publisher of a topic is relayed into the local bus
//! - **Fan-out**: one relay Sink per topic, shared by every remote subscriber
//! - **Node library**: bounded-timeout registration, non-blocking `poll_once`
//!
//! # Quick Start
//!
//! ```bash
//! # Broker over the in-memory loopback bus on the default ports
//! busrelay-broker
//!
//! # Custom ports and config
//! busrelay-broker --control-port 6555 --notify-port 6556 --config broker.json
//! ```
//!
//! # Configuration File
//!
//! ```json
//! {
//!   "control_port": 5555,
//!   "notify_port": 5556,
//!   "schema_policy": "warn",
//!   "relay_idle_timeout_secs": 300,
//!   "transport": { "advertise_host": "192.168.1.10" },
//!   "params": { "rate": "10" }
//! }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod descriptor;
pub mod node;
pub mod protocol;
pub mod transport;

pub use broker::{Broker, BrokerError, RegistryError, RelayStatsSnapshot};
pub use bus::{BusError, BusSubscription, BusWriter, LocalBus, MemoryBus, MessageCallback};
pub use config::{BrokerConfig, ConfigError, NodeConfig, SchemaPolicy, TransportConfig};
pub use descriptor::MessageDescriptor;
pub use node::{EndpointInfo, HandleId, HandleState, Node, NodeError, PublisherId, SubscriberId};
pub use protocol::{ControlRequest, ControlResponse, ProtocolError};
pub use transport::{EndpointAddr, Sink, Source, TransportError};
