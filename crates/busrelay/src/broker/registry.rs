// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic relay registry.

use super::relay::{PublishRelay, RelayError, RelayStats, RelayStatsSnapshot, SubscribeRelay};
use crate::bus::LocalBus;
use crate::config::{BrokerConfig, SchemaPolicy, TransportConfig};
use crate::descriptor::MessageDescriptor;
use crate::protocol::{ERR_RELAY_SETUP, ERR_SCHEMA_MISMATCH};
use crate::transport::EndpointAddr;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Registration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Topic {topic} carries schema {expected}, registration used {got}")]
    SchemaMismatch {
        topic: String,
        expected: String,
        got: String,
    },

    #[error("Cannot create relay for {topic}: {source}")]
    Setup {
        topic: String,
        #[source]
        source: RelayError,
    },
}

impl RegistryError {
    /// Error code sent back to the registering node.
    pub fn code(&self) -> u32 {
        match self {
            RegistryError::SchemaMismatch { .. } => ERR_SCHEMA_MISMATCH,
            RegistryError::Setup { .. } => ERR_RELAY_SETUP,
        }
    }
}

/// Topic -> relay maps for both directions.
///
/// Relays are created lazily on the first registration of a topic and are
/// reused by every later registration of it. A subscribe relay recreated
/// after collection binds its previous port again when it can.
pub struct RelayRegistry {
    publishers: HashMap<String, PublishRelay>,
    subscribers: HashMap<String, SubscribeRelay>,
    retired_ports: HashMap<String, u16>,
    schema_policy: SchemaPolicy,
    transport: TransportConfig,
    data_endpoint: EndpointAddr,
    stats: Arc<RelayStats>,
}

impl RelayRegistry {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            publishers: HashMap::new(),
            subscribers: HashMap::new(),
            retired_ports: HashMap::new(),
            schema_policy: config.schema_policy,
            transport: config.transport.clone(),
            data_endpoint: config.data_endpoint(),
            stats: Arc::new(RelayStats::new()),
        }
    }

    fn check_schema(
        &self,
        existing: &MessageDescriptor,
        incoming: &MessageDescriptor,
    ) -> Result<(), RegistryError> {
        if existing.is_compatible(incoming) {
            return Ok(());
        }
        match self.schema_policy {
            SchemaPolicy::Ignore => Ok(()),
            SchemaPolicy::Warn => {
                warn!(
                    "Schema mismatch on {}: relay has {}, registration has {}",
                    existing.topic(),
                    existing.schema_hash(),
                    incoming.schema_hash()
                );
                Ok(())
            }
            SchemaPolicy::Reject => Err(RegistryError::SchemaMismatch {
                topic: existing.topic().to_string(),
                expected: existing.schema_hash().to_string(),
                got: incoming.schema_hash().to_string(),
            }),
        }
    }

    /// Register a remote publisher address for a topic.
    ///
    /// Returns whether the address was new to the topic.
    pub fn advertise(
        &mut self,
        bus: &dyn LocalBus,
        descriptor: &MessageDescriptor,
        addr: &EndpointAddr,
    ) -> Result<bool, RegistryError> {
        let topic = descriptor.topic();
        if let Some(relay) = self.publishers.get(topic) {
            self.check_schema(relay.descriptor(), descriptor)?;
        } else {
            let relay = PublishRelay::open(descriptor, bus, &self.transport, self.stats.clone())
                .map_err(|source| RegistryError::Setup {
                    topic: topic.to_string(),
                    source,
                })?;
            self.publishers.insert(topic.to_string(), relay);
        }

        Ok(self
            .publishers
            .get_mut(topic)
            .map(|relay| relay.add_addr(addr))
            .unwrap_or(false))
    }

    /// Address remote subscribers of a topic connect to.
    pub fn subscribe(
        &mut self,
        bus: &dyn LocalBus,
        descriptor: &MessageDescriptor,
    ) -> Result<EndpointAddr, RegistryError> {
        let topic = descriptor.topic();
        if let Some(relay) = self.subscribers.get(topic) {
            self.check_schema(relay.descriptor(), descriptor)?;
            return Ok(relay.addr().clone());
        }

        let relay = match self.reopen_subscriber(bus, descriptor) {
            Some(relay) => relay,
            None => SubscribeRelay::open(
                descriptor,
                bus,
                &self.data_endpoint,
                &self.transport,
                self.stats.clone(),
            )
            .map_err(|source| RegistryError::Setup {
                topic: topic.to_string(),
                source,
            })?,
        };
        let addr = relay.addr().clone();
        self.subscribers.insert(topic.to_string(), relay);
        Ok(addr)
    }

    /// Recreate a collected subscribe relay on its old port.
    fn reopen_subscriber(
        &mut self,
        bus: &dyn LocalBus,
        descriptor: &MessageDescriptor,
    ) -> Option<SubscribeRelay> {
        let port = self.retired_ports.remove(descriptor.topic())?;
        let bind = self.data_endpoint.with_port(port);
        match SubscribeRelay::open(descriptor, bus, &bind, &self.transport, self.stats.clone()) {
            Ok(relay) => Some(relay),
            Err(e) => {
                warn!(
                    "{}: cannot rebind previous port {} ({}), using a new one",
                    descriptor.topic(),
                    port,
                    e
                );
                None
            }
        }
    }

    /// Drain every publish relay into the local bus.
    pub fn pump_publishers(&mut self) -> usize {
        self.publishers.values_mut().map(PublishRelay::pump).sum()
    }

    /// Accept and flush on every subscribe relay Sink.
    pub fn service_sinks(&self) {
        for relay in self.subscribers.values() {
            relay.service();
        }
    }

    /// Drop relays idle for `timeout`. Returns how many were removed.
    ///
    /// Only relays nobody depends on qualify: a publish relay with an empty
    /// connect set, a subscribe relay no peer ever connected to.
    pub fn collect_idle(&mut self, timeout: Duration) -> usize {
        let before = self.publishers.len() + self.subscribers.len();

        self.publishers.retain(|topic, relay| {
            let idle = relay.is_idle(timeout);
            if idle {
                info!("Collecting idle publish relay for {}", topic);
            }
            !idle
        });
        let retired = &mut self.retired_ports;
        self.subscribers.retain(|topic, relay| {
            let idle = relay.is_idle(timeout);
            if idle {
                info!("Collecting idle subscribe relay for {} at {}", topic, relay.addr());
                retired.insert(topic.clone(), relay.addr().port());
            }
            !idle
        });

        before - (self.publishers.len() + self.subscribers.len())
    }

    pub fn publish_relay_count(&self) -> usize {
        self.publishers.len()
    }

    pub fn subscribe_relay_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publisher addresses known for `topic`, in order.
    pub fn known_addrs(&self, topic: &str) -> Vec<EndpointAddr> {
        self.publishers
            .get(topic)
            .map(|relay| relay.known_addrs().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remote subscribers connected to `topic`'s relay.
    pub fn subscribe_peer_count(&self, topic: &str) -> usize {
        self.subscribers
            .get(topic)
            .map(SubscribeRelay::peer_count)
            .unwrap_or(0)
    }

    /// Subscribe relay address for `topic`, if one exists.
    pub fn subscribe_addr(&self, topic: &str) -> Option<EndpointAddr> {
        self.subscribers.get(topic).map(|relay| relay.addr().clone())
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}
