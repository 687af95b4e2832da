// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay broker.
//!
//! Owns the control responder, the reserved notify Sink and the relay
//! registry. Everything is driven by [`Broker::tick`] from one thread; one
//! tick carries a remote message through the local bus and back out.

use crate::bus::LocalBus;
use crate::config::{BrokerConfig, ConfigError};
use crate::descriptor::MessageDescriptor;
use crate::protocol::{
    ControlRequest, ControlResponse, ErrorReply, ParamReply, PublishReply, SubscribeReply,
    ERR_MALFORMED,
};
use crate::transport::{EndpointAddr, Sink, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod control;
pub mod registry;
pub mod relay;

pub use control::{ControlServer, PendingRequest};
pub use registry::{RegistryError, RelayRegistry};
pub use relay::{PublishRelay, RelayError, RelayStats, RelayStatsSnapshot, SubscribeRelay};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Topic relay broker bridging a local bus with remote nodes.
pub struct Broker {
    config: BrokerConfig,
    bus: Arc<dyn LocalBus>,
    control: ControlServer,
    notify: Sink,
    registry: RelayRegistry,
}

impl Broker {
    /// Bind the control and notify channels.
    pub fn bind(config: BrokerConfig, bus: Arc<dyn LocalBus>) -> Result<Self, BrokerError> {
        config.validate()?;

        let control = ControlServer::bind(
            &config.control_endpoint(),
            &config.transport.advertise_host,
            config.max_control_message_size,
        )?;
        let notify = Sink::bind(&config.notify_endpoint(), &config.transport)?;
        info!(
            "Broker listening: control {} notify {}",
            control.addr(),
            notify.addr()
        );

        let registry = RelayRegistry::new(&config);
        Ok(Self {
            config,
            bus,
            control,
            notify,
            registry,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Connectable control channel address.
    pub fn control_addr(&self) -> &EndpointAddr {
        self.control.addr()
    }

    /// Connectable notify channel address.
    pub fn notify_addr(&self) -> &EndpointAddr {
        self.notify.addr()
    }

    /// Register a remote publisher's Sink for `descriptor.topic()`.
    ///
    /// Returns whether the address was new. Registering the same address
    /// twice is a no-op.
    pub fn advertise(
        &mut self,
        descriptor: &MessageDescriptor,
        addr: &EndpointAddr,
    ) -> Result<bool, RegistryError> {
        self.registry.advertise(self.bus.as_ref(), descriptor, addr)
    }

    /// Address remote subscribers of `descriptor.topic()` connect to.
    ///
    /// The first call for a topic creates its relay; later calls return the
    /// same address.
    pub fn subscribe(&mut self, descriptor: &MessageDescriptor) -> Result<EndpointAddr, RegistryError> {
        self.registry.subscribe(self.bus.as_ref(), descriptor)
    }

    /// Parameter lookup through the local bus.
    pub fn get_param(&self, name: &str) -> String {
        self.bus.get_param(name)
    }

    /// Execute one decoded control request.
    pub fn handle_request(&mut self, request: ControlRequest) -> ControlResponse {
        debug!("Control request: {}", request.command());
        match request {
            ControlRequest::Publish { data } => {
                if data.topic.is_empty() {
                    return ControlResponse::error(ERR_MALFORMED, "publish: empty topic");
                }
                let addr = match data.endpoint() {
                    Ok(addr) => addr,
                    Err(e) => return ControlResponse::error(e.code(), e.to_string()),
                };
                match self.advertise(&data.descriptor(), &addr) {
                    Ok(_) => ControlResponse::Publish(PublishReply::echo(data)),
                    Err(e) => {
                        warn!("publish {} from {} refused: {}", data.topic, addr, e);
                        ControlResponse::error(e.code(), e.to_string())
                    }
                }
            }
            ControlRequest::Subscribe { data } => {
                if data.topic.is_empty() {
                    return ControlResponse::error(ERR_MALFORMED, "subscribe: empty topic");
                }
                match self.subscribe(&data.descriptor()) {
                    Ok(addr) => ControlResponse::Subscribe(SubscribeReply {
                        topic: data.topic,
                        addr: addr.to_string(),
                    }),
                    Err(e) => {
                        warn!("subscribe {} refused: {}", data.topic, e);
                        ControlResponse::error(e.code(), e.to_string())
                    }
                }
            }
            ControlRequest::GetParam { name } => {
                let value = self.get_param(&name);
                ControlResponse::Param(ParamReply { name, value })
            }
        }
    }

    /// One pass over every relay and the control channel.
    ///
    /// Returns the number of data messages and control requests handled.
    pub fn poll_all(&mut self) -> usize {
        self.poll_all_within(Duration::ZERO)
    }

    /// Like [`Broker::poll_all`], waiting up to `wait` for control traffic.
    fn poll_all_within(&mut self, wait: Duration) -> usize {
        let mut work = self.serve_control(wait);
        work += self.registry.pump_publishers();
        self.registry.service_sinks();
        self.notify.poll();
        work
    }

    fn serve_control(&mut self, wait: Duration) -> usize {
        let mut work = 0;
        for pending in self.control.poll_requests(wait) {
            let response = match pending.request {
                Ok(request) => self.handle_request(request),
                Err(e) => {
                    warn!("Bad control request from client {}: {}", pending.client, e);
                    ControlResponse::Error(ErrorReply::from(&e))
                }
            };
            self.control.reply(pending.client, &response);
            work += 1;
        }
        work
    }

    /// Relays and control, then local bus events; collect idle relays.
    ///
    /// Remote messages pumped into the bus are delivered by the bus step of
    /// the same tick.
    pub fn tick(&mut self) -> usize {
        self.tick_within(Duration::ZERO)
    }

    fn tick_within(&mut self, wait: Duration) -> usize {
        let mut work = self.poll_all_within(wait);
        work += self.bus.poll_once();
        if let Some(timeout) = self.config.relay_idle_timeout() {
            let collected = self.registry.collect_idle(timeout);
            if collected > 0 {
                debug!("Collected {} idle relay(s)", collected);
            }
        }
        work
    }

    /// Tick until `running` is cleared.
    ///
    /// After a tick with nothing to do, the next one blocks on the control
    /// channel for up to `tick_interval_ms`.
    pub fn run(&mut self, running: &AtomicBool) {
        info!("Broker loop started");
        let mut wait = Duration::ZERO;
        while running.load(Ordering::SeqCst) {
            wait = if self.tick_within(wait) == 0 {
                self.config.tick_interval()
            } else {
                Duration::ZERO
            };
        }
        info!("Broker loop stopped");
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.registry.stats()
    }

    pub fn publish_relay_count(&self) -> usize {
        self.registry.publish_relay_count()
    }

    pub fn subscribe_relay_count(&self) -> usize {
        self.registry.subscribe_relay_count()
    }

    /// Publisher addresses known for `topic`.
    pub fn known_addrs(&self, topic: &str) -> Vec<EndpointAddr> {
        self.registry.known_addrs(topic)
    }

    /// Remote subscribers connected to `topic`'s relay.
    pub fn subscribe_peer_count(&self, topic: &str) -> usize {
        self.registry.subscribe_peer_count(topic)
    }

    /// Number of control clients connected.
    pub fn control_client_count(&self) -> usize {
        self.control.client_count()
    }
}
