// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-topic relays between the data plane and the local bus.
//!
//! - [`PublishRelay`]: remote Sinks -> broker Source -> local bus writer.
//! - [`SubscribeRelay`]: local bus subscription -> broker Sink -> remote Sources.

use crate::bus::{BusError, BusSubscription, BusWriter, LocalBus};
use crate::config::TransportConfig;
use crate::descriptor::MessageDescriptor;
use crate::transport::{EndpointAddr, Sink, Source, TransportError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Relay setup errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Local bus: {0}")]
    Bus(#[from] BusError),

    #[error("Transport: {0}")]
    Transport(#[from] TransportError),
}

/// Broker-wide relay counters.
#[derive(Debug)]
pub struct RelayStats {
    /// Messages received from remote publishers and written to the local bus.
    pub messages_in: AtomicU64,

    /// Bytes received from remote publishers.
    pub bytes_in: AtomicU64,

    /// Messages taken from the local bus and broadcast to remote subscribers.
    pub messages_out: AtomicU64,

    /// Bytes broadcast to remote subscribers.
    pub bytes_out: AtomicU64,

    /// Zero-length messages discarded.
    pub dropped_empty: AtomicU64,

    /// Local messages too large to frame for remote subscribers.
    pub dropped_oversized: AtomicU64,

    /// Local bus writes that failed.
    pub publish_errors: AtomicU64,

    created: Instant,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            messages_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            dropped_empty: AtomicU64::new(0),
            dropped_oversized: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped_empty: self.dropped_empty.load(Ordering::Relaxed),
            dropped_oversized: self.dropped_oversized.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }

    fn record_in(&self, len: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn record_out(&self, len: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub messages_in: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub bytes_out: u64,
    pub dropped_empty: u64,
    pub dropped_oversized: u64,
    pub publish_errors: u64,
    pub uptime_secs: u64,
}

/// Fans remote publishers of one topic into the local bus.
pub struct PublishRelay {
    descriptor: MessageDescriptor,
    writer: Box<dyn BusWriter>,
    source: Source,
    known_addrs: BTreeSet<EndpointAddr>,
    stats: Arc<RelayStats>,
}

impl PublishRelay {
    /// Open a local bus writer and an unconnected Source.
    pub fn open(
        descriptor: &MessageDescriptor,
        bus: &dyn LocalBus,
        transport: &TransportConfig,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError> {
        let writer = bus.advertise(descriptor)?;
        info!("Publish relay created for {}", descriptor);
        Ok(Self {
            descriptor: descriptor.clone(),
            writer,
            source: Source::new(transport)?,
            known_addrs: BTreeSet::new(),
            stats,
        })
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// Remember a publisher address; connect only if it is new.
    pub fn add_addr(&mut self, addr: &EndpointAddr) -> bool {
        if !self.known_addrs.insert(addr.clone()) {
            debug!("{}: publisher {} already known", self.descriptor.topic(), addr);
            return false;
        }
        self.source.connect(addr);
        info!(
            "{}: connecting to publisher {} ({} known)",
            self.descriptor.topic(),
            addr,
            self.known_addrs.len()
        );
        true
    }

    /// Addresses advertised for this topic. Never shrinks.
    pub fn known_addrs(&self) -> &BTreeSet<EndpointAddr> {
        &self.known_addrs
    }

    /// Number of publishers currently connected.
    pub fn connected_count(&self) -> usize {
        self.source.connected_count()
    }

    /// Move every pending remote message onto the local bus.
    pub fn pump(&mut self) -> usize {
        let empty_before = self.source.stats().empty_dropped;
        let writer = &self.writer;
        let stats = &self.stats;
        let topic = self.descriptor.topic();

        let delivered = self.source.poll(|payload| match writer.publish(payload) {
            Ok(()) => {
                trace!("{}: {} bytes into local bus", topic, payload.len());
                stats.record_in(payload.len());
            }
            Err(e) => {
                warn!("{}: local publish failed: {}", topic, e);
                stats.publish_errors.fetch_add(1, Ordering::Relaxed);
            }
        });

        let empty = self.source.stats().empty_dropped - empty_before;
        if empty > 0 {
            self.stats.dropped_empty.fetch_add(empty, Ordering::Relaxed);
        }
        delivered
    }

    /// Empty connect set and no traffic for `timeout`.
    ///
    /// Advertised addresses are never forgotten, so a relay that was ever
    /// advertised to stays.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.known_addrs.is_empty() && self.source.idle_for() >= timeout
    }
}

/// Fans the local bus traffic of one topic out to remote subscribers.
pub struct SubscribeRelay {
    descriptor: MessageDescriptor,
    // Dropped before `sink` so the bus callback releases its Sink handle.
    _subscription: Box<dyn BusSubscription>,
    sink: Sink,
}

impl SubscribeRelay {
    /// Bind a fresh Sink and subscribe to the local bus.
    ///
    /// Every local message is broadcast unchanged to the Sink's peers.
    pub fn open(
        descriptor: &MessageDescriptor,
        bus: &dyn LocalBus,
        bind: &EndpointAddr,
        transport: &TransportConfig,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError> {
        let sink = Sink::bind(bind, transport)?;

        let forward = sink.clone();
        let topic = descriptor.topic().to_string();
        let subscription = bus.subscribe(
            descriptor,
            Box::new(move |payload: &[u8]| {
                if payload.is_empty() {
                    stats.dropped_empty.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match forward.send(payload) {
                    Ok(peers) => {
                        trace!("{}: {} bytes to {} subscriber(s)", topic, payload.len(), peers);
                        stats.record_out(payload.len());
                    }
                    Err(e) => {
                        warn!("{}: local message not relayed: {}", topic, e);
                        stats.dropped_oversized.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }),
        )?;

        info!("Subscribe relay created for {} at {}", descriptor, sink.addr());
        Ok(Self {
            descriptor: descriptor.clone(),
            _subscription: subscription,
            sink,
        })
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// Address every subscriber of the topic connects to.
    pub fn addr(&self) -> &EndpointAddr {
        self.sink.addr()
    }

    /// Number of remote subscribers connected.
    pub fn peer_count(&self) -> usize {
        self.sink.peer_count()
    }

    /// Accept new subscribers and flush pending output.
    pub fn service(&self) {
        self.sink.poll();
    }

    /// No subscriber ever connected and nothing sent for `timeout`.
    ///
    /// A relay that had a peer is kept: that peer may be reconnecting to
    /// this exact address.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.sink.stats().peers_accepted == 0 && self.sink.idle_for() >= timeout
    }
}
