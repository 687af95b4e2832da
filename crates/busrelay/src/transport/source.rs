// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiving side of the data plane.
//!
//! A [`Source`] keeps one link per target address:
//!
//! ```text
//!      connect()
//!          |
//!          v
//!      +--------+  retry_at reached   +------------+
//!      |  Idle  |-------------------->| Connecting |
//!      +--------+                     +-----+------+
//!          ^   ^   failed / timed out       |
//!          |   +----------------------------+
//!          |                                | established
//!          |   EOF / error            +-----v------+
//!          +--------------------------| Connected  |
//!                                     +------------+
//! ```
//!
//! Targets are never forgotten on failure; the link backs off and retries
//! until [`Source::disconnect`] removes the target.

use super::frame_codec::FrameCodec;
use super::{wait_ready, EndpointAddr, Readiness, TransportError, MAX_EVENTS, STREAM_INTEREST};
use crate::config::TransportConfig;
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Source statistics.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    /// Non-empty messages delivered to the caller.
    pub messages_received: u64,
    /// Payload bytes delivered to the caller.
    pub bytes_received: u64,
    /// Zero-length frames discarded.
    pub empty_dropped: u64,
    /// Connections established (including reconnects).
    pub connects: u64,
    /// Failed or timed-out connect attempts.
    pub connect_failures: u64,
}

enum Link {
    Idle {
        retry_at: Instant,
    },
    Connecting {
        stream: TcpStream,
        started: Instant,
    },
    Connected {
        stream: TcpStream,
        codec: FrameCodec,
    },
}

/// One target address. Its token stays the same across reconnects.
struct Target {
    addr: EndpointAddr,
    link: Link,
    failures: u32,
}

/// An endpoint receiving byte messages from any number of Sinks.
pub struct Source {
    poll: Poll,
    events: Events,
    targets: HashMap<Token, Target>,
    by_addr: BTreeMap<EndpointAddr, Token>,
    next_token: usize,
    config: TransportConfig,
    last_active: Instant,
    stats: SourceStats,
}

impl Source {
    /// Create a Source with no targets.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
            targets: HashMap::new(),
            by_addr: BTreeMap::new(),
            next_token: 0,
            config: config.clone(),
            last_active: Instant::now(),
            stats: SourceStats::default(),
        })
    }

    /// Add a target and start connecting to it.
    ///
    /// Returns `false` (and does nothing) if the address is already a
    /// target, so an address is never connected twice.
    pub fn connect(&mut self, addr: &EndpointAddr) -> bool {
        if self.by_addr.contains_key(addr) {
            trace!("Source already targets {}", addr);
            return false;
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        let now = Instant::now();
        let mut target = Target {
            addr: addr.clone(),
            link: Link::Idle { retry_at: now },
            failures: 0,
        };
        on_timer(
            token,
            &mut target,
            self.poll.registry(),
            &self.config,
            &mut self.stats,
            now,
        );
        self.by_addr.insert(addr.clone(), token);
        self.targets.insert(token, target);
        true
    }

    /// Remove a target, closing its connection.
    pub fn disconnect(&mut self, addr: &EndpointAddr) -> bool {
        let Some(token) = self.by_addr.remove(addr) else {
            return false;
        };
        if let Some(mut target) = self.targets.remove(&token) {
            close_link(&mut target.link, self.poll.registry());
        }
        true
    }

    /// All target addresses, connected or not.
    pub fn targets(&self) -> impl Iterator<Item = &EndpointAddr> {
        self.by_addr.keys()
    }

    pub fn target_count(&self) -> usize {
        self.by_addr.len()
    }

    /// Number of targets with an established connection.
    pub fn connected_count(&self) -> usize {
        self.targets
            .values()
            .filter(|t| matches!(t.link, Link::Connected { .. }))
            .count()
    }

    pub fn is_connected(&self, addr: &EndpointAddr) -> bool {
        self.by_addr
            .get(addr)
            .and_then(|token| self.targets.get(token))
            .map(|t| matches!(t.link, Link::Connected { .. }))
            .unwrap_or(false)
    }

    /// Time since a message last arrived or a connection was last up.
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Drain every pending message without blocking.
    ///
    /// `on_message` is called once per non-empty message in arrival order
    /// per target. Zero-length messages are keepalives and are dropped.
    /// Returns the number of messages delivered.
    pub fn poll<F: FnMut(&[u8])>(&mut self, mut on_message: F) -> usize {
        let ready = match wait_ready(&mut self.poll, &mut self.events, Duration::ZERO) {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Source poll error: {}", e);
                Vec::new()
            }
        };

        let registry = self.poll.registry();
        let now = Instant::now();
        let mut delivered = 0;

        for event in ready {
            if let Some(target) = self.targets.get_mut(&event.token) {
                delivered += on_ready(
                    event,
                    target,
                    registry,
                    &self.config,
                    &mut self.stats,
                    &mut on_message,
                );
            }
        }

        for (token, target) in self.targets.iter_mut() {
            on_timer(*token, target, registry, &self.config, &mut self.stats, now);
        }

        if delivered > 0 || self.connected_count() > 0 {
            self.last_active = now;
        }
        delivered
    }
}

/// React to readiness on a target's socket.
fn on_ready<F: FnMut(&[u8])>(
    event: Readiness,
    target: &mut Target,
    registry: &Registry,
    config: &TransportConfig,
    stats: &mut SourceStats,
    on_message: &mut F,
) -> usize {
    let now = Instant::now();
    match std::mem::replace(&mut target.link, Link::Idle { retry_at: now }) {
        Link::Connecting { mut stream, started } => match finish_connect(&stream) {
            Ok(true) => {
                target.failures = 0;
                stats.connects += 1;
                if config.nodelay {
                    let _ = stream.set_nodelay(true);
                }
                debug!("Source connected to {}", target.addr);
                target.link = Link::Connected {
                    stream,
                    codec: FrameCodec::new(config.max_frame_size),
                };
                // Bytes may have landed with the connect event.
                receive(target, registry, config, stats, on_message)
            }
            Ok(false) => {
                target.link = Link::Connecting { stream, started };
                0
            }
            Err(e) => {
                let _ = registry.deregister(&mut stream);
                connect_failed(target, config, stats, &e, now);
                0
            }
        },
        connected @ Link::Connected { .. } => {
            target.link = connected;
            if event.readable {
                receive(target, registry, config, stats, on_message)
            } else {
                0
            }
        }
        idle => {
            target.link = idle;
            0
        }
    }
}

/// Start due reconnects and expire slow connects.
fn on_timer(
    token: Token,
    target: &mut Target,
    registry: &Registry,
    config: &TransportConfig,
    stats: &mut SourceStats,
    now: Instant,
) {
    let connect_due = matches!(target.link, Link::Idle { retry_at } if now >= retry_at);
    let connect_expired = matches!(
        &target.link,
        Link::Connecting { started, .. } if now.duration_since(*started) > config.connect_timeout()
    );

    if connect_due {
        match start_connect(&target.addr, token, registry) {
            Ok(stream) => {
                trace!("Source connecting to {}", target.addr);
                target.link = Link::Connecting {
                    stream,
                    started: now,
                };
            }
            Err(e) => connect_failed(target, config, stats, &e, now),
        }
    } else if connect_expired {
        close_link(&mut target.link, registry);
        let err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
        connect_failed(target, config, stats, &err, now);
    }
}

fn start_connect(addr: &EndpointAddr, token: Token, registry: &Registry) -> io::Result<TcpStream> {
    let target = addr
        .connect_addr()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let mut stream = TcpStream::connect(target)?;
    registry.register(&mut stream, token, STREAM_INTEREST)?;
    Ok(stream)
}

/// `Ok(true)` once a non-blocking connect has completed.
fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

fn connect_failed(
    target: &mut Target,
    config: &TransportConfig,
    stats: &mut SourceStats,
    err: &io::Error,
    now: Instant,
) {
    target.failures += 1;
    stats.connect_failures += 1;
    let delay = backoff(config, target.failures);
    debug!(
        "Source connect to {} failed ({}), retry {} in {:?}",
        target.addr, err, target.failures, delay
    );
    target.link = Link::Idle {
        retry_at: now + delay,
    };
}

fn close_link(link: &mut Link, registry: &Registry) {
    match link {
        Link::Connecting { stream, .. } | Link::Connected { stream, .. } => {
            let _ = registry.deregister(stream);
        }
        Link::Idle { .. } => {}
    }
}

fn backoff(config: &TransportConfig, failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    config
        .reconnect_interval()
        .saturating_mul(1u32 << shift)
        .min(config.max_reconnect_interval())
}

/// Read and deliver everything buffered on a connected target.
///
/// A lost connection is closed and scheduled for reconnect.
fn receive<F: FnMut(&[u8])>(
    target: &mut Target,
    registry: &Registry,
    config: &TransportConfig,
    stats: &mut SourceStats,
    on_message: &mut F,
) -> usize {
    let Link::Connected { stream, codec } = &mut target.link else {
        return 0;
    };
    let (delivered, lost) = drain(&target.addr, stream, codec, stats, on_message);
    if lost {
        close_link(&mut target.link, registry);
        target.link = Link::Idle {
            retry_at: Instant::now() + config.reconnect_interval(),
        };
    }
    delivered
}

/// Read and deliver everything buffered on one connection.
///
/// Returns `(delivered, lost)`; `lost` means the connection must be
/// re-established.
fn drain<F: FnMut(&[u8])>(
    addr: &EndpointAddr,
    stream: &mut TcpStream,
    codec: &mut FrameCodec,
    stats: &mut SourceStats,
    on_message: &mut F,
) -> (usize, bool) {
    let fill = codec.fill(stream);
    let mut delivered = 0;
    let mut lost = false;

    loop {
        match codec.next_frame() {
            Ok(Some(frame)) if frame.is_empty() => {
                stats.empty_dropped += 1;
            }
            Ok(Some(frame)) => {
                stats.messages_received += 1;
                stats.bytes_received += frame.len() as u64;
                on_message(&frame);
                delivered += 1;
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Source {}: {}, dropping connection", addr, e);
                lost = true;
                break;
            }
        }
    }

    match fill {
        Ok(status) if status.closed => {
            info!("Source {}: peer closed, will reconnect", addr);
            lost = true;
        }
        Ok(_) => {}
        Err(e) => {
            info!("Source {}: read error {}, will reconnect", addr, e);
            lost = true;
        }
    }

    (delivered, lost)
}
