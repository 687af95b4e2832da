// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcasting side of the data plane.

use super::frame_codec::FrameCodec;
use super::{bind_listener, wait_ready, EndpointAddr, TransportError, MAX_EVENTS, STREAM_INTEREST};
use crate::config::TransportConfig;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Token for the listener
const LISTENER_TOKEN: Token = Token(0);

/// Starting token for peers
const PEER_TOKEN_START: usize = 1;

/// Sink statistics.
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    /// Peers accepted since bind.
    pub peers_accepted: u64,
    /// Peers dropped after an error or EOF.
    pub peers_dropped: u64,
    /// Messages handed to `send`.
    pub messages_sent: u64,
    /// Payload bytes handed to `send`.
    pub bytes_sent: u64,
    /// Per-peer copies discarded because that peer's backlog was full.
    pub messages_dropped: u64,
    /// Messages refused for exceeding `max_frame_size`.
    pub messages_rejected: u64,
}

/// A bound endpoint broadcasting byte messages to every connected peer.
///
/// Cloning yields another handle to the same socket; the socket closes when
/// the last handle is dropped. Peers that connect after a message was sent
/// never see it.
#[derive(Clone)]
pub struct Sink {
    addr: EndpointAddr,
    inner: Arc<Mutex<SinkInner>>,
}

struct SinkInner {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    peers: HashMap<Token, SinkPeer>,
    next_token: usize,
    nodelay: bool,
    max_frame_size: usize,
    max_pending_bytes: usize,
    last_active: Instant,
    stats: SinkStats,
}

struct SinkPeer {
    stream: TcpStream,
    remote: SocketAddr,
    pending: Vec<u8>,
}

impl SinkPeer {
    /// Write as much queued output as the socket takes.
    ///
    /// Returns `false` when the peer is gone.
    fn flush(&mut self) -> bool {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return false,
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Sink peer {} write error: {}", self.remote, e);
                    return false;
                }
            }
        }
        true
    }

    /// Peers never write to a Sink; discard input and report EOF as gone.
    fn drain_input(&mut self) -> bool {
        let mut scratch = [0u8; 256];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return false,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

impl Sink {
    /// Bind a Sink.
    ///
    /// A wildcard host is reported as `config.advertise_host`; port 0 is
    /// replaced by the port the OS picked.
    pub fn bind(addr: &EndpointAddr, config: &TransportConfig) -> Result<Self, TransportError> {
        let bind_addr = addr.bind_addr()?;
        let mut listener = bind_listener(bind_addr).map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let port = listener.local_addr()?.port();

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let reported = if addr.is_wildcard() {
            EndpointAddr::new(config.advertise_host.clone(), port)
        } else {
            addr.with_port(port)
        };
        debug!("Sink bound on {} (reported as {})", bind_addr, reported);

        Ok(Self {
            addr: reported,
            inner: Arc::new(Mutex::new(SinkInner {
                poll,
                events: Events::with_capacity(MAX_EVENTS),
                listener,
                peers: HashMap::new(),
                next_token: PEER_TOKEN_START,
                nodelay: config.nodelay,
                max_frame_size: config.max_frame_size,
                max_pending_bytes: config.max_pending_bytes,
                last_active: Instant::now(),
                stats: SinkStats::default(),
            })),
        })
    }

    /// Connectable address of this Sink.
    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    /// Broadcast one message to every connected peer.
    ///
    /// Returns the number of peers the message was queued for. A peer with
    /// an empty backlog always takes the message; a peer whose backlog would
    /// grow past `max_pending_bytes` misses it. Payloads above
    /// `max_frame_size` are refused, since no Source would accept them.
    pub fn send(&self, payload: &[u8]) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock();
        if payload.len() > inner.max_frame_size {
            inner.stats.messages_rejected += 1;
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: inner.max_frame_size,
            });
        }
        let frame = FrameCodec::encode(payload)?;

        inner.service();
        inner.last_active = Instant::now();

        let max_pending = inner.max_pending_bytes;
        let mut queued = 0;
        let mut dropped = 0;
        let mut lost = Vec::new();

        for (token, peer) in inner.peers.iter_mut() {
            if !peer.pending.is_empty() && peer.pending.len() + frame.len() > max_pending {
                dropped += 1;
                continue;
            }
            peer.pending.extend_from_slice(&frame);
            queued += 1;
            if !peer.flush() {
                lost.push(*token);
            }
        }
        for token in lost {
            inner.drop_peer(token);
        }

        inner.stats.messages_sent += 1;
        inner.stats.bytes_sent += payload.len() as u64;
        inner.stats.messages_dropped += dropped;
        if dropped > 0 {
            warn!("Sink {}: {} slow peer(s) missed a message", self.addr, dropped);
        }
        trace!("Sink {}: {} bytes to {} peer(s)", self.addr, payload.len(), queued);
        Ok(queued)
    }

    /// Accept new peers, flush queued output and drop dead peers.
    pub fn poll(&self) {
        self.inner.lock().service();
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// Time since the Sink last sent or had a peer.
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_active.elapsed()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SinkStats {
        self.inner.lock().stats.clone()
    }
}

impl SinkInner {
    /// Handle whatever readiness the sockets report right now.
    fn service(&mut self) {
        let ready = match wait_ready(&mut self.poll, &mut self.events, Duration::ZERO) {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Sink poll error: {}", e);
                return;
            }
        };

        for event in ready {
            if event.token == LISTENER_TOKEN {
                self.accept_pending();
                continue;
            }
            let Some(peer) = self.peers.get_mut(&event.token) else {
                continue;
            };
            let alive = (!event.readable || peer.drain_input()) && (!event.writable || peer.flush());
            if !alive {
                self.drop_peer(event.token);
            }
        }

        if !self.peers.is_empty() {
            self.last_active = Instant::now();
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) =
                        self.poll.registry().register(&mut stream, token, STREAM_INTEREST)
                    {
                        warn!("Sink: cannot register peer {}: {}", remote, e);
                        continue;
                    }
                    if self.nodelay {
                        let _ = stream.set_nodelay(true);
                    }

                    debug!("Sink accepted peer {}", remote);
                    self.stats.peers_accepted += 1;
                    self.peers.insert(
                        token,
                        SinkPeer {
                            stream,
                            remote,
                            pending: Vec::new(),
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Sink accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn drop_peer(&mut self, token: Token) {
        if let Some(mut peer) = self.peers.remove(&token) {
            let _ = self.poll.registry().deregister(&mut peer.stream);
            debug!("Sink dropped peer {}", peer.remote);
            self.stats.peers_dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdStream;
    use std::thread;

    fn loopback_config() -> TransportConfig {
        TransportConfig::default()
    }

    fn read_frame(stream: &mut StdStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
        stream.read_exact(&mut body).unwrap();
        body
    }

    fn wait_for_peers(sink: &Sink, want: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.peer_count() < want && Instant::now() < deadline {
            sink.poll();
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(sink.peer_count(), want);
    }

    #[test]
    fn test_bind_reports_advertise_host() {
        let sink = Sink::bind(&EndpointAddr::ephemeral("*"), &loopback_config()).unwrap();
        assert_eq!(sink.addr().host(), "127.0.0.1");
        assert_ne!(sink.addr().port(), 0);
    }

    #[test]
    fn test_each_bind_gets_fresh_address() {
        let config = loopback_config();
        let a = Sink::bind(&EndpointAddr::ephemeral("127.0.0.1"), &config).unwrap();
        let b = Sink::bind(&EndpointAddr::ephemeral("127.0.0.1"), &config).unwrap();
        assert_ne!(a.addr(), b.addr());
    }

    #[test]
    fn test_send_without_peers() {
        let sink = Sink::bind(&EndpointAddr::ephemeral("127.0.0.1"), &loopback_config()).unwrap();
        assert_eq!(sink.send(b"nobody").unwrap(), 0);
        assert_eq!(sink.stats().messages_sent, 1);
    }

    #[test]
    fn test_broadcast_to_all_peers() {
        let sink = Sink::bind(&EndpointAddr::ephemeral("127.0.0.1"), &loopback_config()).unwrap();
        let target = sink.addr().connect_addr().unwrap();

        let mut a = StdStream::connect(target).unwrap();
        let mut b = StdStream::connect(target).unwrap();
        wait_for_peers(&sink, 2);

        assert_eq!(sink.send(&[1, 2, 3]).unwrap(), 2);
        assert_eq!(read_frame(&mut a), vec![1, 2, 3]);
        assert_eq!(read_frame(&mut b), vec![1, 2, 3]);
    }

    #[test]
    fn test_poll_drops_closed_peer() {
        let sink = Sink::bind(&EndpointAddr::ephemeral("127.0.0.1"), &loopback_config()).unwrap();
        let target = sink.addr().connect_addr().unwrap();

        let peer = StdStream::connect(target).unwrap();
        wait_for_peers(&sink, 1);

        drop(peer);
        wait_for_peers(&sink, 0);
        assert_eq!(sink.stats().peers_dropped, 1);
    }

    #[test]
    fn test_payload_above_backlog_cap_reaches_idle_peer() {
        let config = TransportConfig {
            max_pending_bytes: 1024,
            ..loopback_config()
        };
        let sink = Sink::bind(&EndpointAddr::ephemeral("127.0.0.1"), &config).unwrap();
        let mut peer = StdStream::connect(sink.addr().connect_addr().unwrap()).unwrap();
        wait_for_peers(&sink, 1);

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        assert_eq!(sink.send(&payload).unwrap(), 1);

        let reader = thread::spawn(move || read_frame(&mut peer));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !reader.is_finished() && Instant::now() < deadline {
            sink.poll();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(reader.join().unwrap(), payload);
        assert_eq!(sink.stats().messages_dropped, 0);
    }

    #[test]
    fn test_oversized_payload_is_refused() {
        let config = TransportConfig {
            max_frame_size: 8,
            ..loopback_config()
        };
        let sink = Sink::bind(&EndpointAddr::ephemeral("127.0.0.1"), &config).unwrap();

        let err = sink.send(&[0u8; 9]).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 9, max: 8 }));
        assert_eq!(sink.send(&[0u8; 8]).unwrap(), 0);

        let stats = sink.stats();
        assert_eq!(stats.messages_rejected, 1);
        assert_eq!(stats.messages_sent, 1);
    }
}
