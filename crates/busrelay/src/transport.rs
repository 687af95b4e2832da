// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data-plane transport endpoints.
//!
//! Two one-directional roles over TCP:
//! - [`Sink`]: binds an address and broadcasts every message to all peers
//!   currently connected to it.
//! - [`Source`]: connects to any number of Sink addresses and receives their
//!   messages through a non-blocking [`Source::poll`].
//!
//! Nothing here blocks: every endpoint owns a `mio::Poll`, its sockets are
//! registered with it, and the owner's loop drives it with a zero timeout.

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub mod address;
pub mod frame_codec;
pub mod sink;
pub mod source;

pub use address::EndpointAddr;
pub use frame_codec::{FrameCodec, ReadStatus};
pub use sink::{Sink, SinkStats};
pub use source::{Source, SourceStats};

const LISTEN_BACKLOG: i32 = 128;

/// Maximum events handled per poll.
pub(crate) const MAX_EVENTS: usize = 128;

/// Interest for data and control streams.
pub(crate) const STREAM_INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported transport scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Cannot resolve {0}: {1}")]
    Resolve(String, String),

    #[error("Bind to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Payload of {size} bytes exceeds max frame size {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Create a non-blocking listener with `SO_REUSEADDR` set.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Readiness of one registered socket, copied out of `mio::Events`.
///
/// Errors and hang-ups count as both readable and writable so the next
/// read or write surfaces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Wait up to `timeout` for readiness events.
///
/// An interrupted wait yields no events.
pub(crate) fn wait_ready(
    poll: &mut Poll,
    events: &mut Events,
    timeout: Duration,
) -> io::Result<Vec<Readiness>> {
    match poll.poll(events, Some(timeout)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
        Err(e) => return Err(e),
    }

    Ok(events
        .iter()
        .map(|event| {
            let failed = event.is_error();
            Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || failed,
                writable: event.is_writable() || event.is_write_closed() || failed,
            }
        })
        .collect())
}
