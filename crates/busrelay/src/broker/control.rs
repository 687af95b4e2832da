// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control channel responder.
//!
//! Polled from the broker loop. Each client has at most one request in
//! flight: the next request from a client is not handed out until the reply
//! to the previous one has been queued. A client that half-closes still gets
//! replies to everything it sent before the close.

use crate::protocol::{encode, ControlRequest, ControlResponse, NulDelimited, ProtocolError};
use crate::transport::{
    bind_listener, wait_ready, EndpointAddr, TransportError, MAX_EVENTS, STREAM_INTEREST,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// Client connection identifier (its poll token).
pub type ClientId = u64;

/// A request read from a client, awaiting [`ControlServer::reply`].
#[derive(Debug)]
pub struct PendingRequest {
    pub client: ClientId,
    pub request: Result<ControlRequest, ProtocolError>,
}

struct ControlConnection {
    stream: TcpStream,
    remote: SocketAddr,
    reader: NulDelimited,
    outbound: Vec<u8>,
    awaiting_reply: bool,
    read_closed: bool,
}

impl ControlConnection {
    /// Returns `false` when the client is gone.
    fn flush(&mut self) -> bool {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return false,
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Control client {} write error: {}", self.remote, e);
                    return false;
                }
            }
        }
        true
    }

    /// Nothing more will arrive and nothing is owed.
    fn is_finished(&self) -> bool {
        self.read_closed && !self.awaiting_reply && self.outbound.is_empty()
    }
}

/// Non-blocking request/reply server for the control protocol.
pub struct ControlServer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    addr: EndpointAddr,
    clients: HashMap<ClientId, ControlConnection>,
    next_client: ClientId,
    max_message_size: usize,
}

impl ControlServer {
    /// Bind the control endpoint.
    ///
    /// A wildcard host is reported as `advertise_host`.
    pub fn bind(
        addr: &EndpointAddr,
        advertise_host: &str,
        max_message_size: usize,
    ) -> Result<Self, TransportError> {
        let bind_addr = addr.bind_addr()?;
        let mut listener = bind_listener(bind_addr).map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let port = listener.local_addr()?.port();
        let reported = if addr.is_wildcard() {
            EndpointAddr::new(advertise_host, port)
        } else {
            addr.with_port(port)
        };

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            listener,
            addr: reported,
            clients: HashMap::new(),
            next_client: 1,
            max_message_size,
        })
    }

    /// Connectable address of the control channel.
    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote)) => {
                    let id = self.next_client;
                    self.next_client += 1;

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(id as usize),
                        STREAM_INTEREST,
                    ) {
                        warn!("Control: cannot register client {}: {}", remote, e);
                        continue;
                    }
                    debug!("Control client {} connected from {}", id, remote);
                    self.clients.insert(
                        id,
                        ControlConnection {
                            stream,
                            remote,
                            reader: NulDelimited::new(self.max_message_size),
                            outbound: Vec::new(),
                            awaiting_reply: false,
                            read_closed: false,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Control accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn drop_client(&mut self, id: ClientId) {
        if let Some(mut conn) = self.clients.remove(&id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!("Control client {} disconnected", id);
        }
    }

    /// Wait up to `timeout` for control traffic, then collect at most one
    /// new request per client.
    pub fn poll_requests(&mut self, timeout: Duration) -> Vec<PendingRequest> {
        let ready = match wait_ready(&mut self.poll, &mut self.events, timeout) {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Control poll error: {}", e);
                Vec::new()
            }
        };

        for event in ready {
            if event.token == LISTENER_TOKEN {
                self.accept_pending();
                continue;
            }
            let id = event.token.0 as ClientId;
            let Some(conn) = self.clients.get_mut(&id) else {
                continue;
            };

            let mut alive = !event.writable || conn.flush();
            if alive && event.readable {
                match conn.reader.fill(&mut conn.stream) {
                    Ok(status) => conn.read_closed |= status.closed,
                    Err(e) => {
                        debug!("Control client {} read error: {}", id, e);
                        alive = false;
                    }
                }
            }
            if !alive {
                self.drop_client(id);
            }
        }

        // Requests may sit buffered behind one that was just answered.
        let mut pending = Vec::new();
        for (&id, conn) in self.clients.iter_mut() {
            if conn.awaiting_reply {
                continue;
            }
            let request = match conn.reader.next_message() {
                Ok(Some(bytes)) => {
                    trace!("Control client {}: {} byte request", id, bytes.len());
                    ControlRequest::decode(&bytes)
                }
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            conn.awaiting_reply = true;
            pending.push(PendingRequest { client: id, request });
        }

        let finished: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, conn)| conn.is_finished())
            .map(|(&id, _)| id)
            .collect();
        for id in finished {
            self.drop_client(id);
        }
        pending
    }

    /// Queue the reply to a client's outstanding request and try to send it.
    pub fn reply(&mut self, client: ClientId, response: &ControlResponse) {
        let Some(conn) = self.clients.get_mut(&client) else {
            debug!("Control client {} left before its reply", client);
            return;
        };

        match encode(response) {
            Ok(bytes) => conn.outbound.extend_from_slice(&bytes),
            Err(e) => {
                warn!("Control: cannot encode reply for client {}: {}", client, e);
                return;
            }
        }
        conn.awaiting_reply = false;

        if !conn.flush() {
            self.drop_client(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParamReply, ERR_MALFORMED};
    use std::io::Read;
    use std::net::{Shutdown, TcpStream as StdStream};
    use std::time::Instant;

    fn server() -> ControlServer {
        ControlServer::bind(&EndpointAddr::ephemeral("127.0.0.1"), "127.0.0.1", 1024).unwrap()
    }

    fn poll_for_request(server: &mut ControlServer) -> PendingRequest {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(req) = server.poll_requests(Duration::from_millis(5)).pop() {
                return req;
            }
            assert!(Instant::now() < deadline, "no request arrived");
        }
    }

    fn read_reply(stream: &mut StdStream) -> serde_json::Value {
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).unwrap();
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_poll_without_clients_returns_nothing() {
        let mut server = server();
        assert!(server.poll_requests(Duration::ZERO).is_empty());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_request_reply() {
        let mut server = server();
        let mut client = StdStream::connect(server.addr().connect_addr().unwrap()).unwrap();
        client
            .write_all(b"{\"cmd\":\"getParam\",\"name\":\"rate\"}\0")
            .unwrap();

        let pending = poll_for_request(&mut server);
        assert_eq!(
            pending.request.unwrap(),
            ControlRequest::GetParam {
                name: "rate".into()
            }
        );

        server.reply(
            pending.client,
            &ControlResponse::Param(ParamReply {
                name: "rate".into(),
                value: "10".into(),
            }),
        );
        let reply = read_reply(&mut client);
        assert_eq!(reply["value"], "10");
    }

    #[test]
    fn test_one_request_in_flight_per_client() {
        let mut server = server();
        let mut client = StdStream::connect(server.addr().connect_addr().unwrap()).unwrap();
        client
            .write_all(b"{\"cmd\":\"getParam\",\"name\":\"a\"}\0{\"cmd\":\"getParam\",\"name\":\"b\"}\0")
            .unwrap();

        let first = poll_for_request(&mut server);
        assert!(server.poll_requests(Duration::from_millis(20)).is_empty());

        server.reply(first.client, &ControlResponse::error(ERR_MALFORMED, "x"));
        let second = poll_for_request(&mut server);
        assert_eq!(
            second.request.unwrap(),
            ControlRequest::GetParam { name: "b".into() }
        );
    }

    #[test]
    fn test_malformed_request_is_surfaced() {
        let mut server = server();
        let mut client = StdStream::connect(server.addr().connect_addr().unwrap()).unwrap();
        client.write_all(b"garbage\0").unwrap();

        let pending = poll_for_request(&mut server);
        assert!(matches!(pending.request, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_half_closed_client_still_answered() {
        let mut server = server();
        let mut client = StdStream::connect(server.addr().connect_addr().unwrap()).unwrap();
        client
            .write_all(b"{\"cmd\":\"getParam\",\"name\":\"a\"}\0")
            .unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let pending = poll_for_request(&mut server);
        server.reply(
            pending.client,
            &ControlResponse::Param(ParamReply {
                name: "a".into(),
                value: "1".into(),
            }),
        );
        assert_eq!(read_reply(&mut client)["value"], "1");

        server.poll_requests(Duration::from_millis(20));
        assert_eq!(server.client_count(), 0);
    }
}
