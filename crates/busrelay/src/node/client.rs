// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking control channel client.
//!
//! Every round trip is bounded by `rpc_timeout`. A round trip that fails on
//! the transport (timeout, reset, garbage) discards the connection; the next
//! call reconnects.

use super::NodeError;
use crate::config::NodeConfig;
use crate::protocol::{decode_response, encode, ControlRequest, NulDelimited};
use crate::transport::EndpointAddr;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Request/reply client for the broker control channel.
pub struct ControlClient {
    endpoint: EndpointAddr,
    stream: Option<TcpStream>,
    reader: NulDelimited,
    rpc_timeout: Duration,
    connect_retries: u32,
    retry_backoff: Duration,
    max_message_size: usize,
}

impl ControlClient {
    /// Create an unconnected client.
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            endpoint: config.control_endpoint(),
            stream: None,
            reader: NulDelimited::new(config.max_control_message_size),
            rpc_timeout: config.rpc_timeout(),
            connect_retries: config.connect_retries,
            retry_backoff: config.retry_backoff(),
            max_message_size: config.max_control_message_size,
        }
    }

    pub fn endpoint(&self) -> &EndpointAddr {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect if not connected, retrying with exponential backoff.
    pub fn connect(&mut self) -> Result<(), NodeError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = self.endpoint.connect_addr()?;
        let mut delay = self.retry_backoff;
        let mut attempt = 0;
        loop {
            match TcpStream::connect_timeout(&addr, self.rpc_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Control channel connected to {}", self.endpoint);
                    self.reader = NulDelimited::new(self.max_message_size);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if attempt < self.connect_retries => {
                    attempt += 1;
                    debug!(
                        "Connect to {} failed ({}), retry {}/{} in {:?}",
                        self.endpoint, e, attempt, self.connect_retries, delay
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(source) => {
                    warn!("Cannot reach broker at {}: {}", self.endpoint, source);
                    return Err(NodeError::Connect {
                        endpoint: self.endpoint.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// Drop the current connection.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Control channel to {} closed", self.endpoint);
        }
    }

    /// One request/reply round trip.
    ///
    /// A broker error reply is [`NodeError::Rejected`] and keeps the
    /// connection; every other failure drops it.
    pub fn call<T: DeserializeOwned>(&mut self, request: &ControlRequest) -> Result<T, NodeError> {
        self.connect()?;
        let deadline = Instant::now() + self.rpc_timeout;

        let reply = match self.round_trip(request, deadline) {
            Ok(reply) => reply,
            Err(e) => {
                self.disconnect();
                return Err(e);
            }
        };

        match decode_response(&reply) {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = NodeError::from(e);
                if !matches!(err, NodeError::Rejected { .. }) {
                    self.disconnect();
                }
                Err(err)
            }
        }
    }

    fn round_trip(&mut self, request: &ControlRequest, deadline: Instant) -> Result<Vec<u8>, NodeError> {
        let bytes = encode(request)?;
        let stream = self.stream.as_mut().ok_or_else(|| NodeError::Disconnected(self.endpoint.clone()))?;
        trace!("-> {} ({} bytes)", request.command(), bytes.len());

        stream.set_write_timeout(Some(remaining(deadline, &self.endpoint, self.rpc_timeout)?))?;
        stream
            .write_all(&bytes)
            .map_err(|e| io_failure(e, &self.endpoint, self.rpc_timeout))?;

        let mut chunk = [0u8; 4096];
        loop {
            if let Some(reply) = self.reader.next_message()? {
                trace!("<- {} bytes", reply.len());
                return Ok(reply);
            }

            stream.set_read_timeout(Some(remaining(deadline, &self.endpoint, self.rpc_timeout)?))?;
            match stream.read(&mut chunk) {
                Ok(0) => return Err(NodeError::Disconnected(self.endpoint.clone())),
                Ok(n) => self.reader.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_failure(e, &self.endpoint, self.rpc_timeout)),
            }
        }
    }
}

fn remaining(deadline: Instant, endpoint: &EndpointAddr, after: Duration) -> Result<Duration, NodeError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(NodeError::Timeout {
            endpoint: endpoint.clone(),
            after,
        });
    }
    Ok(left)
}

fn io_failure(err: io::Error, endpoint: &EndpointAddr, after: Duration) -> NodeError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NodeError::Timeout {
            endpoint: endpoint.clone(),
            after,
        },
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => NodeError::Disconnected(endpoint.clone()),
        _ => NodeError::Io(err),
    }
}
