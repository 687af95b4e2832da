// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint addresses (`tcp://host:port`).
//!
//! Addresses are the only thing that crosses from the control plane to the
//! data plane: a Sink reports one when it binds, a Source connects to it.
//!
//! ```text
//! tcp://*:0            bind all interfaces, ephemeral port
//! tcp://*:*            same as above
//! tcp://127.0.0.1:5555 concrete, connectable
//! tcp://[::1]:7000     IPv6 literal
//! ```

use super::TransportError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// The only scheme currently implemented.
pub const TCP_SCHEME: &str = "tcp";

/// A transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddr {
    host: String,
    port: u16,
}

impl EndpointAddr {
    /// Create an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address on `host` with an ephemeral port.
    pub fn ephemeral(host: impl Into<String>) -> Self {
        Self::new(host, 0)
    }

    /// Host part, exactly as given (`*`, a name, or an IP literal).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part (0 = ephemeral).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the host names every interface rather than one peer.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.host.as_str(), "*" | "0.0.0.0" | "::" | "[::]")
    }

    /// Same host, different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// Socket address to bind a listener on.
    pub fn bind_addr(&self) -> Result<SocketAddr, TransportError> {
        if self.host == "*" {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port));
        }
        self.resolve_first()
    }

    /// Socket address to connect to.
    ///
    /// A wildcard host resolves to loopback, matching what a bound Sink
    /// reports when no advertise host is configured.
    pub fn connect_addr(&self) -> Result<SocketAddr, TransportError> {
        if self.is_wildcard() {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port));
        }
        self.resolve_first()
    }

    fn resolve_first(&self) -> Result<SocketAddr, TransportError> {
        let authority = format!("{}:{}", self.host, self.port);
        let candidates: Vec<SocketAddr> = authority
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(self.to_string(), e.to_string()))?
            .collect();

        // Wildcard binds are IPv4, so prefer v4 when a name resolves to both.
        candidates
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| TransportError::Resolve(self.to_string(), "no addresses".into()))
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", TCP_SCHEME, self.host, self.port)
    }
}

impl FromStr for EndpointAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        if scheme != TCP_SCHEME {
            return Err(TransportError::UnsupportedScheme(scheme.to_string()));
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }

        let port = match port {
            "*" => 0,
            p => p
                .parse::<u16>()
                .map_err(|_| TransportError::InvalidAddress(s.to_string()))?,
        };

        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for EndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(v4.ip().to_string(), v4.port()),
            SocketAddr::V6(v6) => Self::new(format!("[{}]", v6.ip()), v6.port()),
        }
    }
}
