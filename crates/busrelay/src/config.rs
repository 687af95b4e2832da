// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker, node and transport configuration.
//!
//! All structs deserialize from JSON with per-field defaults, so a config
//! file only needs the fields it overrides.

use crate::protocol::{CONTROL_PORT, NOTIFY_PORT};
use crate::transport::frame_codec::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::EndpointAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// What the broker does when a registration's schema hash differs from
/// the one the topic's relay was created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaPolicy {
    /// Accept silently.
    Ignore,
    /// Accept and log a warning.
    #[default]
    Warn,
    /// Refuse the registration with an error response.
    Reject,
}

/// Data-plane socket tuning shared by Sinks and Sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Host reported in addresses of Sinks bound to a wildcard host.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// Largest payload a Sink sends or a Source accepts (bytes).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Backlog a Sink may queue per slow peer before dropping messages
    /// (bytes). A peer with an empty backlog always takes the next message.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    /// Time a Source waits for a non-blocking connect to complete.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay after a Source loses or fails a connection.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Upper bound for the exponential reconnect delay.
    #[serde(default = "default_max_reconnect_interval_ms")]
    pub max_reconnect_interval_ms: u64,

    /// Disable Nagle on data-plane streams.
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_pending_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_interval_ms() -> u64 {
    100
}

fn default_max_reconnect_interval_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            advertise_host: default_advertise_host(),
            max_frame_size: default_max_frame_size(),
            max_pending_bytes: default_max_pending_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_interval_ms: default_max_reconnect_interval_ms(),
            nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.advertise_host.is_empty() || self.advertise_host == "*" {
            return Err(ConfigError::InvalidValue(
                "advertise_host must name a connectable host".into(),
            ));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::InvalidValue(
                "max_frame_size must be between 1 and 4 GiB - 1".into(),
            ));
        }
        if self.max_reconnect_interval_ms < self.reconnect_interval_ms {
            return Err(ConfigError::InvalidValue(
                "max_reconnect_interval_ms below reconnect_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Host the control and notify channels bind to (`*` = all interfaces).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Control channel port (0 = ephemeral).
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Reserved notify channel port (0 = ephemeral).
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,

    /// Host subscribe-relay Sinks bind to.
    #[serde(default = "default_bind_host")]
    pub data_bind_host: String,

    /// Data-plane socket tuning.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Handling of schema hash mismatches at registration.
    #[serde(default)]
    pub schema_policy: SchemaPolicy,

    /// Collect relays idle for this many seconds (absent = never).
    #[serde(default)]
    pub relay_idle_timeout_secs: Option<u64>,

    /// Longest wait for control traffic when a [`crate::Broker::run`]
    /// iteration found no work.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Largest control message accepted (bytes).
    #[serde(default = "default_max_control_message_size")]
    pub max_control_message_size: usize,

    /// Parameters preloaded into the loopback bus.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_bind_host() -> String {
    "*".to_string()
}

fn default_control_port() -> u16 {
    CONTROL_PORT
}

fn default_notify_port() -> u16 {
    NOTIFY_PORT
}

fn default_tick_interval_ms() -> u64 {
    1
}

fn default_max_control_message_size() -> usize {
    1024 * 1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            control_port: default_control_port(),
            notify_port: default_notify_port(),
            data_bind_host: default_bind_host(),
            transport: TransportConfig::default(),
            schema_policy: SchemaPolicy::default(),
            relay_idle_timeout_secs: None,
            tick_interval_ms: default_tick_interval_ms(),
            max_control_message_size: default_max_control_message_size(),
            params: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Configuration binding every port ephemerally on loopback.
    pub fn ephemeral() -> Self {
        Self {
            bind_host: "127.0.0.1".into(),
            control_port: 0,
            notify_port: 0,
            data_bind_host: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    pub fn control_endpoint(&self) -> EndpointAddr {
        EndpointAddr::new(self.bind_host.clone(), self.control_port)
    }

    pub fn notify_endpoint(&self) -> EndpointAddr {
        EndpointAddr::new(self.bind_host.clone(), self.notify_port)
    }

    /// Bind address for a new subscribe-relay Sink.
    pub fn data_endpoint(&self) -> EndpointAddr {
        EndpointAddr::ephemeral(self.data_bind_host.clone())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn relay_idle_timeout(&self) -> Option<Duration> {
        self.relay_idle_timeout_secs.map(Duration::from_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_port != 0 && self.control_port == self.notify_port {
            return Err(ConfigError::InvalidValue(
                "control_port and notify_port must differ".into(),
            ));
        }
        if self.bind_host.is_empty() || self.data_bind_host.is_empty() {
            return Err(ConfigError::InvalidValue("bind hosts cannot be empty".into()));
        }
        if self.relay_idle_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "relay_idle_timeout_secs cannot be 0".into(),
            ));
        }
        if self.max_control_message_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_control_message_size cannot be 0".into(),
            ));
        }
        self.transport.validate()
    }
}

/// Node (client) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Broker host.
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    /// Broker control channel port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Broker notify channel port.
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,

    /// Host publisher Sinks bind to.
    #[serde(default = "default_bind_host")]
    pub data_bind_host: String,

    /// Data-plane socket tuning.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Bound on one control round trip, connect included.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Extra connect attempts after the first one fails.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Initial delay between connect attempts (doubles each retry).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Largest control response accepted (bytes).
    #[serde(default = "default_max_control_message_size")]
    pub max_control_message_size: usize,
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    2000
}

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            control_port: default_control_port(),
            notify_port: default_notify_port(),
            data_bind_host: default_bind_host(),
            transport: TransportConfig::default(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            connect_retries: default_connect_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_control_message_size: default_max_control_message_size(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration pointing at a broker's concrete endpoints.
    pub fn for_broker(control: &EndpointAddr, notify: &EndpointAddr) -> Self {
        Self {
            broker_host: control.host().to_string(),
            control_port: control.port(),
            notify_port: notify.port(),
            data_bind_host: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    pub fn control_endpoint(&self) -> EndpointAddr {
        EndpointAddr::new(self.broker_host.clone(), self.control_port)
    }

    pub fn notify_endpoint(&self) -> EndpointAddr {
        EndpointAddr::new(self.broker_host.clone(), self.notify_port)
    }

    /// Bind address for a new publisher Sink.
    pub fn data_endpoint(&self) -> EndpointAddr {
        EndpointAddr::ephemeral(self.data_bind_host.clone())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_port == 0 {
            return Err(ConfigError::InvalidValue("control_port cannot be 0".into()));
        }
        if self.broker_host.is_empty() || self.broker_host == "*" {
            return Err(ConfigError::InvalidValue(
                "broker_host must name a connectable host".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "rpc_timeout_ms cannot be 0".into(),
            ));
        }
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_broker_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.control_port, 5555);
        assert_eq!(config.notify_port, 5556);
        assert_eq!(config.schema_policy, SchemaPolicy::Warn);
        assert!(config.relay_idle_timeout().is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.control_endpoint().to_string(), "tcp://*:5555");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{"control_port": 6000, "notify_port": 6001, "schema_policy": "reject",
                "params": {"rate": "10"}}"#,
        )
        .unwrap();
        assert_eq!(config.control_port, 6000);
        assert_eq!(config.schema_policy, SchemaPolicy::Reject);
        assert_eq!(config.params.get("rate").map(String::as_str), Some("10"));
        assert_eq!(config.transport.advertise_host, "127.0.0.1");
    }

    #[test]
    fn test_validation_port_clash() {
        let config = BrokerConfig {
            control_port: 7000,
            notify_port: 7000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let ephemeral = BrokerConfig::ephemeral();
        assert!(ephemeral.validate().is_ok());
    }

    #[test]
    fn test_validation_idle_timeout_zero() {
        let config = BrokerConfig {
            relay_idle_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_validation() {
        let transport = TransportConfig {
            advertise_host: "*".into(),
            ..Default::default()
        };
        assert!(transport.validate().is_err());

        let transport = TransportConfig {
            reconnect_interval_ms: 500,
            max_reconnect_interval_ms: 100,
            ..Default::default()
        };
        assert!(transport.validate().is_err());

        let transport = TransportConfig {
            max_frame_size: (u64::from(u32::MAX) + 1) as usize,
            ..Default::default()
        };
        assert!(transport.validate().is_err());
    }

    #[test]
    fn test_node_config_for_broker() {
        let control = EndpointAddr::new("127.0.0.1", 41000);
        let notify = EndpointAddr::new("127.0.0.1", 41001);
        let config = NodeConfig::for_broker(&control, &notify);
        assert_eq!(config.control_endpoint(), control);
        assert_eq!(config.notify_endpoint(), notify);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");

        let config = BrokerConfig {
            control_port: 6100,
            notify_port: 6101,
            relay_idle_timeout_secs: Some(30),
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.control_port, 6100);
        assert_eq!(loaded.relay_idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            NodeConfig::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::from_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
