// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control channel wire protocol.
//!
//! One JSON object each way per round trip, terminated by a NUL byte:
//! ```text
//! +----------------------+------+
//! | UTF-8 JSON object    | 0x00 |
//! +----------------------+------+
//! ```
//!
//! Requests:
//! ```text
//! -> {"cmd":"publish","data":{"topic":T,"addr":A,"md5":H,"type":TY,"def":D}}
//! <- {"cmd":"publish","data":{...echoed...}}
//!
//! -> {"cmd":"subscribe","data":{"topic":T,"md5":H,"type":TY,"def":D}}
//! <- {"topic":T,"addr":A}
//!
//! -> {"cmd":"getParam","name":N}
//! <- {"name":N,"value":V}
//! ```
//!
//! Any request the broker cannot act on is answered with
//! `{"error":{"code":C,"message":M}}`.

use crate::descriptor::MessageDescriptor;
use crate::transport::frame_codec::{read_available, ReadStatus};
use crate::transport::EndpointAddr;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use thiserror::Error;

/// Default control (request/reply) port.
pub const CONTROL_PORT: u16 = 5555;

/// Default notify (broadcast) port. Reserved: nothing is published on it yet.
pub const NOTIFY_PORT: u16 = 5556;

/// Request could not be parsed or lacks required fields.
pub const ERR_MALFORMED: u32 = 1;
/// `cmd` names no known command.
pub const ERR_UNKNOWN_COMMAND: u32 = 2;
/// Registration schema differs from the topic's relay and policy is `reject`.
pub const ERR_SCHEMA_MISMATCH: u32 = 3;
/// Broker could not create the relay (bind or local bus failure).
pub const ERR_RELAY_SETUP: u32 = 4;

const MESSAGE_TERMINATOR: u8 = 0;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed control message: {0}")]
    Malformed(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Control message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Broker error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Error code sent back when this error is answered on the wire.
    pub fn code(&self) -> u32 {
        match self {
            ProtocolError::UnknownCommand(_) => ERR_UNKNOWN_COMMAND,
            ProtocolError::Remote { code, .. } => *code,
            _ => ERR_MALFORMED,
        }
    }
}

/// Body of a `publish` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishData {
    pub topic: String,
    pub addr: String,
    pub md5: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub def: String,
}

impl PublishData {
    pub fn new(descriptor: &MessageDescriptor, addr: &EndpointAddr) -> Self {
        Self {
            topic: descriptor.topic().to_string(),
            addr: addr.to_string(),
            md5: descriptor.schema_hash().to_string(),
            type_name: descriptor.type_name().to_string(),
            def: descriptor.schema_def().to_string(),
        }
    }

    pub fn descriptor(&self) -> MessageDescriptor {
        MessageDescriptor::new(&self.topic, &self.md5, &self.type_name, &self.def)
    }

    /// Parse the advertised Sink address.
    pub fn endpoint(&self) -> Result<EndpointAddr, ProtocolError> {
        self.addr
            .parse()
            .map_err(|e| ProtocolError::Malformed(format!("addr {:?}: {}", self.addr, e)))
    }
}

/// Body of a `subscribe` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeData {
    pub topic: String,
    pub md5: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub def: String,
}

impl SubscribeData {
    pub fn new(descriptor: &MessageDescriptor) -> Self {
        Self {
            topic: descriptor.topic().to_string(),
            md5: descriptor.schema_hash().to_string(),
            type_name: descriptor.type_name().to_string(),
            def: descriptor.schema_def().to_string(),
        }
    }

    pub fn descriptor(&self) -> MessageDescriptor {
        MessageDescriptor::new(&self.topic, &self.md5, &self.type_name, &self.def)
    }
}

/// Control requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ControlRequest {
    /// Node announces a Sink producing `data.topic`.
    #[serde(rename = "publish")]
    Publish { data: PublishData },

    /// Node asks where to receive `data.topic` from.
    #[serde(rename = "subscribe")]
    Subscribe { data: SubscribeData },

    /// Parameter lookup.
    #[serde(rename = "getParam")]
    GetParam { name: String },
}

impl ControlRequest {
    /// Wire name of the command.
    pub fn command(&self) -> &'static str {
        match self {
            ControlRequest::Publish { .. } => "publish",
            ControlRequest::Subscribe { .. } => "subscribe",
            ControlRequest::GetParam { .. } => "getParam",
        }
    }

    /// Decode one request (terminator optional).
    ///
    /// Unparseable JSON, a missing `cmd` and missing fields are
    /// [`ProtocolError::Malformed`]; an unrecognised `cmd` is
    /// [`ProtocolError::UnknownCommand`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_slice(strip_terminator(bytes))
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let cmd = match value.get("cmd") {
            Some(serde_json::Value::String(cmd)) => cmd.clone(),
            Some(_) => return Err(ProtocolError::Malformed("cmd is not a string".into())),
            None => return Err(ProtocolError::Malformed("missing cmd".into())),
        };
        if !matches!(cmd.as_str(), "publish" | "subscribe" | "getParam") {
            return Err(ProtocolError::UnknownCommand(cmd));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("{}: {}", cmd, e)))
    }
}

/// Reply to `publish`: the request echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReply {
    pub cmd: String,
    pub data: PublishData,
}

impl PublishReply {
    pub fn echo(data: PublishData) -> Self {
        Self {
            cmd: "publish".into(),
            data,
        }
    }
}

/// Reply to `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeReply {
    pub topic: String,
    pub addr: String,
}

impl SubscribeReply {
    /// Parse the relay Sink address.
    pub fn endpoint(&self) -> Result<EndpointAddr, ProtocolError> {
        self.addr
            .parse()
            .map_err(|e| ProtocolError::Malformed(format!("addr {:?}: {}", self.addr, e)))
    }
}

/// Reply to `getParam`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamReply {
    pub name: String,
    pub value: String,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: ErrorBody,
}

impl ErrorReply {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}

impl From<&ProtocolError> for ErrorReply {
    fn from(err: &ProtocolError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Any reply the broker sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Error(ErrorReply),
    Publish(PublishReply),
    Subscribe(SubscribeReply),
    Param(ParamReply),
}

impl ControlResponse {
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        ControlResponse::Error(ErrorReply::new(code, message))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControlResponse::Error(_))
    }
}

/// Serialize a message and append the terminator.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    bytes.push(MESSAGE_TERMINATOR);
    Ok(bytes)
}

/// Decode a reply of the expected shape.
///
/// An error reply becomes [`ProtocolError::Remote`] whatever `T` is.
pub fn decode_response<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let value: serde_json::Value = serde_json::from_slice(strip_terminator(bytes))
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if value.get("error").is_some() {
        let reply: ErrorReply = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed(format!("error reply: {}", e)))?;
        return Err(ProtocolError::Remote {
            code: reply.error.code,
            message: reply.error.message,
        });
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn strip_terminator(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != MESSAGE_TERMINATOR)
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Splits a control stream into NUL-terminated messages.
#[derive(Debug)]
pub struct NulDelimited {
    buffer: Vec<u8>,
    max_size: usize,
}

impl NulDelimited {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size,
        }
    }

    /// Pull available bytes from a non-blocking reader.
    pub fn fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<ReadStatus> {
        read_available(reader, &mut self.buffer)
    }

    /// Feed raw bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete message without its terminator.
    ///
    /// Empty messages (back-to-back terminators) are skipped. An oversized
    /// message discards the buffer.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            let Some(end) = self.buffer.iter().position(|&b| b == MESSAGE_TERMINATOR) else {
                if self.buffer.len() > self.max_size {
                    let size = self.buffer.len();
                    self.buffer.clear();
                    return Err(ProtocolError::MessageTooLarge {
                        size,
                        max: self.max_size,
                    });
                }
                return Ok(None);
            };

            let message: Vec<u8> = self.buffer.drain(..=end).take(end).collect();
            if message.is_empty() {
                continue;
            }
            if message.len() > self.max_size {
                return Err(ProtocolError::MessageTooLarge {
                    size: message.len(),
                    max: self.max_size,
                });
            }
            return Ok(Some(message));
        }
    }

    /// Bytes buffered without a terminator yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
