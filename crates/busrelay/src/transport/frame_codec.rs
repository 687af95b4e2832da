// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for data-plane messages.
//!
//! TCP is a stream protocol without message boundaries. Every payload moved
//! between a Sink and a Source is framed as:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Payload           |
//! +----------------+-------------------+
//! ```
//!
//! A zero-length frame is legal on the wire and is treated as a keepalive
//! by the receiving Source.

use std::io::{self, Read};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Outcome of draining a non-blocking reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStatus {
    /// Bytes appended to the buffer.
    pub bytes: usize,
    /// Peer closed its side (EOF observed).
    pub closed: bool,
}

/// Read everything currently available from a non-blocking reader.
///
/// Stops at `WouldBlock` or EOF. Bytes read before EOF are kept so frames
/// sent right before a close are not lost.
pub fn read_available<R: Read + ?Sized>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<ReadStatus> {
    let mut status = ReadStatus::default();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => {
                status.closed = true;
                return Ok(status);
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                status.bytes += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(status),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Length-prefix frame codec.
///
/// Accumulates raw stream bytes and hands out complete payloads.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    frames_rejected: u64,
}

impl FrameCodec {
    /// Create a codec with the given maximum payload size.
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(READ_CHUNK),
            max_size,
            frames_decoded: 0,
            frames_rejected: 0,
        }
    }

    /// Encode a payload into a framed buffer.
    pub fn encode(payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut frame)?;
        Ok(frame)
    }

    /// Append a framed payload to an existing buffer.
    ///
    /// Fails without touching `buf` if the length does not fit the header.
    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) -> io::Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes does not fit a frame header", payload.len()),
            )
        })?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(())
    }

    /// Pull available bytes from `reader` into the codec.
    pub fn fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<ReadStatus> {
        read_available(reader, &mut self.buffer)
    }

    /// Feed raw bytes (tests and in-memory streams).
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete payload, if one is buffered.
    ///
    /// A frame announcing more than `max_size` bytes is a protocol violation:
    /// the error is returned and the buffer discarded, since the stream can
    /// no longer be resynchronised.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > self.max_size {
            self.frames_rejected += 1;
            self.buffer.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes (max {})", len, self.max_size),
            ));
        }

        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        let payload = self.buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        self.buffer.drain(..FRAME_HEADER_SIZE + len);
        self.frames_decoded += 1;
        Ok(Some(payload))
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of frames decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Number of oversized frames rejected.
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Drop any partial frame (after a reconnect).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
