// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix stream codec for data-plane frames over TCP.
//!
//! TCP is a byte stream without message boundaries; this codec delimits
//! frames with a 4-byte little-endian length prefix:
//!
//! ```text
//! +----------------+------------------+
//! | length (4B LE) | frame body       |
//! +----------------+------------------+
//! ```
//!
//! The codec keeps partial-read state so it composes with non-blocking
//! sockets: call [`StreamCodec::decode`] whenever the socket is readable
//! until it returns `Ok(None)`.

use std::io::{self, Read};

/// Frame header size (length prefix).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Incremental stream codec.
#[derive(Debug)]
pub struct StreamCodec {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    frames_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Header { bytes_read: usize },
    Body { expected: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Header { bytes_read: 0 }
    }
}

impl StreamCodec {
    /// Create a codec with the given maximum frame size.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
            frames_decoded: 0,
            frames_rejected: 0,
        }
    }

    /// Frames successfully decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Frames rejected as oversized.
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Prefix a frame body with its length.
    pub fn encode(body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }

    /// Try to decode one complete frame body from the reader.
    ///
    /// - `Ok(Some(body))` — a complete frame was read
    /// - `Ok(None)` — need more bytes (`WouldBlock`)
    /// - `Err(_)` — I/O error, EOF, or oversized frame
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::Header { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::Header { bytes_read: total };
                                continue;
                            }

                            let len = u32::from_le_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;

                            if len > self.max_size {
                                self.frames_rejected += 1;
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame too large: {} bytes (max {})", len, self.max_size),
                                ));
                            }

                            if len == 0 {
                                self.frames_decoded += 1;
                                self.state = ReadState::default();
                                return Ok(Some(Vec::new()));
                            }

                            self.buffer.resize(len, 0);
                            self.state = ReadState::Body {
                                expected: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::Header { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::Body {
                    expected,
                    bytes_read,
                } => match reader.read(&mut self.buffer[bytes_read..expected]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "incomplete frame body",
                        ));
                    }
                    Ok(n) => {
                        let total = bytes_read + n;
                        if total < expected {
                            self.state = ReadState::Body {
                                expected,
                                bytes_read: total,
                            };
                            continue;
                        }

                        let body = self.buffer[..expected].to_vec();
                        self.frames_decoded += 1;
                        self.buffer.resize(FRAME_HEADER_SIZE, 0);
                        self.state = ReadState::default();
                        return Ok(Some(body));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.state = ReadState::Body {
                            expected,
                            bytes_read,
                        };
                        return Ok(None);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }
}
