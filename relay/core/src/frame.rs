//! Frame Protocol
//!
//! Wire format between the relay and its clients: newline-delimited JSON.
//!
//! # Frame Format
//!
//! ```text
//! +------------------------------------------+------+
//! | JSON Payload (compact, no raw newlines)  | '\n' |
//! | Envelope, StreamRequest or Rejection     |      |
//! +------------------------------------------+------+
//! ```
//!
//! Compact `serde_json` output never contains a raw newline (newlines inside
//! strings are escaped), so the delimiter is unambiguous.
//!
//! # Security
//!
//! - Maximum frame size is enforced on both encode and decode
//! - A peer that never sends a newline cannot grow the buffer past the limit

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::envelope::{Envelope, ErrorCode};

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame delimiter
const DELIMITER: u8 = b'\n';

/// Headers an HTTP layer must send with a relay stream
///
/// These disable intermediary buffering (reverse proxies, CDNs) so each
/// frame reaches the client as soon as it is written.
pub const STREAM_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "application/x-ndjson"),
    ("Cache-Control", "no-cache"),
    ("X-Accel-Buffering", "no"),
];

/// Errors from the frame layer
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO error from the underlying connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame exceeds the configured maximum
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Observed size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Encode a message to a newline-terminated frame
///
/// # Errors
///
/// Returns `TransportError::Serialization` if JSON serialization fails and
/// `TransportError::FrameTooLarge` if the frame exceeds `MAX_FRAME_SIZE`.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    encode_with_limit(msg, MAX_FRAME_SIZE)
}

fn encode_with_limit<T: Serialize>(msg: &T, max: usize) -> Result<Vec<u8>, TransportError> {
    let mut buf =
        serde_json::to_vec(msg).map_err(|e| TransportError::Serialization(e.to_string()))?;

    if buf.len() > max {
        return Err(TransportError::FrameTooLarge {
            size: buf.len(),
            max,
        });
    }

    buf.push(DELIMITER);
    Ok(buf)
}

/// Encoder for envelope output
#[derive(Debug)]
pub struct FrameEncoder {
    max_frame_size: usize,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    /// Create a new encoder with the default frame limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new encoder with a custom frame limit
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encode any message to bytes
    ///
    /// # Errors
    ///
    /// See [`encode`].
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, TransportError> {
        encode_with_limit(msg, self.max_frame_size)
    }

    /// Encode an envelope, never failing
    ///
    /// An envelope that cannot be encoded is a bug. It is logged and replaced
    /// by a generic `error` frame carrying the same timestamp. That frame is
    /// terminal: a writer that gets [`EnvelopeFrame::Fallback`] must end the
    /// session and write nothing after it.
    #[must_use]
    pub fn encode_envelope(&self, envelope: &Envelope) -> EnvelopeFrame {
        match self.encode(envelope) {
            Ok(frame) => EnvelopeFrame::Encoded(frame),
            Err(e) => {
                tracing::error!(kind = %envelope.kind(), error = %e, "Failed to encode envelope");
                EnvelopeFrame::Fallback(fallback_frame(envelope.emitted_at))
            }
        }
    }
}

/// Output of [`FrameEncoder::encode_envelope`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeFrame {
    /// The envelope as asked for
    Encoded(Vec<u8>),
    /// An `encoding_failure` error frame standing in for the envelope
    Fallback(Vec<u8>),
}

impl EnvelopeFrame {
    /// Whether this is the terminal stand-in frame
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    /// Bytes to write
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Encoded(bytes) | Self::Fallback(bytes) => bytes,
        }
    }

    /// Take the bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Encoded(bytes) | Self::Fallback(bytes) => bytes,
        }
    }
}

/// Hand-built frame for the encoding-failure envelope
///
/// Does not go through serde so it cannot itself fail.
fn fallback_frame(emitted_at: u64) -> Vec<u8> {
    let code = ErrorCode::EncodingFailure;
    format!(
        "{{\"type\":\"error\",\"payload\":{{\"message\":\"{}\",\"code\":\"{}\"}},\"emitted_at\":{emitted_at}}}\n",
        code.public_message(),
        code.as_str()
    )
    .into_bytes()
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom frame limit
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_frame_size,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::FrameTooLarge)` if a line exceeds the limit
    /// - `Err(TransportError::Serialization)` if a line is not valid JSON for `T`
    ///
    /// Blank lines are skipped.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let Some(newline) = pending.iter().position(|&b| b == DELIMITER) else {
                if pending.len() > self.max_frame_size {
                    return Err(TransportError::FrameTooLarge {
                        size: pending.len(),
                        max: self.max_frame_size,
                    });
                }
                return Ok(None);
            };

            if newline > self.max_frame_size {
                return Err(TransportError::FrameTooLarge {
                    size: newline,
                    max: self.max_frame_size,
                });
            }

            let line_start = self.read_pos;
            let line_end = line_start + newline;
            self.read_pos = line_end + 1;

            let line = &self.buffer[line_start..line_end];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let msg = serde_json::from_slice(line)
                .map_err(|e| TransportError::Serialization(e.to_string()))?;
            return Ok(Some(msg));
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
