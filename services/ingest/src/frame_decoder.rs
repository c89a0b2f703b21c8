//! Accumulation of raw connection bytes and splitting into tick records.
//!
//! Devices write records separated by `\n` or `\r`. A read chunk made of a
//! lone `\r\n` marks the end of the transmission. Any other chunk is payload,
//! including one that merely starts with a CRLF record separator.

use bytes::BytesMut;
use std::borrow::Cow;
use thiserror::Error;

/// Chunk that ends a transmission
pub const END_OF_TRANSMISSION: &[u8] = b"\r\n";

const RECORD_SEPARATORS: [char; 2] = ['\r', '\n'];

/// Errors raised while accumulating a payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },
}

/// What the connection reader should do after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Keep reading
    Continue,
    /// The device finished its transmission
    EndOfTransmission,
}

/// Bytes received on one connection.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_bytes,
        }
    }

    /// Append one read chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<ChunkStatus, FrameError> {
        if chunk == END_OF_TRANSMISSION {
            return Ok(ChunkStatus::EndOfTransmission);
        }

        if self.buf.len() + chunk.len() > self.max_bytes {
            return Err(FrameError::PayloadTooLarge {
                limit: self.max_bytes,
            });
        }

        self.buf.extend_from_slice(chunk);
        Ok(ChunkStatus::Continue)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The accumulated bytes as text. Invalid UTF-8 sequences are replaced,
    /// which makes the affected record fail to decode.
    pub fn payload(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buf)
    }
}

/// Non-empty records of a payload, in transmission order.
pub fn records(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(RECORD_SEPARATORS)
        .filter(|record| !record.trim().is_empty())
}
