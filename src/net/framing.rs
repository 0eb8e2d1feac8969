//! Byte-level framing for the opcode stream protocol
//!
//! Packets carry no length prefix: a packet ends where its opcode-specific
//! body ends. [`PacketBuffer`] accumulates socket reads until a whole packet
//! is available, [`FrameBuilder`]/[`FrameReader`] do little-endian encoding.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::game::constants::net::{MAX_PENDING_INPUT, READ_CHUNK_SIZE};

/// Errors that can occur while moving bytes on a stream
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Pending input too large: {0} bytes (max {1})")]
    BufferOverflow(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Accumulates raw input for one connection
///
/// Bytes before the read cursor have been consumed by complete packets and
/// are discarded on the next compaction.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(READ_CHUNK_SIZE),
            cursor: 0,
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.compact();
        let pending = self.data.len() + bytes.len();
        if pending > MAX_PENDING_INPUT {
            return Err(FramingError::BufferOverflow(pending, MAX_PENDING_INPUT));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Unconsumed bytes, starting at the head of the next packet
    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    /// Mark `n` bytes at the head as consumed
    pub fn consume(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cursor >= self.data.len()
    }

    fn compact(&mut self) {
        if self.cursor > 0 {
            self.data.drain(..self.cursor);
            self.cursor = 0;
        }
    }
}

/// Read one chunk from the stream into the buffer
///
/// Returns the number of bytes read; a clean EOF is `ConnectionClosed`.
pub async fn read_into<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut PacketBuffer,
) -> Result<usize, FramingError> {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let n = match stream.read(&mut chunk).await {
        Ok(0) => return Err(FramingError::ConnectionClosed),
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    };
    buffer.extend(&chunk[..n])?;
    Ok(n)
}

/// Write one encoded packet to the stream
pub async fn write_packet<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Frame builder for constructing packets
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(32),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Write raw bytes
    pub fn write(mut self, data: &[u8]) -> Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn write_u8(mut self, value: u8) -> Self {
        self.buffer.push(value);
        self
    }

    pub fn write_bool(self, value: bool) -> Self {
        self.write_u8(u8::from(value))
    }

    /// Write a u16 (little-endian)
    pub fn write_u16(mut self, value: u16) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a u32 (little-endian)
    pub fn write_u32(mut self, value: u32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a UTF-8 string with a u16 length prefix
    ///
    /// Strings longer than `u16::MAX` bytes are cut at a char boundary.
    pub fn write_string(self, value: &str) -> Self {
        let mut end = value.len().min(usize::from(u16::MAX));
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = &value.as_bytes()[..end];
        self.write_u16(bytes.len() as u16).write(bytes)
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame reader for parsing packets
///
/// Every read returns `None` when the data runs out, leaving the caller to
/// decide whether that means "incomplete" or "malformed".
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read n bytes
    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.position + n > self.data.len() {
            return None;
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    /// Read a u16 (little-endian)
    pub fn read_u16(&mut self) -> Option<u16> {
        self.read(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a u32 (little-endian)
    pub fn read_u32(&mut self) -> Option<u32> {
        self.read(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Look at the next u16 without advancing
    pub fn peek_u16(&self) -> Option<u16> {
        self.data
            .get(self.position..self.position + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a u16 length prefix and that many bytes
    ///
    /// On a short read the cursor is left where it was.
    pub fn read_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = usize::from(self.peek_u16()?);
        if self.position + 2 + len > self.data.len() {
            return None;
        }
        self.position += 2;
        self.read(len)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.position
    }
}
