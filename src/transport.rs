//! Serial transport for the instrument link.
//!
//! Owns the physical connection and the two primitives the session needs:
//! a cloned blocking-read handle for the receive loop and a command write
//! on the original handle. The clone gives the two directions independent
//! buffers, so a command write from the consumer thread never contends
//! with the receive loop's reads.

use std::io::Write;
use std::time::Duration;

use serialport::SerialPort;
use thiserror::Error;
use tracing::warn;

/// Instrument framing: 9600 baud, 8N1 (serialport defaults).
pub const BAUD_RATE: u32 = 9600;

/// Blocking-read timeout for the receive loop. Bounds how long shutdown
/// can go unobserved.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Bytes buffered without a line terminator before the accumulator gives
/// up on the stream fragment.
const MAX_PENDING: usize = 512;

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device could not be opened. Fatal at startup.
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        source: serialport::Error,
    },
    /// Cloning the port handle for the receive loop failed.
    #[error("cannot clone port handle: {0}")]
    Clone(#[from] serialport::Error),
    /// An i/o operation on the port failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport was already released by `kill`.
    #[error("transport is closed")]
    Closed,
}

/// The open serial connection.
pub struct Transport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl Transport {
    /// Open the device at the instrument's fixed framing.
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                path: path.to_string(),
                source,
            })?;
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    /// Independent handle for the receive loop's blocking reads.
    pub fn reader(&self) -> Result<Box<dyn SerialPort>, TransportError> {
        Ok(self.port.try_clone()?)
    }

    /// Write one command frame. Fire-and-forget: the instrument sends no
    /// acknowledgment, effects show up in subsequent sentences.
    pub fn write_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(cmd)?;
        self.port.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Accumulates raw bytes and yields complete lines.
///
/// Bytes arrive in arbitrary chunks; sentences are `\r\n` (sometimes bare
/// `\n` or `\r`) terminated. Invalid UTF-8 is replaced rather than
/// rejected so a garbled line still reaches the parser as raw text.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_PENDING
            && !self.buffer.iter().any(|&b| b == b'\n' || b == b'\r')
        {
            warn!(len = self.buffer.len(), "discarding unterminated input");
            self.buffer.clear();
        }
    }

    /// Take the next complete line, without its terminator. Empty lines
    /// are skipped.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buffer.iter().position(|&b| b == b'\n' || b == b'\r')?;
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.is_empty() {
                continue;
            }
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_split_across_chunks() {
        let mut lines = LineBuffer::new();
        lines.push(b"$ADR,GM");
        assert_eq!(lines.next_line(), None);
        lines.push(b"01*7F\r\n$ADS");
        assert_eq!(lines.next_line(), Some("$ADR,GM01*7F".to_string()));
        assert_eq!(lines.next_line(), None);
        lines.push(b"*00\n");
        assert_eq!(lines.next_line(), Some("$ADS*00".to_string()));
    }

    #[test]
    fn test_crlf_does_not_produce_empty_lines() {
        let mut lines = LineBuffer::new();
        lines.push(b"one\r\ntwo\r\n\r\nthree\n");
        assert_eq!(lines.next_line(), Some("one".to_string()));
        assert_eq!(lines.next_line(), Some("two".to_string()));
        assert_eq!(lines.next_line(), Some("three".to_string()));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn test_bare_carriage_return_terminates() {
        let mut lines = LineBuffer::new();
        lines.push(b"one\rtwo\r");
        assert_eq!(lines.next_line(), Some("one".to_string()));
        assert_eq!(lines.next_line(), Some("two".to_string()));
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_dropped() {
        let mut lines = LineBuffer::new();
        lines.push(b"ok\xff\xfeline\n");
        let line = lines.next_line().unwrap();
        assert!(line.starts_with("ok"));
        assert!(line.ends_with("line"));
    }

    #[test]
    fn test_unterminated_overflow_is_discarded() {
        let mut lines = LineBuffer::new();
        lines.push(&[b'x'; MAX_PENDING + 1]);
        assert_eq!(lines.next_line(), None);
        // A later complete line still gets through
        lines.push(b"after\n");
        assert_eq!(lines.next_line(), Some("after".to_string()));
    }
}
