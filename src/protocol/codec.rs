//! Message framing for the control channel.
//!
//! Incoming messages are decoded with a streaming JSON parser, so a request
//! may arrive in a single read, split over several reads, or back-to-back
//! with the next request (newline-separated or not). Anything still
//! buffered after a message belongs to whatever comes next, including the
//! raw bytes of a file upload. A single newline terminating a message is
//! part of that message, even when it arrives in a later read.
//!
//! Outgoing messages are compact JSON terminated by a newline.

use super::RECEIVE_LEN;
use log::debug;
use serde_json::Value;
use std::fmt;
use std::io::{self, Read, Write};

/// Buffered reader that yields one JSON message at a time.
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// The last message ended the buffer; its newline may still be in flight.
    newline_pending: bool,
    /// Dropping the tail of an oversized message up to its newline.
    discarding: bool,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(RECEIVE_LEN),
            newline_pending: false,
            discarding: false,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection. A
    /// malformed message is discarded along with everything buffered after
    /// it. An oversized one is discarded up to and including its newline.
    /// Both are reported as errors; the reader stays usable.
    pub fn next_message(&mut self) -> Result<Option<Value>, CodecError> {
        self.newline_pending = false;
        loop {
            if self.discarding {
                self.discard_through_newline();
            }
            if !self.discarding {
                if let Some(message) = self.decode_buffered()? {
                    return Ok(Some(message));
                }

                if self.buf.len() >= RECEIVE_LEN {
                    let len = self.buf.len();
                    self.buf.clear();
                    self.discarding = true;
                    return Err(CodecError::TooLarge { len });
                }
            }

            if self.fill()? == 0 {
                if !self.buf.is_empty() {
                    debug!(
                        "Peer closed with {} bytes of incomplete message",
                        self.buf.len()
                    );
                    self.buf.clear();
                }
                self.discarding = false;
                return Ok(None);
            }
        }
    }

    /// Append one read from the stream to the buffer.
    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; RECEIVE_LEN];
        let n = self.inner.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn discard_through_newline(&mut self) {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                debug!("Discarded {} bytes of oversized message", end + 1);
                self.buf.drain(..=end);
                self.discarding = false;
            }
            None => self.buf.clear(),
        }
    }

    /// Drop the newline (or CRLF) that terminates the message just decoded.
    fn consume_terminator(&mut self) {
        let len = match self.buf.as_slice() {
            [b'\n', ..] => 1,
            [b'\r', b'\n', ..] => 2,
            [] => {
                self.newline_pending = true;
                0
            }
            _ => 0,
        };
        self.buf.drain(..len);
    }

    /// Try to decode one message from the buffer.
    ///
    /// `Ok(None)` means more bytes are needed.
    fn decode_buffered(&mut self) -> Result<Option<Value>, CodecError> {
        let start = match self.buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => start,
            None => {
                self.buf.clear();
                return Ok(None);
            }
        };
        if start > 0 {
            self.buf.drain(..start);
        }

        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match stream.next() {
            Some(Ok(message)) => {
                let consumed = stream.byte_offset();
                self.buf.drain(..consumed);
                self.consume_terminator();
                Ok(Some(message))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.buf.clear();
                Err(CodecError::Malformed(e.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Fill `out` completely, consuming buffered bytes before reading from
    /// the underlying stream.
    ///
    /// Fails with `UnexpectedEof` if the peer closes first; bytes copied
    /// before that point are lost to the caller.
    pub fn read_raw_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        if self.newline_pending {
            self.newline_pending = false;
            if self.buf.is_empty() && self.fill()? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            if self.buf.first() == Some(&b'\n') {
                self.buf.remove(0);
            }
        }

        let buffered = self.buf.len().min(out.len());
        out[..buffered].copy_from_slice(&self.buf[..buffered]);
        self.buf.drain(..buffered);
        self.inner.read_exact(&mut out[buffered..])
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

/// Write one message followed by a newline.
pub fn write_message<W: Write>(writer: &mut W, message: &Value) -> io::Result<()> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes)?;
    writer.flush()
}

/// Framing errors.
#[derive(Debug)]
pub enum CodecError {
    /// Transport failure; the connection is unusable.
    Io(io::Error),
    /// Bytes that cannot be parsed as JSON.
    Malformed(String),
    /// No complete message within the receive ceiling.
    TooLarge { len: usize },
}

impl CodecError {
    /// Protocol errors are answered on the wire; transport errors end the
    /// connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Malformed(e) => write!(f, "Malformed request: {}", e),
            Self::TooLarge { len } => write!(
                f,
                "Request too large: {} bytes without a complete message (max {})",
                len, RECEIVE_LEN
            ),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
