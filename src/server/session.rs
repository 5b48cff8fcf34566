//! One client connection on the control channel.

use crate::protocol::{write_message, CodecError, MessageReader};
use log::debug;
use serde_json::Value;
use std::io::{self, Read, Write};

/// A connected client: framed reads, newline-terminated writes, and raw
/// byte access for uploads.
pub struct Session<S> {
    reader: MessageReader<S>,
    peer: String,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            reader: MessageReader::new(stream),
            peer: peer.into(),
        }
    }

    /// Peer address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Next message from the client, `None` once it has disconnected.
    pub fn next_message(&mut self) -> Result<Option<Value>, CodecError> {
        self.reader.next_message()
    }

    /// Send one message.
    pub fn send(&mut self, message: &Value) -> io::Result<()> {
        debug!("-> {}: {}", self.peer, message);
        write_message(self.reader.get_mut(), message)
    }

    /// Underlying stream.
    pub fn stream_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    /// Fill `out` with raw bytes from the client.
    pub fn read_raw_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        self.reader.read_raw_exact(out)
    }
}
