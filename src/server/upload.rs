//! File upload over the control channel.
//!
//! After the `load_file` request the agent answers `{"ready": true}` and the
//! client streams exactly `length` raw bytes. They are read in chunks of at
//! most [`RECEIVE_LEN`] bytes, so a 5000 byte file arrives as 2048, 2048
//! and 904.

use super::session::Session;
use crate::protocol::{ready, RECEIVE_LEN};
use log::{info, warn};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Accept a bare file name; anything that could leave the upload
/// directory is refused.
pub fn validate_filename(name: &str) -> Result<&str, UploadError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(UploadError::InvalidFilename(name.to_string()));
    }
    Ok(name)
}

/// Chunk sizes used to receive `length` bytes.
pub fn chunk_sizes(length: u64) -> impl Iterator<Item = usize> {
    let mut remaining = length;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let chunk = remaining.min(RECEIVE_LEN as u64);
        remaining -= chunk;
        Some(chunk as usize)
    })
}

/// Receive a file into `dir`.
///
/// The destination is created (or truncated) before the client is told to
/// start sending. If writing to it fails part way, the remaining bytes are
/// still drained from the connection so the next request parses cleanly,
/// and the write error is reported afterwards.
pub fn receive_file<S: Read + Write>(
    session: &mut Session<S>,
    dir: &Path,
    filename: &str,
    length: u64,
) -> Result<u64, UploadError> {
    let name = validate_filename(filename)?;
    let path = dir.join(name);
    let mut file = File::create(&path).map_err(UploadError::Create)?;

    session.send(&ready()).map_err(UploadError::Transport)?;
    info!(
        "Receiving {} ({} bytes) from {}",
        path.display(),
        length,
        session.peer()
    );

    let mut buf = [0u8; RECEIVE_LEN];
    let mut received = 0u64;
    let mut write_error = None;

    for chunk in chunk_sizes(length) {
        if let Err(e) = session.read_raw_exact(&mut buf[..chunk]) {
            warn!(
                "Upload of {} cut short after {} of {} bytes: {}",
                name, received, length, e
            );
            return Err(UploadError::Truncated {
                received,
                expected: length,
            });
        }
        if write_error.is_none() {
            if let Err(e) = file.write_all(&buf[..chunk]) {
                warn!("Failed writing {}: {}", path.display(), e);
                write_error = Some(e);
            }
        }
        received += chunk as u64;
    }

    if write_error.is_none() {
        if let Err(e) = file.flush() {
            write_error = Some(e);
        }
    }
    if let Some(e) = write_error {
        return Err(UploadError::Write(e));
    }

    info!("Received {} ({} bytes)", path.display(), received);
    Ok(received)
}

/// Upload failures. The `Display` text is sent back to the client.
#[derive(Debug)]
pub enum UploadError {
    /// Name is empty, a dot entry, or contains a path separator.
    InvalidFilename(String),
    /// Destination file could not be opened.
    Create(io::Error),
    /// Writing the destination failed.
    Write(io::Error),
    /// The `ready` message could not be sent.
    Transport(io::Error),
    /// Connection closed before `expected` bytes arrived.
    Truncated { received: u64, expected: u64 },
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFilename(name) => write!(f, "Invalid filename: '{}'", name),
            Self::Create(e) => write!(f, "Cannot open file: {}", e),
            Self::Write(e) => write!(f, "Failed to write file: {}", e),
            Self::Transport(e) => write!(f, "I/O error: {}", e),
            Self::Truncated { received, expected } => write!(
                f,
                "Upload truncated: received {} of {} bytes",
                received, expected
            ),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Create(e) | Self::Write(e) | Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::write_message;
    use serde_json::json;
    use std::io::Cursor;

    /// In-memory duplex stream: reads from a script, records writes.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_sizes() {
        assert_eq!(chunk_sizes(5000).collect::<Vec<_>>(), vec![2048, 2048, 904]);
        assert_eq!(chunk_sizes(4096).collect::<Vec<_>>(), vec![2048, 2048]);
        assert_eq!(chunk_sizes(10).collect::<Vec<_>>(), vec![10]);
        assert_eq!(chunk_sizes(0).count(), 0);
    }

    #[test]
    fn test_filename_validation() {
        assert_eq!(validate_filename("main.py").unwrap(), "main.py");
        assert_eq!(validate_filename(".hidden").unwrap(), ".hidden");
        for bad in ["", ".", "..", "../boot.py", "lib/x.py", "a\\b"] {
            assert!(
                matches!(validate_filename(bad), Err(UploadError::InvalidFilename(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_receive_file_writes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(5000);
        let mut session = Session::new(Duplex::new(data.clone()), "test");

        let received = receive_file(&mut session, dir.path(), "main.py", 5000).unwrap();
        assert_eq!(received, 5000);
        assert_eq!(std::fs::read(dir.path().join("main.py")).unwrap(), data);
    }

    #[test]
    fn test_payload_follows_newline_terminated_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut wire = Vec::new();
        let request = json!({"action": "load_file", "filename": "f", "length": 3});
        write_message(&mut wire, &request).unwrap();
        wire.extend_from_slice(b"abc");
        write_message(&mut wire, &json!({"action": "methods"})).unwrap();
        let mut session = Session::new(Duplex::new(wire), "test");

        assert_eq!(session.next_message().unwrap(), Some(request));
        assert_eq!(receive_file(&mut session, dir.path(), "f", 3).unwrap(), 3);
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"abc");
        assert_eq!(
            session.next_message().unwrap().unwrap()["action"],
            "methods"
        );
    }

    #[test]
    fn test_receive_file_sends_ready_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(Duplex::new(payload(4)), "test");
        receive_file(&mut session, dir.path(), "f.bin", 4).unwrap();

        let sent: serde_json::Value =
            serde_json::from_slice(&session.stream_mut().output).unwrap();
        assert_eq!(sent, json!({"ready": true}));
    }

    #[test]
    fn test_zero_length_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"previous").unwrap();
        let mut session = Session::new(Duplex::new(Vec::new()), "test");

        assert_eq!(receive_file(&mut session, dir.path(), "old.txt", 0).unwrap(), 0);
        assert!(std::fs::read(dir.path().join("old.txt")).unwrap().is_empty());
    }

    #[test]
    fn test_short_stream_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(Duplex::new(payload(3000)), "test");

        let err = receive_file(&mut session, dir.path(), "part.bin", 5000).unwrap_err();
        assert!(matches!(
            err,
            UploadError::Truncated {
                received: 2048,
                expected: 5000
            }
        ));
    }

    #[test]
    fn test_invalid_name_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(Duplex::new(payload(10)), "test");

        let err = receive_file(&mut session, dir.path(), "../x", 10).unwrap_err();
        assert_eq!(err.to_string(), "Invalid filename: '../x'");
        assert!(session.stream_mut().output.is_empty());
    }
}
