//! Blocking socket capability used by the server.
//!
//! The server only needs to bind a port, accept one connection at a time
//! and read/write bytes. [`TcpBinder`] provides that over `std::net`, which
//! works on both host and ESP32 (ESP-IDF supplies the std socket layer).

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};

/// A bound, listening socket.
pub trait Listener {
    type Stream: Read + Write;

    /// Block until a client connects. Returns the stream and a printable
    /// peer address.
    fn accept(&self) -> io::Result<(Self::Stream, String)>;

    /// Port actually bound (meaningful when binding port 0).
    fn local_port(&self) -> io::Result<u16>;
}

/// Creates listeners. Binding the same port again must succeed while
/// connections accepted on the previous listener are still open.
pub trait SocketBinder {
    type Listener: Listener;

    fn bind(&mut self, port: u16) -> io::Result<Self::Listener>;
}

/// `std::net` TCP binder.
#[derive(Debug, Clone, Copy)]
pub struct TcpBinder {
    addr: IpAddr,
}

impl TcpBinder {
    pub fn new(addr: IpAddr) -> Self {
        Self { addr }
    }

    /// All interfaces; used on the device.
    pub fn any() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Loopback only.
    pub fn localhost() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

impl SocketBinder for TcpBinder {
    type Listener = TcpListener;

    fn bind(&mut self, port: u16) -> io::Result<TcpListener> {
        // std enables SO_REUSEADDR on Unix-like targets, so the port can be
        // taken again while the previous listener's connections linger.
        TcpListener::bind(SocketAddr::new(self.addr, port))
    }
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, addr) = TcpListener::accept(self)?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to disable Nagle's algorithm: {}", e);
        }
        Ok((stream, addr.to_string()))
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.local_addr()?.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_binder_rebinds_same_port() {
        let mut binder = TcpBinder::localhost();
        let first = binder.bind(0).unwrap();
        let port = first.local_port().unwrap();

        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let (_served, peer) = Listener::accept(&first).unwrap();
        assert_eq!(peer, client.local_addr().unwrap().to_string());

        drop(first);
        let second = binder.bind(port).unwrap();
        assert_eq!(second.local_port().unwrap(), port);
    }
}
