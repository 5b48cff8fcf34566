//! UDP discovery responder.
//!
//! Hosts find the agent by sending `ping` to the multicast group
//! [`DISCOVERY_GROUP`]:[`DISCOVERY_PORT`]. The agent answers the sender
//! directly with its control port as ASCII decimal, e.g. `8080`.
//!
//! The responder runs in a background thread and is stopped when dropped.

use log::{debug, error, info, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Multicast group hosts send discovery probes to.
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);

/// UDP port discovery probes are sent to.
pub const DISCOVERY_PORT: u16 = 45362;

/// Probe payload.
pub const PING: &[u8] = b"ping";

/// Largest reply: a port number has at most five digits.
pub const MAX_REPLY_LEN: usize = 5;

/// Interval at which the responder checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reply to a probe datagram, if it is one.
pub fn reply_for(datagram: &[u8], control_port: u16) -> Option<String> {
    if std::str::from_utf8(datagram).map(str::trim) == Ok("ping") {
        Some(control_port.to_string())
    } else {
        None
    }
}

/// Background discovery responder.
pub struct DiscoveryResponder {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl DiscoveryResponder {
    /// Listen on [`DISCOVERY_PORT`] and join [`DISCOVERY_GROUP`].
    pub fn start(control_port: u16) -> io::Result<Self> {
        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT));
        Self::start_on(bind, Some(DISCOVERY_GROUP), control_port)
    }

    /// Listen on `bind`, optionally joining a multicast group.
    pub fn start_on(
        bind: SocketAddr,
        group: Option<Ipv4Addr>,
        control_port: u16,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        if let Some(group) = group {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        info!(
            "Discovery responder on {} answering with port {}",
            local_addr, control_port
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::spawn(move || {
            Self::run(socket, control_port, shutdown_clone);
        });

        Ok(Self {
            handle: Some(handle),
            shutdown,
            local_addr,
        })
    }

    /// Address the responder is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn run(socket: UdpSocket, control_port: u16, shutdown: Arc<AtomicBool>) {
        let mut buf = [0u8; 64];
        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Discovery responder shutting down");
                break;
            }

            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => match reply_for(&buf[..n], control_port) {
                    Some(reply) => {
                        debug!("Discovery probe from {}", peer);
                        if let Err(e) = socket.send_to(reply.as_bytes(), peer) {
                            warn!("Failed to answer discovery probe from {}: {}", peer, e);
                        }
                    }
                    None => debug!("Ignoring {} byte datagram from {}", n, peer),
                },
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    error!("Discovery socket error: {}", e);
                    break;
                }
            }
        }
    }

    /// Stop the responder.
    ///
    /// Note: May take up to 100ms due to polling interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.stop();
    }
}
