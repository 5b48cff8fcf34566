//! WiFi provisioning agent for ESP32.
//!
//! The agent joins a known WiFi network, or broadcasts its own access point
//! when none is reachable, and serves a JSON control channel over TCP for
//! registering networks, uploading files and rebooting.
//!
//! Everything except the ESP-IDF drivers is platform-independent and can be
//! tested on the host machine.

pub mod client;
pub mod config;
pub mod discovery;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod wifi;

// Re-export commonly used items
pub use client::{Client, ClientError};
pub use config::{AgentConfig, ConfigStore, PersistPolicy};
pub use discovery::DiscoveryResponder;
pub use platform::{HostPlatform, Platform};
pub use protocol::{Method, ProtocolError, Request, RECEIVE_LEN};
pub use server::{AgentContext, CommandServer, ServerError, TcpBinder, UploadError};
pub use wifi::{KnownAccessPoint, NetworkInterface, NetworkRole, SimulatedInterface, WifiManager};
