//! Radio interface abstraction.
//!
//! The agent drives two logical interfaces, a station and an access point.
//! Both are reached through [`NetworkInterface`] so the connect/broadcast
//! logic runs unchanged on the ESP32 driver and on the host simulator.

use super::config::ApBroadcastConfig;
use std::fmt;
use std::net::IpAddr;

/// Association state reported by a station interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No connection and no attempt in progress.
    Idle,
    /// Association or DHCP still in progress.
    Connecting,
    /// Authentication was rejected.
    WrongPassword,
    /// The target network did not answer.
    NoApFound,
    /// Any other association failure.
    ConnectFailed,
    /// Associated with an IP address.
    GotIp,
}

impl LinkStatus {
    /// True for states that end an association attempt unsuccessfully.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Connecting | Self::GotIp)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::WrongPassword => "wrong password",
            Self::NoApFound => "no AP found",
            Self::ConnectFailed => "connect failed",
            Self::GotIp => "got IP",
        };
        f.write_str(s)
    }
}

/// A network seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i8,
}

impl ScanResult {
    pub fn new(ssid: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            channel: 0,
            rssi: 0,
        }
    }
}

/// Capability set of one radio role.
///
/// Station-only operations (`scan`, `connect`, ...) on an access-point
/// handle, and `configure_ap` on a station handle, return
/// [`WifiError::Unsupported`].
pub trait NetworkInterface {
    /// Power the interface up or down.
    fn set_active(&mut self, active: bool) -> Result<(), WifiError>;

    /// Whether the interface is powered up.
    fn is_active(&self) -> bool;

    /// Current association state. Polled while waiting for an IP.
    fn status(&mut self) -> LinkStatus;

    /// Blocking scan for visible networks.
    fn scan(&mut self) -> Result<Vec<ScanResult>, WifiError>;

    /// Start associating with a network. Does not wait for the outcome.
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), WifiError>;

    /// Drop the current association.
    fn disconnect(&mut self) -> Result<(), WifiError>;

    /// Whether the interface is associated.
    fn is_connected(&self) -> bool;

    /// Apply a broadcast configuration (access-point role).
    fn configure_ap(&mut self, config: &ApBroadcastConfig) -> Result<(), WifiError>;

    /// Local IP address, if known.
    fn ip_addr(&self) -> Option<IpAddr> {
        None
    }
}

/// Errors reported by radio drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiError {
    /// SSID is invalid (too long or contains invalid characters).
    InvalidSsid,
    /// Password is invalid.
    InvalidPassword,
    /// Operation does not apply to this interface role.
    Unsupported(&'static str),
    /// Driver-level failure.
    Driver(String),
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "invalid SSID"),
            Self::InvalidPassword => write!(f, "invalid password"),
            Self::Unsupported(op) => write!(f, "operation not supported: {}", op),
            Self::Driver(e) => write!(f, "driver error: {}", e),
        }
    }
}

impl std::error::Error for WifiError {}
