//! WiFi provisioning.
//!
//! # Components
//!
//! - [`config`] - known access points and broadcast settings (host-testable)
//! - [`iface`] - [`NetworkInterface`] capability implemented by radio drivers
//! - [`manager`] - connect-or-broadcast state machine
//! - [`simulated`] - fake radio for host builds and tests
//! - `esp` - ESP-IDF driver (ESP32 only)

mod config;
mod iface;
mod manager;
mod simulated;

#[cfg(feature = "esp32")]
mod esp;

pub use config::{
    ApBroadcastConfig, AuthMode, ConfigError, KnownAccessPoint, AP_CONFIG_KEY, KNOWN_APS_KEY,
    MAX_PASSWORD_LEN, MAX_SSID_LEN, MIN_PASSWORD_LEN,
};
pub use iface::{LinkStatus, NetworkInterface, ScanResult, WifiError};
pub use manager::{
    add_known_ap, ap_broadcast_config, known_aps, remove_known_ap, NetworkRole, WifiManager,
    ASSOCIATION_POLL_INTERVAL,
};
pub use simulated::SimulatedInterface;

#[cfg(feature = "esp32")]
pub use esp::{EspAccessPoint, EspRadio, EspStation};
