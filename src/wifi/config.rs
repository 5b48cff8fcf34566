//! WiFi configuration data structures.
//!
//! This module contains platform-independent types for the station and
//! access-point configuration that can be tested on the host machine.
//!
//! # Example
//!
//! ```
//! use wifi_agent_esp32::wifi::{ApBroadcastConfig, AuthMode, KnownAccessPoint};
//!
//! let ap = KnownAccessPoint::new("MyNetwork", "MyPassword", false).unwrap();
//! assert!(ap.validate().is_ok());
//!
//! let broadcast = ApBroadcastConfig::default();
//! assert_eq!(broadcast.authmode, AuthMode::Wpa2Psk);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Setting key holding the known access points, keyed by SSID.
pub const KNOWN_APS_KEY: &str = "known_aps";

/// Setting key holding the access-point broadcast configuration.
pub const AP_CONFIG_KEY: &str = "ap_config";

/// A network the station interface may join automatically.
///
/// Credentials are wiped from memory when the record is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KnownAccessPoint {
    /// Network SSID (1-32 bytes).
    pub ssid: String,
    /// Network password (8-64 bytes for WPA2, empty for open networks).
    pub password: String,
    /// Hidden networks never show up in a scan and are only tried last.
    #[serde(default)]
    pub hidden: bool,
}

impl KnownAccessPoint {
    /// Create a new known access point.
    ///
    /// Returns an error if SSID or password are invalid.
    pub fn new(
        ssid: impl Into<String>,
        password: impl Into<String>,
        hidden: bool,
    ) -> Result<Self, ConfigError> {
        let ap = Self {
            ssid: ssid.into(),
            password: password.into(),
            hidden,
        };
        ap.validate()?;
        Ok(ap)
    }

    /// Validate the credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() {
            return Err(ConfigError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }

        // Empty is OK for open networks
        if !self.password.is_empty() && self.password.len() < MIN_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooShort {
                len: self.password.len(),
                min: MIN_PASSWORD_LEN,
            });
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        Ok(())
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

/// Authentication mode advertised by the access-point interface.
///
/// Stored as the numeric code used by the radio firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AuthMode {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
}

impl AuthMode {
    /// Numeric code for this mode.
    pub fn code(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Wep => 1,
            Self::WpaPsk => 2,
            Self::Wpa2Psk => 3,
            Self::WpaWpa2Psk => 4,
        }
    }
}

impl TryFrom<u8> for AuthMode {
    type Error = ConfigError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Open),
            1 => Ok(Self::Wep),
            2 => Ok(Self::WpaPsk),
            3 => Ok(Self::Wpa2Psk),
            4 => Ok(Self::WpaWpa2Psk),
            other => Err(ConfigError::UnknownAuthMode(other)),
        }
    }
}

impl From<AuthMode> for u8 {
    fn from(mode: AuthMode) -> Self {
        mode.code()
    }
}

/// Configuration applied to the access-point interface when no known
/// network could be joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApBroadcastConfig {
    pub essid: String,
    pub channel: u8,
    pub hidden: bool,
    pub authmode: AuthMode,
    pub password: String,
}

impl Default for ApBroadcastConfig {
    fn default() -> Self {
        Self {
            essid: "FEADFACE".to_string(),
            channel: 11,
            hidden: false,
            authmode: AuthMode::Wpa2Psk,
            password: "DEADBEEF".to_string(),
        }
    }
}

/// Errors that can occur while building WiFi configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
    /// Authentication mode code not understood by the radio.
    UnknownAuthMode(u8),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::UnknownAuthMode(code) => write!(f, "unknown auth mode: {}", code),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_access_point() {
        let ap = KnownAccessPoint::new("TestNetwork", "password123", true).unwrap();
        assert_eq!(ap.ssid, "TestNetwork");
        assert_eq!(ap.password, "password123");
        assert!(ap.hidden);
    }

    #[test]
    fn test_open_network() {
        let ap = KnownAccessPoint::new("OpenNetwork", "", false).unwrap();
        assert!(ap.is_open());
    }

    #[test]
    fn test_empty_ssid() {
        let result = KnownAccessPoint::new("", "password123", false);
        assert_eq!(result, Err(ConfigError::SsidEmpty));
    }

    #[test]
    fn test_ssid_too_long() {
        let result = KnownAccessPoint::new("a".repeat(33), "password123", false);
        assert!(matches!(result, Err(ConfigError::SsidTooLong { .. })));
    }

    #[test]
    fn test_ssid_max_length() {
        assert!(KnownAccessPoint::new("a".repeat(32), "password123", false).is_ok());
    }

    #[test]
    fn test_password_bounds() {
        assert!(matches!(
            KnownAccessPoint::new("Net", "short", false),
            Err(ConfigError::PasswordTooShort { .. })
        ));
        assert!(KnownAccessPoint::new("Net", "12345678", false).is_ok());
        assert!(KnownAccessPoint::new("Net", "a".repeat(64), false).is_ok());
        assert!(matches!(
            KnownAccessPoint::new("Net", "a".repeat(65), false),
            Err(ConfigError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_hidden_defaults_to_false_when_absent() {
        let ap: KnownAccessPoint =
            serde_json::from_value(json!({"ssid": "Home", "password": "secret123"})).unwrap();
        assert!(!ap.hidden);
    }

    #[test]
    fn test_default_broadcast_config_json() {
        let value = serde_json::to_value(ApBroadcastConfig::default()).unwrap();
        assert_eq!(
            value,
            json!({
                "essid": "FEADFACE",
                "channel": 11,
                "hidden": false,
                "authmode": 3,
                "password": "DEADBEEF"
            })
        );
    }

    #[test]
    fn test_unknown_auth_mode_rejected() {
        let result: Result<ApBroadcastConfig, _> = serde_json::from_value(json!({
            "essid": "X", "channel": 1, "hidden": false, "authmode": 9, "password": ""
        }));
        assert!(result.is_err());
        assert_eq!(AuthMode::try_from(9), Err(ConfigError::UnknownAuthMode(9)));
    }
}
