//! Connect-or-broadcast decision engine.
//!
//! [`WifiManager::reset`] leaves the device either associated with one of
//! the known networks or broadcasting its own access point:
//!
//! ```text
//! reset ─► both interfaces down ─► connect() ──ok──► station
//!                                       │
//!                                     fail
//!                                       ▼
//!                            station down, broadcast() ──► access point
//! ```
//!
//! Known networks live in the [`ConfigStore`] under
//! [`KNOWN_APS_KEY`](super::config::KNOWN_APS_KEY), keyed by SSID. The
//! manager never caches them; every `connect` reads the current store.

use super::config::{ApBroadcastConfig, KnownAccessPoint, AP_CONFIG_KEY, KNOWN_APS_KEY};
use super::iface::{LinkStatus, NetworkInterface};
use crate::config::ConfigStore;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between link status polls while associating.
pub const ASSOCIATION_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Role the radio ended up in after [`WifiManager::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    /// Associated with a known network.
    Station,
    /// Broadcasting the configured access point.
    AccessPoint,
}

impl fmt::Display for NetworkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Station => write!(f, "station"),
            Self::AccessPoint => write!(f, "access point"),
        }
    }
}

/// WiFi state machine over a station and an access-point interface.
pub struct WifiManager<S, A> {
    sta: S,
    ap: A,
    poll_interval: Duration,
    max_association_wait: Option<Duration>,
}

impl<S, A> WifiManager<S, A>
where
    S: NetworkInterface,
    A: NetworkInterface,
{
    /// Create a manager that waits indefinitely for each association.
    pub fn new(sta: S, ap: A) -> Self {
        Self {
            sta,
            ap,
            poll_interval: ASSOCIATION_POLL_INTERVAL,
            max_association_wait: None,
        }
    }

    /// Give up on an association attempt that is still connecting after `wait`.
    pub fn with_max_association_wait(mut self, wait: Option<Duration>) -> Self {
        self.max_association_wait = wait;
        self
    }

    /// Override the status poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn station(&self) -> &S {
        &self.sta
    }

    pub fn station_mut(&mut self) -> &mut S {
        &mut self.sta
    }

    pub fn access_point(&self) -> &A {
        &self.ap
    }

    pub fn access_point_mut(&mut self) -> &mut A {
        &mut self.ap
    }

    /// Take both interfaces down, then join a known network or fall back to
    /// broadcasting.
    pub fn reset(&mut self, store: &ConfigStore) -> NetworkRole {
        set_active(&mut self.sta, false, "station");
        set_active(&mut self.ap, false, "access point");

        if self.connect(store) {
            return NetworkRole::Station;
        }

        info!("No known network reachable, switching to access point");
        set_active(&mut self.sta, false, "station");
        self.broadcast(store);
        NetworkRole::AccessPoint
    }

    /// Try the known networks: visible ones in scan order first, then the
    /// hidden ones in configuration order.
    ///
    /// Returns `true` as soon as one association reaches [`LinkStatus::GotIp`].
    pub fn connect(&mut self, store: &ConfigStore) -> bool {
        if !self.sta.is_active() {
            set_active(&mut self.sta, true, "station");
        }
        if self.sta.is_connected() {
            if let Err(e) = self.sta.disconnect() {
                warn!("Failed to disconnect station: {}", e);
            }
        }

        let known = known_aps(store);
        if known.is_empty() {
            debug!("No known access points configured");
            return false;
        }

        let visible = match self.sta.scan() {
            Ok(visible) => visible,
            Err(e) => {
                warn!("WiFi scan failed: {}", e);
                Vec::new()
            }
        };

        let mut attempted: Vec<&str> = Vec::new();
        for network in &visible {
            debug!("Checking if we know AP: {}", network.ssid);
            let Some(ap) = known.iter().find(|ap| ap.ssid == network.ssid) else {
                continue;
            };
            if attempted.contains(&ap.ssid.as_str()) {
                continue;
            }
            attempted.push(&ap.ssid);
            info!("Trying to connect to AP: {}", ap.ssid);
            if self.attempt(ap) {
                return true;
            }
        }

        for ap in known.iter().filter(|ap| ap.hidden) {
            if attempted.contains(&ap.ssid.as_str()) {
                continue;
            }
            attempted.push(&ap.ssid);
            info!("Trying to connect to hidden AP: {}", ap.ssid);
            if self.attempt(ap) {
                return true;
            }
        }

        false
    }

    fn attempt(&mut self, ap: &KnownAccessPoint) -> bool {
        if let Err(e) = self.sta.connect(&ap.ssid, &ap.password) {
            warn!("Failed to start association with '{}': {}", ap.ssid, e);
            return false;
        }
        self.await_association()
    }

    /// Block until the station gets an IP or reports a failure state.
    ///
    /// Without a configured maximum wait this polls for as long as the
    /// driver reports [`LinkStatus::Connecting`].
    pub fn await_association(&mut self) -> bool {
        let started = Instant::now();
        loop {
            match self.sta.status() {
                LinkStatus::GotIp => {
                    match self.sta.ip_addr() {
                        Some(ip) => info!("Connected, IP: {}", ip),
                        None => info!("Connected"),
                    }
                    return true;
                }
                LinkStatus::Connecting => {
                    if let Some(max) = self.max_association_wait {
                        if started.elapsed() >= max {
                            warn!("Association still pending after {:?}, giving up", max);
                            return false;
                        }
                    }
                    debug!("Connecting...");
                    thread::sleep(self.poll_interval);
                }
                failed => {
                    warn!("Association failed: {}", failed);
                    return false;
                }
            }
        }
    }

    /// Bring up the access point with the stored or default configuration.
    pub fn broadcast(&mut self, store: &ConfigStore) {
        if !self.ap.is_active() {
            set_active(&mut self.ap, true, "access point");
        }

        let config = ap_broadcast_config(store);
        info!(
            "Broadcasting '{}' on channel {} (auth mode {})",
            config.essid,
            config.channel,
            config.authmode.code()
        );
        if let Err(e) = self.ap.configure_ap(&config) {
            warn!("Failed to configure access point: {}", e);
        }
    }
}

fn set_active<I: NetworkInterface>(iface: &mut I, active: bool, name: &str) {
    if let Err(e) = iface.set_active(active) {
        warn!(
            "Failed to {} {} interface: {}",
            if active { "activate" } else { "deactivate" },
            name,
            e
        );
    }
}

/// Known access points in configuration order.
///
/// Malformed entries are skipped with a warning.
pub fn known_aps(store: &ConfigStore) -> Vec<KnownAccessPoint> {
    let Some(Value::Object(entries)) = store.get(KNOWN_APS_KEY) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(
            |(ssid, entry)| match serde_json::from_value::<KnownAccessPoint>(entry.clone()) {
                Ok(ap) => Some(ap),
                Err(e) => {
                    warn!("Ignoring malformed known AP '{}': {}", ssid, e);
                    None
                }
            },
        )
        .collect()
}

/// Register (or overwrite) a known access point.
///
/// Takes effect on the next [`WifiManager::connect`] or [`WifiManager::reset`].
pub fn add_known_ap(store: &mut ConfigStore, ap: KnownAccessPoint) {
    let mut entries = match store.get(KNOWN_APS_KEY) {
        Some(Value::Object(entries)) => entries.clone(),
        _ => Map::new(),
    };
    info!("Adding known AP '{}' (hidden: {})", ap.ssid, ap.hidden);
    entries.insert(
        ap.ssid.clone(),
        serde_json::json!({
            "ssid": ap.ssid,
            "password": ap.password,
            "hidden": ap.hidden,
        }),
    );
    store.set(KNOWN_APS_KEY, Value::Object(entries));
}

/// Forget a known access point. Unknown SSIDs are ignored.
pub fn remove_known_ap(store: &mut ConfigStore, ssid: &str) {
    let Some(Value::Object(entries)) = store.get(KNOWN_APS_KEY) else {
        return;
    };
    if !entries.contains_key(ssid) {
        return;
    }
    info!("Removing known AP '{}'", ssid);
    // Rebuild to keep the remaining entries in configuration order
    let remaining: Map<String, Value> = entries
        .iter()
        .filter(|(key, _)| key.as_str() != ssid)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    store.set(KNOWN_APS_KEY, Value::Object(remaining));
}

/// Stored broadcast configuration, or the default when absent or malformed.
pub fn ap_broadcast_config(store: &ConfigStore) -> ApBroadcastConfig {
    match store.get(AP_CONFIG_KEY) {
        None => ApBroadcastConfig::default(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!("Invalid {} setting ({}), using default", AP_CONFIG_KEY, e);
            ApBroadcastConfig::default()
        }),
    }
}
