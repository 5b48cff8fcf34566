//! ESP-IDF radio driver.
//!
//! One `EspWifi` driver serves both roles. [`EspRadio::split`] hands out a
//! station and an access-point handle that share it; whenever either role
//! is switched on or off the driver is reconfigured as client, access point
//! or mixed mode.
//!
//! The agent is single-threaded, so the handles share the driver through
//! `Rc<RefCell<..>>`. Only the disconnect event callback runs on the system
//! event loop task; it communicates through an atomic flag.

use super::config::{ApBroadcastConfig, AuthMode};
use super::iface::{LinkStatus, NetworkInterface, ScanResult, WifiError};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent,
};
use esp_idf_sys::EspError;
use log::{info, warn};
use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

impl From<EspError> for WifiError {
    fn from(e: EspError) -> Self {
        Self::Driver(format!("{:?}", e))
    }
}

fn auth_method(mode: AuthMode) -> AuthMethod {
    match mode {
        AuthMode::Open => AuthMethod::None,
        AuthMode::Wep => AuthMethod::WEP,
        AuthMode::WpaPsk => AuthMethod::WPA,
        AuthMode::Wpa2Psk => AuthMethod::WPA2Personal,
        AuthMode::WpaWpa2Psk => AuthMethod::WPAWPA2Personal,
    }
}

struct RadioInner {
    wifi: EspWifi<'static>,
    sta_active: bool,
    ap_active: bool,
    client: ClientConfiguration,
    access_point: AccessPointConfiguration,
    attempt_in_progress: bool,
    disconnected: Arc<AtomicBool>,
    _subscription: EspSubscription<'static, System>,
}

impl RadioInner {
    /// Push the current role set down to the driver.
    fn apply(&mut self) -> Result<(), EspError> {
        let configuration = match (self.sta_active, self.ap_active) {
            (true, true) => Configuration::Mixed(self.client.clone(), self.access_point.clone()),
            (true, false) => Configuration::Client(self.client.clone()),
            (false, true) => Configuration::AccessPoint(self.access_point.clone()),
            (false, false) => {
                if self.wifi.is_started()? {
                    self.wifi.stop()?;
                }
                return Ok(());
            }
        };

        self.wifi.set_configuration(&configuration)?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }
}

/// Shared ESP32 WiFi driver.
pub struct EspRadio {
    inner: Rc<RefCell<RadioInner>>,
}

impl EspRadio {
    /// Create the driver. Both roles start inactive.
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> Result<Self, EspError> {
        let wifi = EspWifi::new(modem, sysloop.clone(), nvs)?;

        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = disconnected.clone();
        let subscription = sysloop.subscribe::<WifiEvent, _>(move |event| {
            if matches!(event, WifiEvent::StaDisconnected { .. }) {
                flag.store(true, Ordering::Release);
            }
        })?;

        Ok(Self {
            inner: Rc::new(RefCell::new(RadioInner {
                wifi,
                sta_active: false,
                ap_active: false,
                client: ClientConfiguration::default(),
                access_point: AccessPointConfiguration::default(),
                attempt_in_progress: false,
                disconnected,
                _subscription: subscription,
            })),
        })
    }

    /// Station and access-point handles over this driver.
    pub fn split(self) -> (EspStation, EspAccessPoint) {
        (
            EspStation {
                inner: self.inner.clone(),
            },
            EspAccessPoint { inner: self.inner },
        )
    }
}

/// Station role of an [`EspRadio`].
pub struct EspStation {
    inner: Rc<RefCell<RadioInner>>,
}

impl NetworkInterface for EspStation {
    fn set_active(&mut self, active: bool) -> Result<(), WifiError> {
        let mut radio = self.inner.borrow_mut();
        if radio.sta_active == active {
            return Ok(());
        }
        radio.sta_active = active;
        radio.attempt_in_progress = false;
        radio.apply()?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.inner.borrow().sta_active
    }

    fn status(&mut self) -> LinkStatus {
        let radio = self.inner.borrow();
        if !radio.sta_active {
            return LinkStatus::Idle;
        }
        let connected = radio.wifi.is_connected().unwrap_or(false);
        let up = radio.wifi.sta_netif().is_up().unwrap_or(false);
        if connected && up {
            return LinkStatus::GotIp;
        }
        if !radio.attempt_in_progress {
            return LinkStatus::Idle;
        }
        if radio.disconnected.load(Ordering::Acquire) {
            return LinkStatus::ConnectFailed;
        }
        LinkStatus::Connecting
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, WifiError> {
        let mut radio = self.inner.borrow_mut();
        info!("Scanning for WiFi networks...");
        let found = radio.wifi.scan()?;
        Ok(found
            .into_iter()
            .map(|ap| ScanResult {
                ssid: ap.ssid.as_str().to_string(),
                channel: ap.channel,
                rssi: ap.signal_strength,
            })
            .collect())
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), WifiError> {
        let mut radio = self.inner.borrow_mut();
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        radio.client = ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| WifiError::InvalidSsid)?,
            password: password
                .try_into()
                .map_err(|_| WifiError::InvalidPassword)?,
            auth_method,
            ..Default::default()
        };
        radio.apply()?;

        radio.disconnected.store(false, Ordering::Release);
        radio.attempt_in_progress = true;
        radio.wifi.connect()?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        let mut radio = self.inner.borrow_mut();
        info!("Disconnecting from WiFi");
        radio.attempt_in_progress = false;
        radio.wifi.disconnect()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.borrow().wifi.is_connected().unwrap_or(false)
    }

    fn configure_ap(&mut self, _config: &ApBroadcastConfig) -> Result<(), WifiError> {
        Err(WifiError::Unsupported("configure_ap"))
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        let radio = self.inner.borrow();
        radio
            .wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| IpAddr::V4(info.ip))
    }
}

/// Access-point role of an [`EspRadio`].
pub struct EspAccessPoint {
    inner: Rc<RefCell<RadioInner>>,
}

impl NetworkInterface for EspAccessPoint {
    fn set_active(&mut self, active: bool) -> Result<(), WifiError> {
        let mut radio = self.inner.borrow_mut();
        if radio.ap_active == active {
            return Ok(());
        }
        radio.ap_active = active;
        radio.apply()?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.inner.borrow().ap_active
    }

    fn status(&mut self) -> LinkStatus {
        LinkStatus::Idle
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, WifiError> {
        Err(WifiError::Unsupported("scan"))
    }

    fn connect(&mut self, _ssid: &str, _password: &str) -> Result<(), WifiError> {
        Err(WifiError::Unsupported("connect"))
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        Err(WifiError::Unsupported("disconnect"))
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn configure_ap(&mut self, config: &ApBroadcastConfig) -> Result<(), WifiError> {
        let mut radio = self.inner.borrow_mut();
        radio.access_point = AccessPointConfiguration {
            ssid: config
                .essid
                .as_str()
                .try_into()
                .map_err(|_| WifiError::InvalidSsid)?,
            ssid_hidden: config.hidden,
            channel: config.channel,
            auth_method: auth_method(config.authmode),
            password: config
                .password
                .as_str()
                .try_into()
                .map_err(|_| WifiError::InvalidPassword)?,
            ..Default::default()
        };
        if let Err(e) = radio.apply() {
            warn!("Failed to apply access point configuration: {:?}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        let radio = self.inner.borrow();
        radio
            .wifi
            .ap_netif()
            .get_ip_info()
            .ok()
            .map(|info| IpAddr::V4(info.ip))
    }
}
