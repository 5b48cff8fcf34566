//! Simulated radio for host builds.
//!
//! On a development machine the OS owns the network, so this interface only
//! pretends to associate. By default every association succeeds straight
//! away; tests script scan results and per-network status sequences to walk
//! the manager through its fallback paths.

use super::config::ApBroadcastConfig;
use super::iface::{LinkStatus, NetworkInterface, ScanResult, WifiError};
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Station,
    AccessPoint,
}

/// Fake station or access-point interface.
#[derive(Debug)]
pub struct SimulatedInterface {
    role: Role,
    active: bool,
    connected: bool,
    visible: Vec<ScanResult>,
    outcomes: HashMap<String, Vec<LinkStatus>>,
    pending: VecDeque<LinkStatus>,
    attempts: Vec<String>,
    disconnects: usize,
    status_polls: usize,
    applied_ap_config: Option<ApBroadcastConfig>,
}

impl SimulatedInterface {
    fn new(role: Role) -> Self {
        Self {
            role,
            active: false,
            connected: false,
            visible: Vec::new(),
            outcomes: HashMap::new(),
            pending: VecDeque::new(),
            attempts: Vec::new(),
            disconnects: 0,
            status_polls: 0,
            applied_ap_config: None,
        }
    }

    /// A station interface that sees no networks.
    pub fn station() -> Self {
        Self::new(Role::Station)
    }

    /// An access-point interface.
    pub fn access_point() -> Self {
        Self::new(Role::AccessPoint)
    }

    /// Networks returned by every scan, in order.
    pub fn with_visible(mut self, ssids: &[&str]) -> Self {
        self.visible = ssids.iter().map(|s| ScanResult::new(*s)).collect();
        self
    }

    /// Status sequence reported after connecting to `ssid`. The last status
    /// repeats once the sequence is exhausted. Unscripted networks report
    /// [`LinkStatus::GotIp`] immediately.
    pub fn with_outcome(mut self, ssid: &str, statuses: &[LinkStatus]) -> Self {
        self.outcomes.insert(ssid.to_string(), statuses.to_vec());
        self
    }

    /// SSIDs passed to `connect`, in call order.
    pub fn attempts(&self) -> &[String] {
        &self.attempts
    }

    /// Number of explicit `disconnect` calls.
    pub fn disconnects(&self) -> usize {
        self.disconnects
    }

    /// Number of `status` queries.
    pub fn status_polls(&self) -> usize {
        self.status_polls
    }

    /// Last configuration applied through `configure_ap`.
    pub fn applied_ap_config(&self) -> Option<&ApBroadcastConfig> {
        self.applied_ap_config.as_ref()
    }

    fn require(&self, role: Role, op: &'static str) -> Result<(), WifiError> {
        if self.role == role {
            Ok(())
        } else {
            Err(WifiError::Unsupported(op))
        }
    }

    /// Get the primary local IP address.
    ///
    /// Connects a UDP socket to a public address (nothing is sent) and
    /// reads back the local address the OS picked for the default route.
    fn detect_local_ip() -> Option<IpAddr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }
}

impl NetworkInterface for SimulatedInterface {
    fn set_active(&mut self, active: bool) -> Result<(), WifiError> {
        if self.active != active {
            debug!("Simulated {:?} interface active: {}", self.role, active);
        }
        self.active = active;
        if !active {
            self.connected = false;
            self.pending.clear();
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn status(&mut self) -> LinkStatus {
        self.status_polls += 1;
        let status = if self.pending.len() > 1 {
            self.pending.pop_front().unwrap_or(LinkStatus::Idle)
        } else {
            self.pending.front().copied().unwrap_or(LinkStatus::Idle)
        };
        self.connected = status == LinkStatus::GotIp;
        status
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, WifiError> {
        self.require(Role::Station, "scan")?;
        Ok(self.visible.clone())
    }

    fn connect(&mut self, ssid: &str, _password: &str) -> Result<(), WifiError> {
        self.require(Role::Station, "connect")?;
        info!("Simulated association with '{}'", ssid);
        self.attempts.push(ssid.to_string());
        self.connected = false;
        self.pending = self
            .outcomes
            .get(ssid)
            .map(|statuses| statuses.iter().copied().collect())
            .unwrap_or_else(|| VecDeque::from([LinkStatus::GotIp]));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        self.require(Role::Station, "disconnect")?;
        self.disconnects += 1;
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn configure_ap(&mut self, config: &ApBroadcastConfig) -> Result<(), WifiError> {
        self.require(Role::AccessPoint, "configure_ap")?;
        info!("Simulated access point '{}' up", config.essid);
        self.applied_ap_config = Some(config.clone());
        Ok(())
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        if self.connected {
            Self::detect_local_ip()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_association_succeeds() {
        let mut sta = SimulatedInterface::station();
        sta.set_active(true).unwrap();
        sta.connect("Anything", "").unwrap();
        assert_eq!(sta.status(), LinkStatus::GotIp);
        assert!(sta.is_connected());
    }

    #[test]
    fn test_scripted_outcome_repeats_last_status() {
        let mut sta = SimulatedInterface::station()
            .with_outcome("Net", &[LinkStatus::Connecting, LinkStatus::WrongPassword]);
        sta.connect("Net", "").unwrap();
        assert_eq!(sta.status(), LinkStatus::Connecting);
        assert_eq!(sta.status(), LinkStatus::WrongPassword);
        assert_eq!(sta.status(), LinkStatus::WrongPassword);
        assert!(!sta.is_connected());
    }

    #[test]
    fn test_deactivate_drops_association() {
        let mut sta = SimulatedInterface::station();
        sta.connect("Net", "").unwrap();
        sta.status();
        sta.set_active(false).unwrap();
        assert!(!sta.is_connected());
        assert_eq!(sta.status(), LinkStatus::Idle);
    }

    #[test]
    fn test_role_checks() {
        let mut ap = SimulatedInterface::access_point();
        assert_eq!(ap.scan(), Err(WifiError::Unsupported("scan")));
        let mut sta = SimulatedInterface::station();
        assert_eq!(
            sta.configure_ap(&ApBroadcastConfig::default()),
            Err(WifiError::Unsupported("configure_ap"))
        );
    }
}
