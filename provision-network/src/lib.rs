//! Network Service (C7): scan, connect, probe, and persist, bound to
//! NetworkManager over D-Bus (§4.7, §4.7a). The wire shape follows the
//! `NetworkManager` D-Bus client found in the retrieved corpus
//! (`orb-connd`'s `network_manager` module): `.Device.Wireless`,
//! `.AccessPoint`, `.Settings.Connection`, and `.Connection.Active` proxies
//! for scan/connect/profile-listing/activation.

pub mod policy;
mod proxies;

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use provision_core::transport::{ConnectError, WifiTransport, WifiTransportError};
use provision_core::events::ConnectFailureKind;
use provision_core::SecurityType;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

use policy::{adaptive_timeout, backoff_delay, NetworkInfo, ScanCache, CONNECT_RETRIES};
use proxies::{
    AccessPointProxy, ActiveProxy, DeviceProxy, Ip4ConfigProxy, NetworkManagerProxy, SettingsConnectionProxy, SettingsProxy,
    WirelessProxy, NM_ACTIVE_CONNECTION_STATE_ACTIVATED, NM_DEVICE_TYPE_WIFI,
};

const PROFILE_ID: &str = "rockpi-provisioning";
/// Window within which a connection that activates fully and then drops is
/// still counted as its original success for `is_connected`'s freshness
/// check; beyond it a fresh probe is required.
const PROBE_FRESHNESS: Duration = Duration::from_secs(45);

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("credentials were rejected by the access point")]
    BadCredentials,
    #[error("connection attempt timed out")]
    Timeout,
    #[error("network not found in range")]
    NoSuchNetwork,
    #[error("802.1X/EAP authentication failed")]
    AuthFailed,
    #[error("DHCP lease was not obtained")]
    DhcpFailed,
    #[error("liveness probe failed after IP assignment")]
    ProbeFailed,
    #[error("no Wi-Fi device present")]
    NoWifiDevice,
    #[error(transparent)]
    Dbus(#[from] zbus::Error),
}

impl NetworkError {
    /// §4.7: only `BadCredentials` and `AuthFailed` are user-correctable.
    fn failure_kind(&self) -> ConnectFailureKind {
        match self {
            NetworkError::BadCredentials | NetworkError::AuthFailed => ConnectFailureKind::UserCorrectable,
            _ => ConnectFailureKind::Transient,
        }
    }

    fn into_connect_error(self) -> ConnectError {
        ConnectError {
            kind: self.failure_kind(),
            message: self.to_string(),
        }
    }
}

fn security_to_key_mgmt(security: SecurityType) -> &'static str {
    match security {
        SecurityType::Open => "none",
        SecurityType::Wpa2 => "wpa-psk",
        SecurityType::Wpa3 => "sae",
        SecurityType::Enterprise => "wpa-eap",
    }
}

struct ProbeRecord {
    at: Instant,
    ok: bool,
}

pub struct NetworkManagerWifi {
    conn: zbus::Connection,
    connection_lock: Mutex<()>,
    scan_cache: Mutex<ScanCache>,
    consecutive_failures: AtomicU32,
    last_probe: Mutex<Option<ProbeRecord>>,
    probe_endpoint: String,
}

impl NetworkManagerWifi {
    /// Connects to the system bus NetworkManager listens on.
    pub async fn system(probe_endpoint: impl Into<String>) -> Result<Self, NetworkError> {
        let conn = zbus::Connection::system().await?;
        Ok(Self::new(conn, probe_endpoint))
    }

    pub fn new(conn: zbus::Connection, probe_endpoint: impl Into<String>) -> Self {
        Self {
            conn,
            connection_lock: Mutex::new(()),
            scan_cache: Mutex::new(ScanCache::default()),
            consecutive_failures: AtomicU32::new(0),
            last_probe: Mutex::new(None),
            probe_endpoint: probe_endpoint.into(),
        }
    }

    async fn find_wifi_device(&self) -> Result<OwnedObjectPath, NetworkError> {
        let nm = NetworkManagerProxy::new(&self.conn).await?;
        for path in nm.get_all_devices().await? {
            let dev = DeviceProxy::builder(&self.conn).path(path.clone())?.build().await?;
            if dev.device_type().await.unwrap_or(0) == NM_DEVICE_TYPE_WIFI {
                return Ok(path);
            }
        }
        Err(NetworkError::NoWifiDevice)
    }

    async fn remove_existing_profile(&self, settings: &SettingsProxy<'_>) -> Result<(), NetworkError> {
        for path in settings.list_connections().await? {
            let conn = SettingsConnectionProxy::builder(&self.conn).path(path.clone())?.build().await?;
            let data = conn.get_settings().await?;
            let matches = data
                .get("connection")
                .and_then(|c| c.get("id"))
                .and_then(|v| v.downcast_ref::<String>().ok())
                .is_some_and(|id| id == PROFILE_ID);
            if matches {
                conn.delete().await?;
            }
        }
        Ok(())
    }

    /// Creates (replacing any prior one) the single Wi-Fi profile this daemon
    /// drives, and returns its settings-object path.
    async fn ensure_profile(&self, ssid: &str, password: &str, security: SecurityType) -> Result<OwnedObjectPath, NetworkError> {
        let settings = SettingsProxy::new(&self.conn).await?;
        self.remove_existing_profile(&settings).await?;

        let connection: HashMap<&str, Value<'_>> =
            HashMap::from_iter([("id", Value::from(PROFILE_ID)), ("type", Value::from("802-11-wireless")), ("autoconnect", Value::from(true))]);
        let wifi: HashMap<&str, Value<'_>> = HashMap::from_iter([("ssid", Value::from(ssid.as_bytes())), ("mode", Value::from("infrastructure"))]);
        let ipv4: HashMap<&str, Value<'_>> = HashMap::from_iter([("method", Value::from("auto"))]);
        let ipv6: HashMap<&str, Value<'_>> = HashMap::from_iter([("method", Value::from("ignore"))]);

        let mut settings_map: HashMap<&str, HashMap<&str, Value<'_>>> =
            HashMap::from_iter([("connection", connection), ("802-11-wireless", wifi), ("ipv4", ipv4), ("ipv6", ipv6)]);

        if security != SecurityType::Open {
            let sec: HashMap<&str, Value<'_>> =
                HashMap::from_iter([("key-mgmt", Value::from(security_to_key_mgmt(security))), ("psk", Value::from(password))]);
            settings_map.insert("802-11-wireless-security", sec);
        }

        let path = settings.add_connection(settings_map).await?;
        Ok(path)
    }

    /// Activates `profile` on `device` and waits (up to `timeout`) for the
    /// active connection to report `Activated`. Returns the active
    /// connection's object path.
    async fn activate_and_wait(
        &self,
        profile: &OwnedObjectPath,
        device: &OwnedObjectPath,
        timeout: Duration,
    ) -> Result<OwnedObjectPath, NetworkError> {
        let nm = NetworkManagerProxy::new(&self.conn).await?;
        let root = ObjectPath::try_from("/").expect("static path");
        let active_path = nm.activate_connection(profile.as_ref(), device.as_ref(), &root).await?;

        let deadline = Instant::now() + timeout;
        let mut consecutive_missing = 0u32;
        loop {
            if Instant::now() >= deadline {
                return Err(NetworkError::Timeout);
            }
            match ActiveProxy::builder(&self.conn).path(active_path.clone())?.build().await {
                Ok(active) => match active.state().await {
                    Ok(state) if state == NM_ACTIVE_CONNECTION_STATE_ACTIVATED => return Ok(active_path),
                    Ok(_) => {
                        consecutive_missing = 0;
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Err(_) => {
                        consecutive_missing += 1;
                        if consecutive_missing >= 3 {
                            // NM tore the active connection down almost immediately; in
                            // practice this is a rejected PSK or EAP handshake failure.
                            return Err(NetworkError::BadCredentials);
                        }
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                },
                Err(_) => {
                    consecutive_missing += 1;
                    if consecutive_missing >= 3 {
                        return Err(NetworkError::BadCredentials);
                    }
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            }
        }
    }

    async fn wait_for_ip(&self, active: &OwnedObjectPath, timeout: Duration) -> Result<(), NetworkError> {
        let active_proxy = ActiveProxy::builder(&self.conn).path(active.clone())?.build().await?;
        let deadline = Instant::now() + timeout;
        loop {
            let ip4_path = active_proxy.ip4_config().await?;
            if ip4_path.as_str() != "/" {
                let ip4 = Ip4ConfigProxy::builder(&self.conn).path(ip4_path)?.build().await?;
                if !ip4.address_data().await.unwrap_or_default().is_empty() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(NetworkError::DhcpFailed);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn probe_liveness(&self, timeout: Duration) -> bool {
        let endpoint = self.probe_endpoint.clone();
        let attempt = async move {
            let addr = endpoint.to_socket_addrs().ok()?.next()?;
            TcpStream::connect(addr).await.ok()
        };
        matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(_)))
    }

    async fn record_probe(&self, ok: bool) {
        *self.last_probe.lock().await = Some(ProbeRecord { at: Instant::now(), ok });
    }

    async fn connect_once(&self, ssid: &str, password: &str, security: SecurityType, timeout: Duration) -> Result<(), NetworkError> {
        let device = self.find_wifi_device().await?;
        let profile = self.ensure_profile(ssid, password, security).await?;
        let active = self.activate_and_wait(&profile, &device, timeout).await?;
        self.wait_for_ip(&active, timeout).await?;
        let probe_timeout = Duration::from_secs(10).min(timeout);
        if self.probe_liveness(probe_timeout).await {
            self.record_probe(true).await;
            Ok(())
        } else {
            self.record_probe(false).await;
            Err(NetworkError::ProbeFailed)
        }
    }
}

#[async_trait]
impl WifiTransport for NetworkManagerWifi {
    async fn connect(&self, ssid: &str, password: &str, security: SecurityType) -> Result<(), ConnectError> {
        let _guard = self.connection_lock.lock().await;

        if let Some(cached) = self.scan_cache.lock().await.fresh(Instant::now()) {
            if !cached.iter().any(|n| n.ssid == ssid) {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                return Err(NetworkError::NoSuchNetwork.into_connect_error());
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let failures = self.consecutive_failures.load(Ordering::SeqCst);
            let timeout = adaptive_timeout(failures);
            info!(ssid, attempt, timeout_secs = timeout.as_secs(), "attempting wifi connect");

            match self.connect_once(ssid, password, security, timeout).await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) if e.failure_kind() == ConnectFailureKind::UserCorrectable => {
                    warn!(ssid, error = %e, "wifi connect failed with a user-correctable error");
                    return Err(e.into_connect_error());
                }
                Err(e) => {
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                    if attempt > CONNECT_RETRIES {
                        warn!(ssid, error = %e, attempts = attempt, "wifi connect exhausted retries");
                        return Err(e.into_connect_error());
                    }
                    let delay = backoff_delay(attempt);
                    debug!(ssid, error = %e, delay_secs = delay.as_secs(), "retrying wifi connect after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn disconnect(&self) -> Result<(), WifiTransportError> {
        let _guard = self.connection_lock.lock().await;
        let nm = NetworkManagerProxy::new(&self.conn).await.map_err(|e| WifiTransportError(e.to_string()))?;
        let primary = nm.primary_connection().await.map_err(|e| WifiTransportError(e.to_string()))?;
        if primary.as_str() != "/" {
            nm.deactivate_connection(primary.as_ref()).await.map_err(|e| WifiTransportError(e.to_string()))?;
        }
        *self.last_probe.lock().await = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.last_probe
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| p.ok && p.at.elapsed() < PROBE_FRESHNESS)
    }

    async fn scan(&self) -> Result<Vec<String>, WifiTransportError> {
        let mut cache = self.scan_cache.lock().await;
        let now = Instant::now();
        if let Some(cached) = cache.fresh(now) {
            return Ok(cached.iter().map(|n| n.ssid.clone()).collect());
        }

        let networks = self.run_scan().await.map_err(|e| WifiTransportError(e.to_string()))?;
        let ssids = networks.iter().map(|n| n.ssid.clone()).collect();
        cache.store(now, networks);
        Ok(ssids)
    }
}

impl NetworkManagerWifi {
    async fn run_scan(&self) -> Result<Vec<NetworkInfo>, NetworkError> {
        let nm = NetworkManagerProxy::new(&self.conn).await?;
        let mut networks = Vec::new();

        for dev_path in nm.get_all_devices().await? {
            let dev = DeviceProxy::builder(&self.conn).path(dev_path.clone())?.build().await?;
            if dev.device_type().await.unwrap_or(0) != NM_DEVICE_TYPE_WIFI {
                continue;
            }

            let wireless = WirelessProxy::builder(&self.conn).path(dev_path.clone())?.build().await?;
            if let Err(e) = wireless.request_scan(HashMap::new()).await {
                debug!(error = %e, "nm declined wifi rescan request, using cached networks");
            }

            for ap_path in wireless.get_all_access_points().await.unwrap_or_default() {
                let ap = AccessPointProxy::builder(&self.conn).path(ap_path)?.build().await?;
                let ssid = String::from_utf8_lossy(&ap.ssid().await.unwrap_or_default()).into_owned();
                if ssid.is_empty() {
                    continue;
                }
                let bssid = ap.hw_address().await.unwrap_or_default();
                let strength_pct = ap.strength().await.unwrap_or(0);
                let wpa = ap.wpa_flags().await.unwrap_or(0);
                let rsn = ap.rsn_flags().await.unwrap_or(0);
                networks.push(NetworkInfo {
                    ssid,
                    bssid,
                    signal_pct: strength_pct,
                    security: classify_security(wpa, rsn),
                });
            }
        }

        Ok(networks)
    }

    /// Signal quality for the currently active connection, for C12's health
    /// probe; not part of `WifiTransport` since it is an enrichment the
    /// teacher's original trait surface has no slot for.
    pub async fn quality(&self) -> Result<Option<u8>, NetworkError> {
        let device = match self.find_wifi_device().await {
            Ok(d) => d,
            Err(NetworkError::NoWifiDevice) => return Ok(None),
            Err(e) => return Err(e),
        };
        let wireless = WirelessProxy::builder(&self.conn).path(device)?.build().await?;
        let active_ap = wireless.active_access_point().await?;
        if active_ap.as_str() == "/" {
            return Ok(None);
        }
        let ap = AccessPointProxy::builder(&self.conn).path(active_ap)?.build().await?;
        Ok(ap.strength().await.ok())
    }
}

/// Best-effort classification; no key-mgmt bits set at all on an RSN/WPA IE
/// reads as open, matching how NetworkManager itself treats unflagged APs.
fn classify_security(wpa_flags: u32, rsn_flags: u32) -> SecurityType {
    const KEY_MGMT_PSK: u32 = 0x00000100;
    const KEY_MGMT_802_1X: u32 = 0x00000200;
    const KEY_MGMT_SAE: u32 = 0x00000400;

    if rsn_flags & KEY_MGMT_SAE != 0 {
        SecurityType::Wpa3
    } else if rsn_flags & KEY_MGMT_802_1X != 0 || wpa_flags & KEY_MGMT_802_1X != 0 {
        SecurityType::Enterprise
    } else if rsn_flags & KEY_MGMT_PSK != 0 || wpa_flags & KEY_MGMT_PSK != 0 {
        SecurityType::Wpa2
    } else {
        SecurityType::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_classification_prefers_sae_over_psk() {
        let sae_and_psk = 0x00000100 | 0x00000400;
        assert_eq!(classify_security(0, sae_and_psk), SecurityType::Wpa3);
    }

    #[test]
    fn security_classification_defaults_to_open() {
        assert_eq!(classify_security(0, 0), SecurityType::Open);
    }

    #[test]
    fn connect_error_kind_matches_taxonomy() {
        assert_eq!(NetworkError::BadCredentials.failure_kind(), ConnectFailureKind::UserCorrectable);
        assert_eq!(NetworkError::AuthFailed.failure_kind(), ConnectFailureKind::UserCorrectable);
        assert_eq!(NetworkError::Timeout.failure_kind(), ConnectFailureKind::Transient);
        assert_eq!(NetworkError::DhcpFailed.failure_kind(), ConnectFailureKind::Transient);
        assert_eq!(NetworkError::ProbeFailed.failure_kind(), ConnectFailureKind::Transient);
        assert_eq!(NetworkError::NoSuchNetwork.failure_kind(), ConnectFailureKind::Transient);
    }
}
