//! BLE GATT Server (C6, §4.6): advertises the provisioning service over
//! BlueZ, handles the authenticated handshake and credential exchange, and
//! implements `provision_core::BleTransport` so the Orchestrator can start
//! and stop advertising without knowing the underlying Bluetooth stack.
//!
//! Mirrors the shape of the reference Improv-WiFi BLE provisioning service:
//! a single `bluer::gatt::local::Application` with per-characteristic
//! read/write/notify closures, registered against BlueZ's GATT manager over
//! D-Bus. This generalizes the teacher's embedded, single-peripheral
//! `bhumi_mcu::ble::BleServer` trait to an async, multi-characteristic host
//! GATT server.

pub mod session;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify, CharacteristicNotifyMethod,
    CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest,
    ReqError, Service,
};
use bluer::adv::AdvertisementHandle;
use bluer::{Adapter, Session as BluerSession};
use provision_core::transport::{BleTransport, BleTransportError};
use provision_core::validator::{validate_password, validate_ssid};
use provision_core::{AuthResult, Event, EventBus, ErrorKind, OwnershipService};
use provision_proto::ble::{self, control, state_code};
use provision_proto::credentials::DeviceInfo;
use tokio::sync::watch;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use session::{SessionError, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error(transparent)]
    Bluer(#[from] bluer::Error),
    #[error("invalid GATT UUID constant: {0}")]
    BadUuid(String),
}

impl From<BleError> for BleTransportError {
    fn from(e: BleError) -> Self {
        BleTransportError(e.to_string())
    }
}

struct Inner {
    device_id: String,
    mac: String,
    fw_version: String,
    bus: Arc<EventBus>,
    ownership: Arc<OwnershipService>,
    sessions: AsyncMutex<SessionManager>,
    status_notify: watch::Sender<Vec<u8>>,
    handshake_notify: watch::Sender<Vec<u8>>,
    state_code: AtomicU8,
    epoch: AtomicU8,
}

/// Bluez-backed `BleTransport`, plus the live GATT session/handshake logic
/// that the Orchestrator never sees (it only starts/stops advertising and
/// pushes status notifications through the trait).
pub struct BluerBleServer {
    adapter: Adapter,
    _dbus_session: BluerSession,
    app_handle: AsyncMutex<Option<ApplicationHandle>>,
    adv_handle: AsyncMutex<Option<AdvertisementHandle>>,
    inner: Arc<Inner>,
}

impl BluerBleServer {
    pub async fn new(
        bus: Arc<EventBus>,
        ownership: Arc<OwnershipService>,
        device_id: String,
        mac: String,
        fw_version: String,
        pairing_secret: Vec<u8>,
    ) -> Result<Self, BleError> {
        let dbus_session = BluerSession::new().await?;
        let adapter = dbus_session.default_adapter().await?;
        adapter.set_powered(true).await?;
        let (status_notify, _) = watch::channel(Vec::new());
        let (handshake_notify, _) = watch::channel(Vec::new());
        let inner = Arc::new(Inner {
            device_id,
            mac,
            fw_version,
            bus,
            ownership,
            sessions: AsyncMutex::new(SessionManager::new(pairing_secret)),
            status_notify,
            handshake_notify,
            state_code: AtomicU8::new(state_code::INITIALIZING),
            epoch: AtomicU8::new(0),
        });
        Ok(Self {
            adapter,
            _dbus_session: dbus_session,
            app_handle: AsyncMutex::new(None),
            adv_handle: AsyncMutex::new(None),
            inner,
        })
    }

    /// Registers the GATT application with BlueZ. Idempotent: a second call
    /// while already registered is a no-op.
    async fn ensure_application(&self) -> Result<(), BleError> {
        let mut guard = self.app_handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let app = build_application(self.inner.clone())?;
        let handle = self.adapter.serve_gatt_application(app).await?;
        *guard = Some(handle);
        Ok(())
    }

    /// Background sweep that clears idle BLE sessions (§4.6: 5 min idle
    /// timeout). Intended to be spawned once at startup.
    pub async fn run_idle_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let mut sessions = self.inner.sessions.lock().await;
            if sessions.sweep_idle(std::time::Instant::now()) {
                info!("BLE session idle timeout expired, session cleared");
            }
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, BleError> {
    s.parse().map_err(|_| BleError::BadUuid(s.to_string()))
}

/// Forwards every update on `rx` to `notifier` until the peer unsubscribes
/// (`notifier.notify` returning an error, per BlueZ's notify-session
/// lifecycle).
async fn forward_notifications(notifier: CharacteristicNotifier, mut rx: watch::Receiver<Vec<u8>>) {
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        let value = rx.borrow_and_update().clone();
        if notifier.notify(value).await.is_err() {
            return;
        }
    }
}

fn build_application(inner: Arc<Inner>) -> Result<Application, BleError> {
    let info_uuid = parse_uuid(ble::INFO_UUID)?;
    let status_uuid = parse_uuid(ble::STATUS_UUID)?;
    let handshake_uuid = parse_uuid(ble::HANDSHAKE_UUID)?;
    let credentials_uuid = parse_uuid(ble::CREDENTIALS_UUID)?;
    let control_uuid = parse_uuid(ble::CONTROL_UUID)?;

    let info_read = {
        let inner = inner.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |_req: CharacteristicReadRequest| {
                let inner = inner.clone();
                Box::pin(async move { Ok(read_device_info(&inner)) })
            }),
            ..Default::default()
        }
    };

    let status_read = {
        let inner = inner.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |_req: CharacteristicReadRequest| {
                let inner = inner.clone();
                Box::pin(async move { Ok(ble::encode_status(inner.state_code.load(Ordering::Relaxed), inner.epoch.load(Ordering::Relaxed) as u64).to_vec()) })
            }),
            ..Default::default()
        }
    };
    let status_notify = {
        let rx = inner.status_notify.subscribe();
        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier: CharacteristicNotifier| {
                let rx = rx.clone();
                Box::pin(forward_notifications(notifier, rx))
            })),
            ..Default::default()
        }
    };

    // The challenge is delivered on read rather than notify: a client reads
    // `C_HANDSHAKE` to obtain a freshly minted session + challenge, then
    // writes its nonce/MAC response to the same characteristic. Notify is
    // reserved for the post-verification ack.
    let handshake_read = {
        let inner = inner.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let inner = inner.clone();
                let peer = req.device_address.to_string();
                Box::pin(async move {
                    let challenge = inner.sessions.lock().await.begin_session(&peer);
                    Ok(challenge.to_vec())
                })
            }),
            ..Default::default()
        }
    };
    let handshake_write = {
        let inner = inner.clone();
        CharacteristicWrite {
            write: true,
            write_without_response: false,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                let inner = inner.clone();
                let peer = req.device_address.to_string();
                Box::pin(async move { handle_handshake_write(&inner, &value, &peer).await })
            })),
            ..Default::default()
        }
    };
    let handshake_notify = {
        let rx = inner.handshake_notify.subscribe();
        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier: CharacteristicNotifier| {
                let rx = rx.clone();
                Box::pin(forward_notifications(notifier, rx))
            })),
            ..Default::default()
        }
    };

    let credentials_write = {
        let inner = inner.clone();
        CharacteristicWrite {
            write: true,
            write_without_response: false,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                let inner = inner.clone();
                let peer = req.device_address.to_string();
                Box::pin(async move { handle_credentials_write(&inner, &value, &peer).await })
            })),
            ..Default::default()
        }
    };

    let control_write = {
        let inner = inner.clone();
        CharacteristicWrite {
            write: true,
            write_without_response: false,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                let inner = inner.clone();
                let peer = req.device_address.to_string();
                Box::pin(async move { handle_control_write(&inner, &value, &peer).await })
            })),
            ..Default::default()
        }
    };

    Ok(Application {
        services: vec![Service {
            uuid: parse_uuid(ble::SERVICE_UUID)?,
            primary: true,
            characteristics: vec![
                Characteristic { uuid: info_uuid, read: Some(info_read), ..Default::default() },
                Characteristic { uuid: status_uuid, read: Some(status_read), notify: Some(status_notify), ..Default::default() },
                Characteristic { uuid: handshake_uuid, read: Some(handshake_read), write: Some(handshake_write), notify: Some(handshake_notify), ..Default::default() },
                Characteristic { uuid: credentials_uuid, write: Some(credentials_write), ..Default::default() },
                Characteristic { uuid: control_uuid, write: Some(control_write), ..Default::default() },
            ],
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn read_device_info(inner: &Inner) -> Vec<u8> {
    let info = DeviceInfo {
        device_id: inner.device_id.clone(),
        mac: inner.mac.clone(),
        proto_version: ble::PROTOCOL_VERSION,
        fw_version: inner.fw_version.clone(),
    };
    serde_json::to_vec(&info).unwrap_or_default()
}

async fn handle_handshake_write(inner: &Arc<Inner>, value: &[u8], peer: &str) -> Result<(), ReqError> {
    let now = std::time::Instant::now();
    let mut sessions = inner.sessions.lock().await;
    if sessions.is_rate_limited(peer, now) {
        warn!(peer, "handshake rejected: peer is rate limited");
        return Err(ReqError::Failed);
    }
    match sessions.handshake(value) {
        Ok(()) => {
            drop(sessions);
            debug!(peer, "BLE handshake succeeded");
            let _ = inner.handshake_notify.send(vec![ble::HANDSHAKE_ACK]);
            Ok(())
        }
        Err(e) => {
            sessions.record_failure(peer, now);
            warn!(peer, error = %e, "BLE handshake failed");
            Err(ReqError::Failed)
        }
    }
}

/// Folds the "PIN ok or PIN not required" half of the `CredentialsReceived`
/// guard: no owner registered means the device hasn't been claimed yet, so
/// no PIN can be demanded of the provisioning client.
fn pin_ok(inner: &Inner, pin: Option<&str>) -> bool {
    if !inner.ownership.has_owner() {
        return true;
    }
    match pin {
        Some(p) => matches!(inner.ownership.authenticate(p), Ok(AuthResult::Success)),
        None => false,
    }
}

async fn handle_credentials_write(inner: &Arc<Inner>, value: &[u8], peer: &str) -> Result<(), ReqError> {
    let now = std::time::Instant::now();
    let mut sessions = inner.sessions.lock().await;
    if sessions.is_rate_limited(peer, now) {
        return Err(ReqError::Failed);
    }
    match sessions.decrypt_credentials(value) {
        Ok(mut message) => {
            drop(sessions);
            let valid = validate_ssid(&message.ssid).is_ok()
                && validate_password(&message.password, message.security).is_ok()
                && pin_ok(inner, message.pin.as_deref());
            inner.bus.publish(Event::CredentialsReceived {
                ssid: message.ssid.clone(),
                password: message.password.clone(),
                security: message.security,
                valid,
            });
            message.zeroize_in_place();
            Ok(())
        }
        Err(e) => {
            sessions.record_failure(peer, now);
            warn!(peer, error = %e, "BLE credentials write rejected");
            if matches!(e, SessionError::NotAuthenticated) {
                return Err(ReqError::NotAuthorized);
            }
            Err(ReqError::Failed)
        }
    }
}

async fn handle_control_write(inner: &Arc<Inner>, value: &[u8], _peer: &str) -> Result<(), ReqError> {
    let Some(&opcode) = value.first() else {
        return Err(ReqError::Failed);
    };
    let mut sessions = inner.sessions.lock().await;
    match opcode {
        control::CLEAR_SESSION => {
            sessions.clear_session();
            Ok(())
        }
        control::FACTORY_RESET => {
            let authenticated = sessions.is_authenticated();
            drop(sessions);
            if !authenticated {
                return Err(ReqError::NotAuthorized);
            }
            inner.bus.publish(Event::ResetRequested);
            Ok(())
        }
        _ => Err(ReqError::NotSupported),
    }
}

#[async_trait]
impl BleTransport for BluerBleServer {
    async fn start_advertising(&self) -> Result<(), BleTransportError> {
        self.ensure_application().await.map_err(BleTransportError::from)?;
        let mut guard = self.adv_handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let service_uuid = parse_uuid(ble::SERVICE_UUID).map_err(BleTransportError::from)?;
        let advertisement = Advertisement {
            service_uuids: vec![service_uuid].into_iter().collect(),
            local_name: Some(format!("rockpi-{}", &self.inner.device_id[..self.inner.device_id.len().min(8)])),
            discoverable: Some(true),
            ..Default::default()
        };
        let handle = self.adapter.advertise(advertisement).await.map_err(|e| BleTransportError(e.to_string()))?;
        *guard = Some(handle);
        info!("BLE advertising started");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleTransportError> {
        let mut guard = self.adv_handle.lock().await;
        *guard = None;
        info!("BLE advertising stopped");
        Ok(())
    }

    async fn is_advertising(&self) -> bool {
        self.adv_handle.lock().await.is_some()
    }

    async fn notify_status(&self, state_code: u8, epoch: u8) -> Result<(), BleTransportError> {
        self.inner.state_code.store(state_code, Ordering::Relaxed);
        self.inner.epoch.store(epoch, Ordering::Relaxed);
        let payload = ble::encode_status(state_code, epoch as u64).to_vec();
        let _ = self.inner.status_notify.send(payload);
        Ok(())
    }
}

/// Maps a `ConnectFailureKind`-bearing BLE rejection to the `C_CONTROL`
/// notify-failure path the Orchestrator's `NotifyCredentialFailure` effect
/// approximates via `notify_status` (see `provision_core::orchestrator`).
pub fn credential_failure_kind(error: &SessionError) -> ErrorKind {
    match error {
        SessionError::NotAuthenticated | SessionError::HandshakeFailed => ErrorKind::Ble,
        _ => ErrorKind::Other(error.to_string()),
    }
}
