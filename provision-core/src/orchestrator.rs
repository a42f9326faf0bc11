//! Orchestrator (C10): wires the bus to the state machine and applies the
//! transition table's effects against the real components (§4.10).
//!
//! Effects are applied to targets in the deterministic order BLE → Network
//! → Display → Config (§5). Config-store effects (`PersistWifiProfile`,
//! `ClearAll`) are awaited before `StateChanged` is published, since the
//! testable properties require the Wi-Fi profile on disk before `Connected`
//! is observable; BLE/Network/Display effects only need to be *initiated*
//! before that point, so they run on spawned tasks guarded by a per-target
//! lock that refuses to start a second effect while one is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use provision_proto::ble::state_code;

use crate::bus::EventBus;
use crate::events::{ErrorKind, Event};
use crate::ownership::OwnershipService;
use crate::records::{DeviceIdentity, SecurityType, WifiProfile};
use crate::state_machine::{Effect, InitGuards, ProvisioningState, StateMachine};
use crate::store::ConfigStore;
use crate::transport::{BleTransport, DisplayTransport, WifiTransport};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub ble_effect_timeout: Duration,
    pub network_effect_timeout: Duration,
    pub display_effect_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ble_effect_timeout: Duration::from_secs(5),
            network_effect_timeout: Duration::from_secs(30),
            display_effect_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Ble,
    Network,
    Display,
    Config,
}

fn component_of(effect: Effect) -> Component {
    match effect {
        Effect::StartBle | Effect::StopBle | Effect::RestartAdvertising | Effect::NotifyCredentialFailure => Component::Ble,
        Effect::AttemptConnect | Effect::RetryConnect | Effect::AttemptReconnect => Component::Network,
        Effect::ShowQrSetup | Effect::ShowQrProvision | Effect::ShowError | Effect::ShowSuccess => Component::Display,
        Effect::PersistWifiProfile | Effect::ClearAll => Component::Config,
    }
}

fn component_priority(c: Component) -> u8 {
    match c {
        Component::Ble => 0,
        Component::Network => 1,
        Component::Display => 2,
        Component::Config => 3,
    }
}

/// `C_STATUS`'s wire code for a state. `Ready` is never constructed by this
/// state machine, so it intentionally has no arm; hitting it is a bug.
fn wire_state_code(state: &ProvisioningState) -> u8 {
    match state {
        ProvisioningState::Initializing => state_code::INITIALIZING,
        ProvisioningState::OwnerSetup => state_code::OWNER_SETUP,
        ProvisioningState::Ready => unreachable!("Ready is never constructed by the state machine"),
        ProvisioningState::Provisioning => state_code::PROVISIONING,
        ProvisioningState::Connecting => state_code::CONNECTING,
        ProvisioningState::Connected => state_code::CONNECTED,
        ProvisioningState::Error { .. } => state_code::ERROR,
        ProvisioningState::FactoryReset => state_code::FACTORY_RESET,
    }
}

struct PendingWifi {
    ssid: String,
    password: String,
    security: SecurityType,
}

pub struct Orchestrator {
    state_machine: StateMachine,
    bus: Arc<EventBus>,
    store: Arc<ConfigStore>,
    ownership: Arc<OwnershipService>,
    identity: DeviceIdentity,
    ble: Arc<dyn BleTransport>,
    wifi: Arc<dyn WifiTransport>,
    display: Arc<dyn DisplayTransport>,
    display_health: Arc<AtomicBool>,
    config: OrchestratorConfig,

    ble_lock: Arc<AsyncMutex<()>>,
    network_lock: Arc<AsyncMutex<()>>,
    display_lock: Arc<AsyncMutex<()>>,

    status_epoch: u64,
    pending_wifi: Option<PendingWifi>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<ConfigStore>,
        ownership: Arc<OwnershipService>,
        identity: DeviceIdentity,
        ble: Arc<dyn BleTransport>,
        wifi: Arc<dyn WifiTransport>,
        display: Arc<dyn DisplayTransport>,
        display_health: Arc<AtomicBool>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            state_machine: StateMachine::new(),
            bus,
            store,
            ownership,
            identity,
            ble,
            wifi,
            display,
            display_health,
            config,
            ble_lock: Arc::new(AsyncMutex::new(())),
            network_lock: Arc::new(AsyncMutex::new(())),
            display_lock: Arc::new(AsyncMutex::new(())),
            status_epoch: 0,
            pending_wifi: None,
        }
    }

    pub fn state(&self) -> &ProvisioningState {
        self.state_machine.state()
    }

    /// Kicks off the daemon's first transition. Must be called once, after
    /// every component is wired.
    pub fn start(&self) {
        self.bus.publish(Event::InitComplete);
    }

    /// Consumes bus events until the caller's task is cancelled.
    pub async fn run(mut self) {
        let subscription = self.bus.subscribe();
        loop {
            let event = subscription.recv().await;
            self.handle_event(event).await;
        }
    }

    fn guards(&self) -> InitGuards {
        InitGuards {
            owner_required: self.ownership.owner_required(),
            owner_present: self.ownership.has_owner(),
            wifi_profile_present: self.store.load_wifi().is_some(),
        }
    }

    async fn handle_event(&mut self, event: Event) {
        self.update_pending_wifi(&event);

        let old_state = self.state_machine.state().clone();
        let guards = self.guards();
        let Some(mut effects) = self.state_machine.apply(&event, guards) else {
            return;
        };
        let mut new_state = self.state_machine.state().clone();

        effects.sort_by_key(|e| component_priority(component_of(*e)));

        // Config effects run to completion before anything is announced:
        // durability precedes observability (§8 property 4).
        let mut config_effects = Vec::new();
        let mut other_effects = Vec::new();
        for effect in effects {
            if component_of(effect) == Component::Config {
                config_effects.push(effect);
            } else {
                other_effects.push(effect);
            }
        }

        // Whether ClearAll ran to completion, meaning the reset's "then ->
        // Initializing" half (spec: the ResetRequested row's effect is
        // "clear all, then -> Initializing") still needs to happen.
        let mut reset_cleared = false;

        for effect in config_effects {
            match self.run_config_effect(effect).await {
                Ok(()) => {
                    if matches!(effect, Effect::ClearAll) {
                        reset_cleared = true;
                    }
                }
                Err(kind) => {
                    warn!(?kind, "config effect failed, forcing a fatal transition");
                    // self.state_machine's own state was already moved by
                    // apply() above (e.g. to Connected); force it to Error
                    // too so state() never diverges from what's announced.
                    self.state_machine.force_error(kind.clone());
                    new_state = ProvisioningState::Error { kind };
                    reset_cleared = false;
                    // The in-flight transport effects no longer apply to a
                    // state we are about to abandon.
                    other_effects.clear();
                }
            }
        }

        for effect in other_effects {
            self.dispatch(effect);
        }

        self.announce(old_state, new_state.clone());

        if reset_cleared {
            self.state_machine.complete_factory_reset();
            let initializing = self.state_machine.state().clone();
            self.announce(new_state, initializing);
            // Factory reset proceeds straight back through the normal boot
            // sequence (S-A or owner-required rules), same as a cold boot.
            Box::pin(self.handle_event(Event::InitComplete)).await;
        }
    }

    fn announce(&mut self, from: ProvisioningState, to: ProvisioningState) {
        self.status_epoch = self.status_epoch.wrapping_add(1);
        self.notify_status(&to);
        self.bus.publish(Event::StateChanged { from, to });
    }

    fn update_pending_wifi(&mut self, event: &Event) {
        match event {
            Event::InitComplete => {
                if let Some(profile) = self.store.load_wifi() {
                    self.pending_wifi = Some(PendingWifi {
                        ssid: profile.ssid,
                        password: profile.password,
                        security: profile.security_type,
                    });
                }
            }
            Event::CredentialsReceived { ssid, password, security, valid: true } => {
                self.pending_wifi = Some(PendingWifi { ssid: ssid.clone(), password: password.clone(), security: *security });
            }
            Event::ResetRequested => {
                self.pending_wifi = None;
            }
            _ => {}
        }
    }

    async fn run_config_effect(&self, effect: Effect) -> Result<(), ErrorKind> {
        match effect {
            Effect::PersistWifiProfile => {
                let Some(pending) = &self.pending_wifi else {
                    error!("PersistWifiProfile effect fired with no pending profile");
                    return Err(ErrorKind::Storage);
                };
                let profile = WifiProfile::new(pending.ssid.clone(), pending.password.clone(), pending.security);
                self.store.store_wifi(&profile).map_err(|e| {
                    error!(error = %e, "failed to persist wifi profile");
                    ErrorKind::Storage
                })
            }
            Effect::ClearAll => {
                self.store.clear_all().map_err(|e| {
                    error!(error = %e, "failed to clear config store on factory reset");
                    ErrorKind::Storage
                })?;
                self.ownership.clear_owner().map_err(|e| {
                    error!(error = %e, "failed to clear owner on factory reset");
                    ErrorKind::Storage
                })
            }
            _ => unreachable!("non-config effect routed to run_config_effect"),
        }
    }

    fn dispatch(&self, effect: Effect) {
        match component_of(effect) {
            Component::Ble => self.dispatch_ble(effect),
            Component::Network => self.dispatch_network(effect),
            Component::Display => self.dispatch_display(effect),
            Component::Config => unreachable!("config effects never reach dispatch"),
        }
    }

    fn dispatch_ble(&self, effect: Effect) {
        let lock = self.ble_lock.clone();
        let ble = self.ble.clone();
        let timeout = self.config.ble_effect_timeout;
        tokio::spawn(async move {
            let Ok(_guard) = lock.try_lock() else {
                warn!("BLE effect skipped, a previous one is still in flight");
                return;
            };
            let result = tokio::time::timeout(timeout, async {
                match effect {
                    Effect::StartBle | Effect::RestartAdvertising => ble.start_advertising().await,
                    Effect::StopBle => ble.stop_advertising().await,
                    Effect::NotifyCredentialFailure => ble.notify_status(state_code::PROVISIONING, 0).await,
                    _ => unreachable!(),
                }
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "BLE effect failed"),
                Err(_) => warn!("BLE effect timed out"),
            }
        });
    }

    fn dispatch_network(&self, effect: Effect) {
        let lock = self.network_lock.clone();
        let wifi = self.wifi.clone();
        let bus = self.bus.clone();
        let timeout = self.config.network_effect_timeout;
        let pending = self.pending_wifi.as_ref().map(|p| (p.ssid.clone(), p.password.clone(), p.security));
        tokio::spawn(async move {
            let Ok(_guard) = lock.try_lock() else {
                warn!("network effect skipped, a previous one is still in flight");
                return;
            };
            let Some((ssid, password, security)) = pending else {
                warn!(?effect, "network effect fired with no pending wifi profile");
                return;
            };
            let result = tokio::time::timeout(timeout, wifi.connect(&ssid, &password, security)).await;
            match result {
                Ok(Ok(())) => bus.publish(Event::Connected),
                Ok(Err(e)) => bus.publish(Event::ConnectFailed { kind: e.kind }),
                Err(_) => bus.publish(Event::ConnectFailed { kind: crate::events::ConnectFailureKind::Transient }),
            }
        });
    }

    fn dispatch_display(&self, effect: Effect) {
        let lock = self.display_lock.clone();
        let display = self.display.clone();
        let display_health = self.display_health.clone();
        let timeout = self.config.display_effect_timeout;
        let qr_payload = self.identity.qr_payload.clone();
        tokio::spawn(async move {
            let Ok(_guard) = lock.try_lock() else {
                warn!("display effect skipped, a previous one is still in flight");
                return;
            };
            let result = tokio::time::timeout(timeout, async {
                match effect {
                    Effect::ShowQrSetup => display.show_qr(&qr_payload, "Register an owner to continue").await,
                    Effect::ShowQrProvision => display.show_qr(&qr_payload, "Waiting for Wi-Fi credentials").await,
                    Effect::ShowSuccess => display.show_status("Connected").await,
                    Effect::ShowError => display.show_status("Error - see logs").await,
                    _ => unreachable!(),
                }
            })
            .await;
            match result {
                Ok(Ok(())) => display_health.store(true, Ordering::Relaxed),
                Ok(Err(e)) => {
                    warn!(error = %e, "display effect failed");
                    display_health.store(false, Ordering::Relaxed);
                }
                Err(_) => {
                    warn!("display effect timed out");
                    display_health.store(false, Ordering::Relaxed);
                }
            }
        });
    }

    fn notify_status(&self, state: &ProvisioningState) {
        if matches!(state, ProvisioningState::Ready) {
            return;
        }
        let code = wire_state_code(state);
        let epoch = (self.status_epoch % 256) as u8;
        let ble = self.ble.clone();
        tokio::spawn(async move {
            if let Err(e) = ble.notify_status(code, epoch).await {
                warn!(error = %e, "failed to notify C_STATUS");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::OwnershipConfig;
    use crate::transport::{BleTransportError, ConnectError, DisplayTransportError, WifiTransportError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{sleep, timeout};

    struct FakeBle {
        advertising: AtomicBool,
        started: AtomicU32,
    }

    #[async_trait]
    impl BleTransport for FakeBle {
        async fn start_advertising(&self) -> Result<(), BleTransportError> {
            self.advertising.store(true, Ordering::Relaxed);
            self.started.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn stop_advertising(&self) -> Result<(), BleTransportError> {
            self.advertising.store(false, Ordering::Relaxed);
            Ok(())
        }
        async fn is_advertising(&self) -> bool {
            self.advertising.load(Ordering::Relaxed)
        }
        async fn notify_status(&self, _state_code: u8, _epoch: u8) -> Result<(), BleTransportError> {
            Ok(())
        }
    }

    struct FakeWifi {
        should_succeed: bool,
    }

    #[async_trait]
    impl WifiTransport for FakeWifi {
        async fn connect(&self, _ssid: &str, _password: &str, _security: SecurityType) -> Result<(), ConnectError> {
            if self.should_succeed {
                Ok(())
            } else {
                Err(ConnectError { kind: crate::events::ConnectFailureKind::UserCorrectable, message: "bad password".into() })
            }
        }
        async fn disconnect(&self) -> Result<(), WifiTransportError> {
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            self.should_succeed
        }
        async fn scan(&self) -> Result<Vec<String>, WifiTransportError> {
            Ok(vec![])
        }
    }

    struct FakeDisplay;

    #[async_trait]
    impl DisplayTransport for FakeDisplay {
        async fn show_qr(&self, _payload: &str, _status_text: &str) -> Result<(), DisplayTransportError> {
            Ok(())
        }
        async fn show_status(&self, _text: &str) -> Result<(), DisplayTransportError> {
            Ok(())
        }
        async fn clear(&self) -> Result<(), DisplayTransportError> {
            Ok(())
        }
    }

    fn make_orchestrator(dir: &std::path::Path, wifi_ok: bool) -> Orchestrator {
        let store = Arc::new(ConfigStore::open(dir).unwrap());
        let ownership = Arc::new(OwnershipService::new(
            store.clone(),
            OwnershipConfig { owner_required: false, ..OwnershipConfig::default() },
        ));
        let identity = DeviceIdentity::new("dev-1".into(), "aa:bb:cc:dd:ee:ff".into());
        Orchestrator::new(
            Arc::new(EventBus::new()),
            store,
            ownership,
            identity,
            Arc::new(FakeBle { advertising: AtomicBool::new(false), started: AtomicU32::new(0) }),
            Arc::new(FakeWifi { should_succeed: wifi_ok }),
            Arc::new(FakeDisplay),
            Arc::new(AtomicBool::new(true)),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn clean_boot_reaches_connected_on_valid_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = make_orchestrator(dir.path(), true);
        let observer = orch.bus.subscribe();

        orch.handle_event(Event::InitComplete).await;
        assert_eq!(*orch.state(), ProvisioningState::Provisioning);

        orch.handle_event(Event::CredentialsReceived {
            ssid: "HomeWifi".into(),
            password: "goodpass123".into(),
            security: SecurityType::Wpa2,
            valid: true,
        })
        .await;
        assert_eq!(*orch.state(), ProvisioningState::Connecting);

        // The network effect runs on a spawned task; give it a moment.
        let connected = timeout(Duration::from_secs(1), async {
            loop {
                let event = observer.recv().await;
                if let Event::Connected = event {
                    break;
                }
            }
        })
        .await;
        assert!(connected.is_ok(), "expected a Connected event from the spawned network effect");

        orch.handle_event(Event::Connected).await;
        assert_eq!(*orch.state(), ProvisioningState::Connected);
        assert!(orch.store.load_wifi().is_some(), "profile must be persisted before Connected");
    }

    #[tokio::test]
    async fn auto_reconnect_uses_saved_profile_without_ble() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = make_orchestrator(dir.path(), true);
        orch.store
            .store_wifi(&WifiProfile::new("HomeWifi".into(), "goodpass123".into(), SecurityType::Wpa2))
            .unwrap();

        orch.handle_event(Event::InitComplete).await;
        assert_eq!(*orch.state(), ProvisioningState::Connecting);
    }

    #[tokio::test]
    async fn factory_reset_clears_store_and_returns_to_initializing_flow() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = make_orchestrator(dir.path(), true);
        orch.store
            .store_wifi(&WifiProfile::new("HomeWifi".into(), "goodpass123".into(), SecurityType::Wpa2))
            .unwrap();

        orch.handle_event(Event::ResetRequested).await;
        assert!(orch.store.load_wifi().is_none());
        // owner_required is false in this fixture and the profile was just
        // cleared, so InitComplete's guards route straight to Provisioning
        // rather than stopping in FactoryReset or OwnerSetup.
        assert_eq!(*orch.state(), ProvisioningState::Provisioning);
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn config_effect_failure_forces_the_real_state_machine_into_error() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut orch = make_orchestrator(dir.path(), true);

        orch.handle_event(Event::InitComplete).await;
        assert_eq!(*orch.state(), ProvisioningState::Provisioning);

        // Make the store root unwritable so PersistWifiProfile fails durably
        // once CredentialsReceived drives the machine to Connecting.
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();

        orch.handle_event(Event::CredentialsReceived {
            ssid: "HomeWifi".into(),
            password: "goodpass123".into(),
            security: SecurityType::Wpa2,
            valid: true,
        })
        .await;
        assert_eq!(*orch.state(), ProvisioningState::Connecting);

        orch.handle_event(Event::Connected).await;

        // self.state() must report Error, not the stale Connected that
        // apply() committed before the PersistWifiProfile effect failed.
        assert_eq!(*orch.state(), ProvisioningState::Error { kind: ErrorKind::Storage });

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[tokio::test]
    async fn factory_reset_with_owner_required_lands_in_owner_setup() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path()).unwrap());
        let ownership = Arc::new(OwnershipService::new(store.clone(), OwnershipConfig { owner_required: true, ..OwnershipConfig::default() }));
        let identity = DeviceIdentity::new("dev-1".into(), "aa:bb:cc:dd:ee:ff".into());
        let mut orch = Orchestrator::new(
            Arc::new(EventBus::new()),
            store,
            ownership,
            identity,
            Arc::new(FakeBle { advertising: AtomicBool::new(false), started: AtomicU32::new(0) }),
            Arc::new(FakeWifi { should_succeed: true }),
            Arc::new(FakeDisplay),
            Arc::new(AtomicBool::new(true)),
            OrchestratorConfig::default(),
        );

        orch.handle_event(Event::ResetRequested).await;
        assert_eq!(*orch.state(), ProvisioningState::OwnerSetup);
        sleep(Duration::from_millis(10)).await;
    }
}
