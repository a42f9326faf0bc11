//! Health/Watchdog (C12): periodic liveness probes of C5/C6/C7. Emits
//! recovery events; takes no direct corrective action itself (§4.12).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::bus::EventBus;
use crate::events::Event;
use crate::state_machine::ProvisioningState;
use crate::transport::{BleTransport, WifiTransport};

fn saturating_increment(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_add(1)));
}

/// Plain in-process counters, not a metrics-exporter integration — readable
/// by tests and a future status endpoint (§3a).
#[derive(Debug, Default)]
pub struct WatchdogCounters {
    pub ble_restarts: AtomicU64,
    pub display_reinits: AtomicU64,
    pub network_reprobes: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub probe_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { probe_interval: Duration::from_secs(30) }
    }
}

/// Probes BLE advertising, display health, and the network link against the
/// currently observed `ProvisioningState`, publishing a recovery event for
/// each inconsistency found.
pub struct Watchdog {
    config: WatchdogConfig,
    counters: Arc<WatchdogCounters>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self { config, counters: Arc::new(WatchdogCounters::default()) }
    }

    pub fn counters(&self) -> Arc<WatchdogCounters> {
        self.counters.clone()
    }

    /// Runs until the caller's task is cancelled. Tracks state via
    /// `StateChanged` events rather than reading the state machine directly,
    /// so this component needs no lock on it.
    pub async fn run(
        &self,
        bus: &EventBus,
        ble: Arc<dyn BleTransport>,
        wifi: Arc<dyn WifiTransport>,
        display_health: Arc<AtomicBool>,
    ) {
        let subscription = bus.subscribe();
        let mut state = ProvisioningState::Initializing;
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.tick().await; // first tick is immediate; skip so the first probe waits a full interval

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    if let Event::StateChanged { to, .. } = event {
                        state = to;
                    }
                }
                _ = interval.tick() => {
                    self.probe(bus, &state, ble.as_ref(), wifi.as_ref(), &display_health).await;
                }
            }
        }
    }

    async fn probe(
        &self,
        bus: &EventBus,
        state: &ProvisioningState,
        ble: &dyn BleTransport,
        wifi: &dyn WifiTransport,
        display_health: &AtomicBool,
    ) {
        let should_advertise = matches!(state, ProvisioningState::OwnerSetup | ProvisioningState::Provisioning);
        if should_advertise && !ble.is_advertising().await {
            saturating_increment(&self.counters.ble_restarts);
            warn!("BLE advertising expected but not active");
            bus.publish(Event::BleRestartNeeded);
        }

        if !display_health.load(Ordering::Relaxed) {
            saturating_increment(&self.counters.display_reinits);
            warn!("display service unresponsive");
            bus.publish(Event::DisplayReinitNeeded);
        }

        let should_be_connected = matches!(state, ProvisioningState::Connected);
        let actually_connected = wifi.is_connected().await;
        if should_be_connected != actually_connected {
            saturating_increment(&self.counters.network_reprobes);
            warn!(should_be_connected, actually_connected, "network link status inconsistent with state");
            bus.publish(Event::NetworkReprobeNeeded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    use crate::transport::{BleTransportError, ConnectError, WifiTransportError};
    use provision_proto::SecurityType;

    struct FakeBle {
        advertising: StdAtomicBool,
    }

    #[async_trait]
    impl BleTransport for FakeBle {
        async fn start_advertising(&self) -> Result<(), BleTransportError> {
            self.advertising.store(true, Ordering::Relaxed);
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
        connected: StdAtomicBool,
    }

    #[async_trait]
    impl WifiTransport for FakeWifi {
        async fn connect(&self, _ssid: &str, _password: &str, _security: SecurityType) -> Result<(), ConnectError> {
            self.connected.store(true, Ordering::Relaxed);
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), WifiTransportError> {
            self.connected.store(false, Ordering::Relaxed);
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
        async fn scan(&self) -> Result<Vec<String>, WifiTransportError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn probe_flags_missing_advertising_in_provisioning() {
        let watchdog = Watchdog::new(WatchdogConfig::default());
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let ble = FakeBle { advertising: StdAtomicBool::new(false) };
        let wifi = FakeWifi { connected: StdAtomicBool::new(false) };
        let display_health = Arc::new(AtomicBool::new(true));

        watchdog
            .probe(&bus, &ProvisioningState::Provisioning, &ble, &wifi, &display_health)
            .await;

        assert_eq!(watchdog.counters().ble_restarts.load(Ordering::Relaxed), 1);
        assert_eq!(sub.recv().await.name(), "BleRestartNeeded");
    }

    #[tokio::test]
    async fn probe_is_silent_when_everything_matches_expectations() {
        let watchdog = Watchdog::new(WatchdogConfig::default());
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(1);
        let ble = FakeBle { advertising: StdAtomicBool::new(true) };
        let wifi = FakeWifi { connected: StdAtomicBool::new(false) };
        let display_health = Arc::new(AtomicBool::new(true));

        watchdog
            .probe(&bus, &ProvisioningState::Provisioning, &ble, &wifi, &display_health)
            .await;

        assert_eq!(watchdog.counters().ble_restarts.load(Ordering::Relaxed), 0);
        assert_eq!(watchdog.counters().network_reprobes.load(Ordering::Relaxed), 0);
        assert_eq!(sub.stats().queued, 0);
    }

    #[tokio::test]
    async fn probe_flags_network_mismatch() {
        let watchdog = Watchdog::new(WatchdogConfig::default());
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let ble = FakeBle { advertising: StdAtomicBool::new(false) };
        let wifi = FakeWifi { connected: StdAtomicBool::new(false) };
        let display_health = Arc::new(AtomicBool::new(true));

        watchdog.probe(&bus, &ProvisioningState::Connected, &ble, &wifi, &display_health).await;
        assert_eq!(sub.recv().await.name(), "NetworkReprobeNeeded");
    }
}
