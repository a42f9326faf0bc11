//! State Machine (C9): authoritative provisioning state and the guarded
//! transition table. This type only computes transitions and records
//! history; applying the resulting effects against real components is the
//! Orchestrator's job (§4.10).

use std::collections::VecDeque;

use crate::events::{ConnectFailureKind, ErrorKind, Event};
use crate::records::now_unix;

pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    Initializing,
    OwnerSetup,
    /// Reachable in the wire protocol's status-code encoding for forward
    /// compatibility, but never constructed by this state machine.
    Ready,
    Provisioning,
    Connecting,
    Connected,
    Error { kind: ErrorKind },
    FactoryReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StartBle,
    StopBle,
    RestartAdvertising,
    ShowQrSetup,
    ShowQrProvision,
    ShowError,
    ShowSuccess,
    AttemptConnect,
    RetryConnect,
    AttemptReconnect,
    NotifyCredentialFailure,
    PersistWifiProfile,
    ClearAll,
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: ProvisioningState,
    pub event_name: &'static str,
    pub to: ProvisioningState,
    pub at: u64,
}

/// Guard context consulted on `InitComplete` (§4.9), assembled by the
/// Orchestrator from the Ownership Service and Config Store before the first
/// transition is attempted.
#[derive(Debug, Clone, Copy)]
pub struct InitGuards {
    pub owner_required: bool,
    pub owner_present: bool,
    pub wifi_profile_present: bool,
}

/// Authoritative provisioning state plus a bounded transition history.
pub struct StateMachine {
    state: ProvisioningState,
    history: VecDeque<TransitionRecord>,
    history_capacity: usize,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            state: ProvisioningState::Initializing,
            history: VecDeque::with_capacity(history_capacity.min(256)),
            history_capacity,
        }
    }

    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Apply `event` against the current state. Returns `None` (event
    /// ignored, state unchanged, nothing recorded) if no row in the
    /// transition table matches; otherwise returns the ordered effects for
    /// the Orchestrator to execute.
    pub fn apply(&mut self, event: &Event, guards: InitGuards) -> Option<Vec<Effect>> {
        let from = self.state.clone();
        let (to, effects, name): (ProvisioningState, Vec<Effect>, &'static str) = match (&self.state, event) {
            (ProvisioningState::Initializing, Event::InitComplete) => {
                if guards.wifi_profile_present {
                    (ProvisioningState::Connecting, vec![Effect::AttemptConnect], "InitComplete")
                } else if guards.owner_required && !guards.owner_present {
                    (ProvisioningState::OwnerSetup, vec![Effect::StartBle, Effect::ShowQrSetup], "InitComplete")
                } else {
                    (ProvisioningState::Provisioning, vec![Effect::StartBle, Effect::ShowQrProvision], "InitComplete")
                }
            }
            (ProvisioningState::OwnerSetup, Event::OwnerRegistered) => {
                (ProvisioningState::Provisioning, vec![Effect::ShowQrProvision], "OwnerRegistered")
            }
            (ProvisioningState::OwnerSetup, Event::SetupTimeout) => (
                ProvisioningState::Error { kind: ErrorKind::OwnerSetupTimeout },
                vec![Effect::ShowError],
                "SetupTimeout",
            ),
            (ProvisioningState::Provisioning, Event::CredentialsReceived { valid, .. }) => {
                if *valid {
                    (ProvisioningState::Connecting, vec![Effect::StopBle, Effect::AttemptConnect], "CredentialsReceived")
                } else {
                    (ProvisioningState::Provisioning, vec![Effect::NotifyCredentialFailure], "CredentialsReceived")
                }
            }
            (ProvisioningState::Connecting, Event::Connected) => (
                ProvisioningState::Connected,
                vec![Effect::PersistWifiProfile, Effect::ShowSuccess, Effect::StopBle],
                "Connected",
            ),
            (ProvisioningState::Connecting, Event::ConnectFailed { kind: ConnectFailureKind::UserCorrectable }) => {
                (ProvisioningState::Provisioning, vec![Effect::RestartAdvertising], "ConnectFailed")
            }
            (ProvisioningState::Connecting, Event::ConnectFailed { kind: ConnectFailureKind::Transient }) => {
                (ProvisioningState::Connecting, vec![Effect::RetryConnect], "ConnectFailed")
            }
            (ProvisioningState::Connected, Event::NetworkLost) => {
                (ProvisioningState::Connecting, vec![Effect::AttemptReconnect], "NetworkLost")
            }
            (ProvisioningState::Connected, Event::ReprovisionRequested) => {
                (ProvisioningState::Provisioning, vec![Effect::StartBle], "ReprovisionRequested")
            }
            // "any" rows: matched last so a more specific row above always wins.
            (_, Event::ResetRequested) => (ProvisioningState::FactoryReset, vec![Effect::ClearAll], "ResetRequested"),
            (_, Event::FatalError { kind }) => (
                ProvisioningState::Error { kind: kind.clone() },
                vec![Effect::ShowError],
                "FatalError",
            ),
            _ => return None,
        };

        self.record(from, name, to.clone());
        self.state = to;
        Some(effects)
    }

    /// The other half of the `ResetRequested` row's effect: once `ClearAll`
    /// has durably succeeded, the reset completes by moving on to
    /// `Initializing` (spec: "clear all, then → Initializing", S-E). Not
    /// triggered by any externally-visible event, so it is a direct state
    /// transition rather than a table row, but it is still recorded in
    /// history like any other one.
    pub fn complete_factory_reset(&mut self) {
        let from = self.state.clone();
        debug_assert_eq!(from, ProvisioningState::FactoryReset, "complete_factory_reset called outside FactoryReset");
        self.record(from, "FactoryResetComplete", ProvisioningState::Initializing);
        self.state = ProvisioningState::Initializing;
    }

    /// Forces the authoritative state to `Error` outside the normal
    /// transition table, for callers (the Orchestrator) that discover a
    /// durability failure after `apply()` already committed some other
    /// transition. Keeps `state()` from ever diverging from what gets
    /// announced on the bus.
    pub fn force_error(&mut self, kind: ErrorKind) {
        let from = self.state.clone();
        self.record(from, "ConfigEffectFailed", ProvisioningState::Error { kind: kind.clone() });
        self.state = ProvisioningState::Error { kind };
    }

    fn record(&mut self, from: ProvisioningState, event_name: &'static str, to: ProvisioningState) {
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            event_name,
            to,
            at: now_unix(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision_proto::SecurityType;

    fn guards(owner_required: bool, owner_present: bool, wifi_present: bool) -> InitGuards {
        InitGuards { owner_required, owner_present, wifi_profile_present: wifi_present }
    }

    #[test]
    fn init_complete_goes_to_owner_setup_when_required_and_absent() {
        let mut sm = StateMachine::new();
        let effects = sm.apply(&Event::InitComplete, guards(true, false, false)).unwrap();
        assert_eq!(*sm.state(), ProvisioningState::OwnerSetup);
        assert!(effects.contains(&Effect::StartBle));
    }

    #[test]
    fn init_complete_goes_to_provisioning_when_owner_present() {
        let mut sm = StateMachine::new();
        sm.apply(&Event::InitComplete, guards(true, true, false)).unwrap();
        assert_eq!(*sm.state(), ProvisioningState::Provisioning);
    }

    #[test]
    fn init_complete_goes_straight_to_connecting_with_saved_profile() {
        let mut sm = StateMachine::new();
        let effects = sm.apply(&Event::InitComplete, guards(true, true, true)).unwrap();
        assert_eq!(*sm.state(), ProvisioningState::Connecting);
        assert_eq!(effects, vec![Effect::AttemptConnect]);
    }

    #[test]
    fn credentials_received_invalid_stays_in_provisioning() {
        let mut sm = StateMachine::new();
        sm.apply(&Event::InitComplete, guards(false, false, false)).unwrap();
        let effects = sm
            .apply(
                &Event::CredentialsReceived {
                    ssid: "Home".into(),
                    password: "x".into(),
                    security: SecurityType::Wpa2,
                    valid: false,
                },
                guards(false, false, false),
            )
            .unwrap();
        assert_eq!(*sm.state(), ProvisioningState::Provisioning);
        assert_eq!(effects, vec![Effect::NotifyCredentialFailure]);
    }

    #[test]
    fn full_happy_path_traverses_to_connected() {
        let mut sm = StateMachine::new();
        let g = guards(false, false, false);
        sm.apply(&Event::InitComplete, g).unwrap();
        sm.apply(
            &Event::CredentialsReceived {
                ssid: "Home".into(),
                password: "goodpass123".into(),
                security: SecurityType::Wpa2,
                valid: true,
            },
            g,
        )
        .unwrap();
        assert_eq!(*sm.state(), ProvisioningState::Connecting);
        sm.apply(&Event::Connected, g).unwrap();
        assert_eq!(*sm.state(), ProvisioningState::Connected);
        assert_eq!(sm.history().count(), 3);
    }

    #[test]
    fn reset_requested_wins_from_any_state() {
        let mut sm = StateMachine::new();
        sm.apply(&Event::InitComplete, guards(false, false, false)).unwrap();
        let effects = sm.apply(&Event::ResetRequested, guards(false, false, false)).unwrap();
        assert_eq!(*sm.state(), ProvisioningState::FactoryReset);
        assert_eq!(effects, vec![Effect::ClearAll]);
    }

    #[test]
    fn complete_factory_reset_moves_on_to_initializing() {
        let mut sm = StateMachine::new();
        sm.apply(&Event::InitComplete, guards(false, false, false)).unwrap();
        sm.apply(&Event::ResetRequested, guards(false, false, false)).unwrap();
        assert_eq!(*sm.state(), ProvisioningState::FactoryReset);
        sm.complete_factory_reset();
        assert_eq!(*sm.state(), ProvisioningState::Initializing);
    }

    #[test]
    fn force_error_overrides_whatever_state_apply_last_committed() {
        let mut sm = StateMachine::new();
        let g = guards(false, false, false);
        sm.apply(&Event::InitComplete, g).unwrap();
        sm.apply(
            &Event::CredentialsReceived { ssid: "Home".into(), password: "goodpass123".into(), security: SecurityType::Wpa2, valid: true },
            g,
        )
        .unwrap();
        sm.apply(&Event::Connected, g).unwrap();
        assert_eq!(*sm.state(), ProvisioningState::Connected);

        sm.force_error(ErrorKind::Storage);
        assert_eq!(*sm.state(), ProvisioningState::Error { kind: ErrorKind::Storage });
    }

    #[test]
    fn unmatched_event_is_ignored() {
        let mut sm = StateMachine::new();
        assert!(sm.apply(&Event::Connected, guards(false, false, false)).is_none());
        assert_eq!(*sm.state(), ProvisioningState::Initializing);
        assert_eq!(sm.history().count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let mut sm = StateMachine::with_history_capacity(2);
        let g = guards(false, false, false);
        sm.apply(&Event::InitComplete, g).unwrap();
        sm.apply(&Event::ReprovisionRequested, g); // ignored: not Connected
        sm.apply(
            &Event::CredentialsReceived {
                ssid: "A".into(),
                password: "x".into(),
                security: SecurityType::Wpa2,
                valid: true,
            },
            g,
        )
        .unwrap();
        sm.apply(&Event::Connected, g).unwrap();
        assert!(sm.history().count() <= 2);
    }
}
