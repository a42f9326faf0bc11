//! Event types carried on the bus (§3, §4.9, §4.11).

use provision_proto::SecurityType;

use crate::state_machine::ProvisioningState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    OwnerSetupTimeout,
    ConnectFailed,
    Ble,
    Network,
    Display,
    Storage,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    /// The user can fix this by re-entering credentials (bad password, SSID not found).
    UserCorrectable,
    /// Worth retrying without user involvement (DHCP timeout, transient association failure).
    Transient,
}

/// Everything that flows through the `EventBus`. Variants not listed for the
/// current state in `StateMachine::apply` are ignored (§4.9).
#[derive(Debug, Clone)]
pub enum Event {
    InitComplete,
    OwnerRegistered,
    SetupTimeout,
    /// Emitted only after decrypt → validate → (auth if a PIN was supplied)
    /// has already run; `valid` folds all of that into the single guard the
    /// transition table consults.
    CredentialsReceived {
        ssid: String,
        password: String,
        security: SecurityType,
        valid: bool,
    },
    Connected,
    ConnectFailed {
        kind: ConnectFailureKind,
    },
    NetworkLost,
    ReprovisionRequested,
    ResetRequested,
    FatalError {
        kind: ErrorKind,
    },
    StateChanged {
        from: ProvisioningState,
        to: ProvisioningState,
    },
    BleRestartNeeded,
    DisplayReinitNeeded,
    NetworkReprobeNeeded,
}

impl Event {
    /// `StateChanged` and `ResetRequested` are never-drop on the bus (§4.11);
    /// everything else tolerates oldest-drop under backpressure.
    pub fn is_critical(&self) -> bool {
        matches!(self, Event::StateChanged { .. } | Event::ResetRequested)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::InitComplete => "InitComplete",
            Event::OwnerRegistered => "OwnerRegistered",
            Event::SetupTimeout => "SetupTimeout",
            Event::CredentialsReceived { .. } => "CredentialsReceived",
            Event::Connected => "Connected",
            Event::ConnectFailed { .. } => "ConnectFailed",
            Event::NetworkLost => "NetworkLost",
            Event::ReprovisionRequested => "ReprovisionRequested",
            Event::ResetRequested => "ResetRequested",
            Event::FatalError { .. } => "FatalError",
            Event::StateChanged { .. } => "StateChanged",
            Event::BleRestartNeeded => "BleRestartNeeded",
            Event::DisplayReinitNeeded => "DisplayReinitNeeded",
            Event::NetworkReprobeNeeded => "NetworkReprobeNeeded",
        }
    }
}
