//! Provisioning control plane: persisted data model, config store, device
//! identity resolution, ownership/auth, validation, event bus, state
//! machine, orchestrator, and watchdog counters.

pub mod bus;
pub mod events;
pub mod identity;
pub mod orchestrator;
pub mod ownership;
pub mod records;
pub mod reset_monitor;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod validator;
pub mod watchdog;

pub use bus::{EventBus, EventBusStats, Subscription};
pub use events::{ConnectFailureKind, ErrorKind, Event};
pub use identity::{resolve as resolve_device_identity, IdentitySources};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use ownership::{AuthResult, OwnershipConfig, OwnershipError, OwnershipService};
pub use records::{DeviceIdentity, LockoutState, OwnerRecord, SecurityType, WifiProfile};
pub use reset_monitor::{ResetMonitor, ResetMonitorConfig};
pub use state_machine::{Effect, InitGuards, ProvisioningState, StateMachine, TransitionRecord};
pub use store::{ConfigStore, StorageError};
pub use transport::{BleTransport, BleTransportError, ConnectError, DisplayTransport, DisplayTransportError, ResetLine, WifiTransport, WifiTransportError};
pub use validator::ValidationError;
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogCounters};
