//! Hardware abstraction traits. `provision-core`'s control-plane logic is
//! written entirely against these traits so it never references a concrete
//! BLE stack, D-Bus client, framebuffer, or GPIO chip — that lets the
//! Orchestrator, State Machine, and reset-hold logic run under test with
//! fakes instead of real hardware.

use async_trait::async_trait;

use crate::events::ConnectFailureKind;
use crate::records::SecurityType;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct BleTransportError(pub String);

/// Binds `C6`'s advertising lifecycle (§4.6). Session/handshake/credential
/// handling is owned by the concrete BLE crate itself, which publishes
/// events directly onto the bus; the Orchestrator only needs to start and
/// stop advertising and keep `C_STATUS` current.
#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn start_advertising(&self) -> Result<(), BleTransportError>;
    async fn stop_advertising(&self) -> Result<(), BleTransportError>;
    async fn is_advertising(&self) -> bool;
    /// Pushes a `C_STATUS` notification: `state_code` plus the monotonic
    /// `status_epoch` (§6.1).
    async fn notify_status(&self, state_code: u8, epoch: u8) -> Result<(), BleTransportError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ConnectError {
    pub kind: ConnectFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct WifiTransportError(pub String);

/// Binds `C7`'s connect/disconnect/scan surface (§4.7).
#[async_trait]
pub trait WifiTransport: Send + Sync {
    async fn connect(&self, ssid: &str, password: &str, security: SecurityType) -> Result<(), ConnectError>;
    async fn disconnect(&self) -> Result<(), WifiTransportError>;
    async fn is_connected(&self) -> bool;
    /// Visible SSIDs, most recently scanned.
    async fn scan(&self) -> Result<Vec<String>, WifiTransportError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DisplayTransportError {
    /// No HDMI/framebuffer driver present, or it faulted. Non-fatal: the
    /// Orchestrator logs and continues with BLE as the primary channel.
    #[error("display unavailable: {0}")]
    Unavailable(String),
}

/// Binds `C5` (§4.5). No interactivity, no return value carries state.
#[async_trait]
pub trait DisplayTransport: Send + Sync {
    async fn show_qr(&self, payload: &str, status_text: &str) -> Result<(), DisplayTransportError>;
    async fn show_status(&self, text: &str) -> Result<(), DisplayTransportError>;
    async fn clear(&self) -> Result<(), DisplayTransportError>;
}

/// Binds the reset line's raw electrical state for `C8` (§6.3). Debounce and
/// hold-timing live in `reset_monitor`, not here — this trait is a single
/// synchronous GPIO register read, matching how `rppal::gpio::InputPin`
/// behaves in practice (no syscall, no blocking).
pub trait ResetLine: Send + Sync {
    /// `true` when the line reads as physically pressed (post-polarity,
    /// i.e. already accounting for active-low wiring).
    fn is_asserted(&self) -> bool;
}
