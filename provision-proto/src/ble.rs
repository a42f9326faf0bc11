//! BLE GATT service protocol constants for Rock Pi Wi-Fi provisioning.
//!
//! This module defines the GATT service/characteristic UUIDs, the
//! `C_STATUS` wire encoding, and the `C_CONTROL` opcode bytes. These are
//! fixed 128-bit values and must remain stable across releases so that a
//! companion app built against one firmware version keeps working against
//! another.

/// Provisioning service UUID.
pub const SERVICE_UUID: &str = "b40e2000-5e7c-1c3e-0000-000000000000";

/// `C_INFO`: read-only device-info JSON (no secrets).
pub const INFO_UUID: &str = "b40e2001-5e7c-1c3e-0000-000000000000";

/// `C_STATUS`: read + notify, current provisioning state and epoch.
pub const STATUS_UUID: &str = "b40e2002-5e7c-1c3e-0000-000000000000";

/// `C_HANDSHAKE`: write + notify, authenticated key-agreement exchange.
pub const HANDSHAKE_UUID: &str = "b40e2003-5e7c-1c3e-0000-000000000000";

/// `C_CREDENTIALS`: write-only, encrypted `CredentialMessage`.
pub const CREDENTIALS_UUID: &str = "b40e2004-5e7c-1c3e-0000-000000000000";

/// `C_CONTROL`: write, session/reset control opcodes.
pub const CONTROL_UUID: &str = "b40e2005-5e7c-1c3e-0000-000000000000";

/// Current protocol version, carried in `C_INFO` and the credentials frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length in bytes of the server-issued handshake challenge.
pub const CHALLENGE_LEN: usize = 32;
/// Length in bytes of the client-supplied handshake nonce.
pub const PEER_NONCE_LEN: usize = 32;
/// Length in bytes of the HMAC-SHA256 tag over `challenge || peer_nonce`.
pub const HANDSHAKE_MAC_LEN: usize = 32;
/// Single byte notified back on handshake success.
pub const HANDSHAKE_ACK: u8 = 0x01;

/// `C_STATUS` wire-code for each `ProvisioningState` variant.
///
/// `Ready` (see `provision_core::ProvisioningState`) intentionally has no
/// code here: no transition in the state machine ever produces it, so the
/// encoder has nothing to encode. Encoding it is a programming error in the
/// orchestrator, not a wire-format gap.
pub mod state_code {
    pub const INITIALIZING: u8 = 0;
    pub const OWNER_SETUP: u8 = 1;
    pub const PROVISIONING: u8 = 2;
    pub const CONNECTING: u8 = 3;
    pub const CONNECTED: u8 = 4;
    pub const ERROR: u8 = 5;
    pub const FACTORY_RESET: u8 = 6;
}

/// `C_CONTROL` opcodes.
pub mod control {
    /// Tear down the current BLE session without waiting for idle timeout.
    pub const CLEAR_SESSION: u8 = 0x01;
    /// Request a factory reset. Requires an authenticated session when
    /// `control_requires_auth` is set (the default).
    pub const FACTORY_RESET: u8 = 0x02;
}

/// Encode the 2-byte `C_STATUS` value: `state_code(1) || epoch(1 mod 256)`.
pub fn encode_status(state_code: u8, epoch: u64) -> [u8; 2] {
    [state_code, (epoch % 256) as u8]
}

/// Decode a `C_STATUS` value back into `(state_code, epoch_mod_256)`.
pub fn decode_status(bytes: &[u8]) -> Option<(u8, u8)> {
    if bytes.len() != 2 {
        return None;
    }
    Some((bytes[0], bytes[1]))
}
